//! Background workspace tidy probe.
//!
//! On a timer, and only while the executor is idle, the daemon asks each
//! known session's butler for its cached workspace snapshot, applies two
//! cheap predicates, and only then spends a cheap-model call on concrete
//! suggestions: tab renames applied through the butler, plus at most one
//! free-text suggestion shown in a self-closing overlay. Heartbeat
//! failures never reach user-visible flow.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use jelly_types::ZellijEnv;

use crate::butler::{open_overlay, ButlerClient, ButlerError, WorkspaceSnapshot};
use crate::runtime::ModelRuntime;

/// Tab names zellij hands out by default; these are fair game for renames.
const DEFAULT_TAB_NAME_PATTERN: &str = r"^Tab #\d+$";

/// Tabs with more selectable panes than this are worth a look.
const CROWDED_PANE_THRESHOLD: usize = 4;

/// Heartbeat timing knobs.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Warm-up delay before the first tick.
    pub initial_delay: Duration,
    /// Cadence between ticks.
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(120),
            interval: Duration::from_secs(300),
            enabled: true,
        }
    }
}

/// What the cheap model is asked to return.
#[derive(Debug, Clone, Deserialize)]
pub struct TidyPlan {
    #[serde(default)]
    pub renames: Vec<TidyRename>,
    #[serde(default)]
    pub pane_renames: Vec<TidyPaneRename>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TidyRename {
    pub position: usize,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TidyPaneRename {
    pub pane_id: u32,
    pub name: String,
}

/// Whether a tab still carries its default name.
pub fn is_default_tab_name(name: &str) -> bool {
    // The pattern is a compile-time constant; a parse failure would be a
    // programmer error caught by tests.
    Regex::new(DEFAULT_TAB_NAME_PATTERN)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// Cheap predicates deciding whether a snapshot deserves a model call.
pub fn needs_tidy(snapshot: &WorkspaceSnapshot) -> bool {
    snapshot.tabs.iter().any(|tab| {
        is_default_tab_name(&tab.name) || tab.selectable_panes() > CROWDED_PANE_THRESHOLD
    })
}

/// The one-shot prompt sent to the cheap model.
pub fn build_tidy_prompt(snapshot: &WorkspaceSnapshot, now: chrono::DateTime<chrono::Local>) -> String {
    let tabs: Vec<serde_json::Value> = snapshot
        .tabs
        .iter()
        .map(|t| {
            serde_json::json!({
                "position": t.position,
                "name": t.name,
                "active": t.active,
                "selectable_panes": t.selectable_panes(),
            })
        })
        .collect();
    let panes: Vec<serde_json::Value> = snapshot
        .panes
        .iter()
        .filter(|p| !p.is_plugin && !p.exited)
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "tab_index": p.tab_index,
                "title": p.title,
                "command": p.terminal_command,
            })
        })
        .collect();

    format!(
        "You are a terminal workspace butler. It is {now}. Given this zellij \
         workspace state, propose short descriptive names for tabs that still \
         have default names (\"Tab #N\"), based on what runs in their panes. \
         You may also rename panes whose title is just the raw command line. \
         Optionally add one brief suggestion for reorganizing a crowded tab.\n\
         Workspace: {workspace}\n\
         Reply with strict JSON only, no prose: \
         {{\"renames\":[{{\"position\":<n>,\"name\":\"<short name>\"}}],\
         \"pane_renames\":[{{\"pane_id\":<n>,\"name\":\"<short name>\"}}],\
         \"suggestion\":\"<text or omit>\"}}",
        now = now.format("%Y-%m-%d %H:%M %Z"),
        workspace = serde_json::json!({ "tabs": tabs, "panes": panes }),
    )
}

/// One heartbeat pass over every known session.
///
/// Returns the session tags that should be forgotten (gone or timing out).
/// All other failures are logged and swallowed.
pub async fn run_tick(
    runtime: Arc<dyn ModelRuntime>,
    sessions: Vec<(String, ZellijEnv)>,
) -> Vec<String> {
    let mut drop_sessions = Vec::new();

    for (tag, env) in sessions {
        match tick_session(runtime.as_ref(), &tag, &env).await {
            Ok(()) => {}
            Err(TickError::SessionGone) => {
                info!(session = %tag, "dropping departed session from heartbeat");
                drop_sessions.push(tag);
            }
            Err(TickError::Skipped(reason)) => {
                debug!(session = %tag, %reason, "heartbeat skipped session");
            }
            Err(TickError::Failed(reason)) => {
                warn!(session = %tag, %reason, "heartbeat tick failed");
                if jelly_types::paths::trace_enabled() {
                    dump_butler_trace(&tag, &env).await;
                }
            }
        }
    }

    drop_sessions
}

/// Pull the butler's bounded trace ring into our trace log after a failed
/// tick, then clear it so the next dump starts fresh.
async fn dump_butler_trace(tag: &str, env: &ZellijEnv) {
    let butler = ButlerClient::new(env.clone());
    match butler.get_trace(Some(40)).await {
        Ok(entries) => {
            for line in &entries {
                debug!(session = %tag, trace = %line, "butler trace");
            }
            let _ = butler.clear_trace().await;
        }
        Err(e) => debug!(session = %tag, error = %e, "butler trace unavailable"),
    }
}

enum TickError {
    SessionGone,
    Skipped(String),
    Failed(String),
}

async fn tick_session(
    runtime: &dyn ModelRuntime,
    tag: &str,
    env: &ZellijEnv,
) -> Result<(), TickError> {
    let butler = ButlerClient::new(env.clone());

    let snapshot = match butler.get_state().await {
        Ok(snapshot) => snapshot,
        Err(ButlerError::NotReady(reason)) => return Err(TickError::Skipped(reason)),
        Err(ButlerError::Timeout) | Err(ButlerError::NoSession) => {
            return Err(TickError::SessionGone)
        }
        Err(e) => return Err(TickError::Failed(e.to_string())),
    };

    if !needs_tidy(&snapshot) {
        return Err(TickError::Skipped("workspace already tidy".into()));
    }

    let prompt = build_tidy_prompt(&snapshot, chrono::Local::now());
    let plan: TidyPlan = match runtime.complete_json(&prompt, env).await {
        Ok(value) => serde_json::from_value(value)
            .map_err(|e| TickError::Failed(format!("unparseable tidy plan: {e}")))?,
        Err(e) => return Err(TickError::Failed(e.to_string())),
    };

    if !plan.renames.is_empty() || !plan.pane_renames.is_empty() {
        // The model round-trip took real time; re-verify against fresh
        // state so a name the user chose meanwhile is never overwritten.
        let fresh = match butler.get_state().await {
            Ok(fresh) => fresh,
            Err(ButlerError::Timeout) | Err(ButlerError::NoSession) => {
                return Err(TickError::SessionGone)
            }
            Err(e) => return Err(TickError::Failed(e.to_string())),
        };

        for rename in &plan.renames {
            let Some(tab) = fresh.tabs.iter().find(|t| t.position == rename.position) else {
                debug!(session = %tag, position = rename.position, "rename target vanished");
                continue;
            };
            if !is_default_tab_name(&tab.name) {
                debug!(session = %tag, tab = %tab.name, "tab renamed by user; leaving it");
                continue;
            }
            if let Err(e) = butler.rename_tab(rename.position, &rename.name).await {
                warn!(session = %tag, error = %e, "tab rename failed");
            } else {
                info!(session = %tag, position = rename.position, name = %rename.name, "tab renamed");
            }
        }

        for rename in &plan.pane_renames {
            let Some(probed) = snapshot.panes.iter().find(|p| p.id == rename.pane_id) else {
                debug!(session = %tag, pane_id = rename.pane_id, "pane rename target unknown");
                continue;
            };
            let Some(current) = fresh.panes.iter().find(|p| p.id == rename.pane_id) else {
                debug!(session = %tag, pane_id = rename.pane_id, "pane rename target vanished");
                continue;
            };
            if current.is_plugin || current.exited {
                continue;
            }
            if current.title != probed.title {
                debug!(session = %tag, pane = %current.title, "pane retitled meanwhile; leaving it");
                continue;
            }
            if let Err(e) = butler.rename_pane(rename.pane_id, &rename.name).await {
                warn!(session = %tag, error = %e, "pane rename failed");
            } else {
                info!(session = %tag, pane_id = rename.pane_id, name = %rename.name, "pane renamed");
            }
        }
    }

    if let Some(ref suggestion) = plan.suggestion {
        if !suggestion.trim().is_empty() {
            if let Err(e) = open_overlay(env, suggestion).await {
                warn!(session = %tag, error = %e, "suggestion overlay failed");
            }
        }
    }

    Ok(())
}
