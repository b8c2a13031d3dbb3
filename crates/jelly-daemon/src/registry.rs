//! Client registry and event router.
//!
//! Connections are tracked by an integer transport key handed out at
//! accept; registrations bind a client-chosen identifier to a key once the
//! `register_client` frame arrives. Routing is by identifier, so an event
//! for a client that has gone away is simply dropped. All of this is owned
//! by the core task; connection tasks only hold the receiving half of
//! their outbound queue.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use jelly_proto::DaemonFrame;
use jelly_types::ZellijEnv;

/// Transport key, allocated per accepted connection.
pub type ClientKey = u64;

/// Outbound queue depth per client. Overflow drops the client rather than
/// stalling the daemon on a slow reader.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// What a registered client told us about itself.
#[derive(Debug, Clone)]
pub struct Registration {
    pub client_id: String,
    pub zellij_session: Option<String>,
    pub env: ZellijEnv,
}

/// Result of attempting to route a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No live registration for the identifier; the frame was dropped.
    NoSuchClient,
    /// The client's outbound queue is full; the caller must drop it.
    Overflow(ClientKey),
}

/// Two maps plus the pre-registration transport pool.
#[derive(Default)]
pub struct ClientRegistry {
    /// All connected transports, registered or not.
    transports: HashMap<ClientKey, mpsc::Sender<DaemonFrame>>,
    /// Registered transports only.
    registrations: HashMap<ClientKey, Registration>,
    /// Identifier to transport key; latest registration wins.
    by_client_id: HashMap<String, ClientKey>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted transport.
    pub fn connect(&mut self, key: ClientKey, outbound: mpsc::Sender<DaemonFrame>) {
        self.transports.insert(key, outbound);
    }

    /// Bind a registration to a transport key.
    ///
    /// Re-registering an identifier rebinds it to the new transport.
    pub fn register(&mut self, key: ClientKey, registration: Registration) {
        let client_id = registration.client_id.clone();
        if let Some(old_key) = self.by_client_id.insert(client_id.clone(), key) {
            if old_key != key {
                debug!(%client_id, old_key, new_key = key, "client identifier rebound");
            }
        }
        self.registrations.insert(key, registration);
    }

    /// Whether the transport has registered.
    pub fn is_registered(&self, key: ClientKey) -> bool {
        self.registrations.contains_key(&key)
    }

    /// Remove a transport and any registration bound to it.
    pub fn disconnect(&mut self, key: ClientKey) -> Option<Registration> {
        self.transports.remove(&key);
        let registration = self.registrations.remove(&key);
        if let Some(ref reg) = registration {
            // Only unmap the identifier if it still points at this key;
            // a rebinding may have moved it to a newer transport.
            if self.by_client_id.get(&reg.client_id) == Some(&key) {
                self.by_client_id.remove(&reg.client_id);
            }
        }
        registration
    }

    /// Route a frame to a registered client by identifier.
    pub fn send_to_client(&self, client_id: &str, frame: DaemonFrame) -> SendOutcome {
        let Some(&key) = self.by_client_id.get(client_id) else {
            debug!(%client_id, "dropping event for departed client");
            return SendOutcome::NoSuchClient;
        };
        self.send_to_key(key, frame)
    }

    /// Route a frame to a transport by key (used pre-registration for
    /// `error` replies).
    pub fn send_to_key(&self, key: ClientKey, frame: DaemonFrame) -> SendOutcome {
        let Some(tx) = self.transports.get(&key) else {
            return SendOutcome::NoSuchClient;
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key, "client outbound queue overflow");
                SendOutcome::Overflow(key)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::NoSuchClient,
        }
    }

    /// Broadcast a frame to every registered client. Returns the keys of
    /// clients whose queues overflowed; individual failures never abort the
    /// broadcast.
    pub fn broadcast(&self, frame: &DaemonFrame) -> Vec<ClientKey> {
        let mut overflowed = Vec::new();
        for &key in self.registrations.keys() {
            if let SendOutcome::Overflow(k) = self.send_to_key(key, frame.clone()) {
                overflowed.push(k);
            }
        }
        overflowed
    }

    /// Update a registration's last-seen session and environment, as chat
    /// requests advertise fresher context than registration did.
    pub fn update_context(
        &mut self,
        client_id: &str,
        zellij_session: Option<String>,
        env: Option<ZellijEnv>,
    ) {
        let Some(&key) = self.by_client_id.get(client_id) else {
            return;
        };
        if let Some(reg) = self.registrations.get_mut(&key) {
            if zellij_session.is_some() {
                reg.zellij_session = zellij_session;
            }
            if let Some(env) = env {
                reg.env = env.or_else(&reg.env);
            }
        }
    }

    /// Look up a registration by identifier.
    pub fn registration(&self, client_id: &str) -> Option<&Registration> {
        self.by_client_id
            .get(client_id)
            .and_then(|key| self.registrations.get(key))
    }

    /// Number of registered clients.
    pub fn registered_count(&self) -> usize {
        self.registrations.len()
    }

    /// Number of connected transports.
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }
}
