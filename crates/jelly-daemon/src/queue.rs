//! Global FIFO turn queue.
//!
//! One turn in flight at a time, machine-wide. The conversation state is a
//! single resume token and the model runtime is not safe to multiplex
//! within one conversation, so serialization here is the point, not a
//! bottleneck to engineer away.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use jelly_types::ZellijEnv;

/// One admitted `chat_request`, waiting for or occupying the executor.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub request_id: String,
    pub client_id: String,
    pub text: String,
    /// Session tag advertised at submission.
    pub zellij_session: Option<String>,
    /// Environment context captured at admission; tool subprocesses for
    /// this turn target this, not whatever the daemon inherited at birth.
    pub env: ZellijEnv,
    pub queued_at: DateTime<Utc>,
    /// Turns ahead of this one (in flight + pending) when it was admitted.
    /// Reported in `chat_start` as `queuedAhead`.
    pub queued_ahead: usize,
}

/// FIFO of pending turns plus the single busy slot.
#[derive(Default)]
pub struct TurnQueue {
    pending: VecDeque<TurnRequest>,
    busy: bool,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a request, recording how many turns are ahead of it.
    pub fn enqueue(
        &mut self,
        request_id: String,
        client_id: String,
        text: String,
        zellij_session: Option<String>,
        env: ZellijEnv,
    ) -> usize {
        let queued_ahead = self.pending.len() + usize::from(self.busy);
        self.pending.push_back(TurnRequest {
            request_id,
            client_id,
            text,
            zellij_session,
            env,
            queued_at: Utc::now(),
            queued_ahead,
        });
        queued_ahead
    }

    /// Take the head for execution. Returns `None` while a turn is in
    /// flight or the queue is empty.
    pub fn dequeue(&mut self) -> Option<TurnRequest> {
        if self.busy {
            return None;
        }
        let request = self.pending.pop_front()?;
        self.busy = true;
        Some(request)
    }

    /// Release the busy slot after `chat_end`.
    pub fn mark_idle(&mut self) {
        self.busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Pending turns not yet dequeued.
    pub fn depth(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(q: &mut TurnQueue, id: &str) -> usize {
        q.enqueue(
            id.into(),
            "c1".into(),
            "text".into(),
            None,
            ZellijEnv::default(),
        )
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = TurnQueue::new();
        enqueue(&mut q, "r1");
        enqueue(&mut q, "r2");
        enqueue(&mut q, "r3");

        assert_eq!(q.dequeue().unwrap().request_id, "r1");
        q.mark_idle();
        assert_eq!(q.dequeue().unwrap().request_id, "r2");
        q.mark_idle();
        assert_eq!(q.dequeue().unwrap().request_id, "r3");
    }

    #[test]
    fn one_turn_in_flight_at_a_time() {
        let mut q = TurnQueue::new();
        enqueue(&mut q, "r1");
        enqueue(&mut q, "r2");

        assert!(q.dequeue().is_some());
        assert!(q.is_busy());
        assert!(q.dequeue().is_none());

        q.mark_idle();
        assert_eq!(q.dequeue().unwrap().request_id, "r2");
    }

    #[test]
    fn queued_ahead_counts_in_flight_turn() {
        let mut q = TurnQueue::new();
        assert_eq!(enqueue(&mut q, "r1"), 0);

        let r1 = q.dequeue().unwrap();
        assert_eq!(r1.queued_ahead, 0);

        // r2 admitted while r1 is running: one ahead.
        assert_eq!(enqueue(&mut q, "r2"), 1);
        // r3 admitted behind r1 (running) and r2 (pending): two ahead.
        assert_eq!(enqueue(&mut q, "r3"), 2);

        q.mark_idle();
        assert_eq!(q.dequeue().unwrap().queued_ahead, 1);
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let mut q = TurnQueue::new();
        assert!(q.dequeue().is_none());
        assert!(!q.is_busy());
        assert_eq!(q.depth(), 0);
    }
}
