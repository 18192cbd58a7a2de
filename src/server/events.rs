//! Server-side event envelope: every event owned by a session carries that
//! session's id plus a monotonically increasing sequence number.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use wheelhouse_core_types::events::RunnerEvent;
use wheelhouse_core_types::SessionId;

/// Per-session sequence counters. Numbers start at 1 and only move forward;
/// observers may see gaps (other observers consumed numbers), never reversals.
#[derive(Default)]
pub(crate) struct SeqRegistry {
    counters: DashMap<SessionId, Arc<AtomicU64>>,
}

impl SeqRegistry {
    pub(crate) fn next(&self, session: &SessionId) -> u64 {
        let counter = self
            .counters
            .entry(session.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn forget(&self, session: &SessionId) {
        self.counters.remove(session);
    }
}

/// Wrap an already-typed event payload for one session.
pub(crate) fn envelope(seq: &SeqRegistry, session: &SessionId, mut payload: Value) -> Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert("session_id".to_string(), json!(session.to_string()));
        object.insert("seq".to_string(), json!(seq.next(session)));
    }
    payload
}

/// Build the enveloped wire form of a runner event.
pub(crate) fn runner_event(seq: &SeqRegistry, session: &SessionId, event: &RunnerEvent) -> Value {
    let payload = serde_json::to_value(event).unwrap_or_else(|_| {
        json!({ "type": "error", "error": "unserializable event" })
    });
    envelope(seq, session, payload)
}

/// Session-less error event (unknown action, missing session id).
pub(crate) fn bare_error(message: impl Into<String>) -> Value {
    json!({ "type": "error", "error": message.into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase_per_session() {
        let registry = SeqRegistry::default();
        let a = SessionId::new();
        let b = SessionId::new();
        assert_eq!(registry.next(&a), 1);
        assert_eq!(registry.next(&a), 2);
        assert_eq!(registry.next(&b), 1);
        assert_eq!(registry.next(&a), 3);
        registry.forget(&a);
        assert_eq!(registry.next(&a), 1);
    }

    #[test]
    fn envelope_adds_session_and_seq() {
        let registry = SeqRegistry::default();
        let session = SessionId::new();
        let event = runner_event(&registry, &session, &RunnerEvent::ScriptStopped);
        assert_eq!(event["type"], "script_stopped");
        assert_eq!(event["session_id"], session.to_string());
        assert_eq!(event["seq"], 1);
    }
}
