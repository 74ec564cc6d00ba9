use std::time::Duration;

use roomkit_protocol::{ActorId, Op, THROTTLE_RANGE_MS};
use roomkit_protocol::ClientMessage;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::error::RoomError;

/// Buffers local mutations and flushes them as at most three frames per
/// throttle window, in presence/storage/broadcast order (spec.md §4.2).
///
/// The flush deadline is rearmed from the *first* mutation after a flush,
/// not recomputed on every subsequent one, so a steady stream of edits still
/// flushes roughly every `throttle` instead of being pushed out forever.
/// The room's connection task owns the actual sleep; this type only tracks
/// when that sleep should fire next.
pub struct OutboundCoalescer {
    throttle: Duration,
    presence: Option<Map<String, Value>>,
    presence_targeted: Vec<(ActorId, Map<String, Value>)>,
    storage_ops: Vec<Op>,
    broadcast_events: Vec<Value>,
    deadline: Option<Instant>,
}

impl OutboundCoalescer {
    pub fn new(throttle_ms: u64) -> Result<Self, RoomError> {
        if !THROTTLE_RANGE_MS.contains(&throttle_ms) {
            return Err(RoomError::InvalidThrottle {
                value: throttle_ms,
                min: *THROTTLE_RANGE_MS.start(),
                max: *THROTTLE_RANGE_MS.end(),
            });
        }
        Ok(Self {
            throttle: Duration::from_millis(throttle_ms),
            presence: None,
            presence_targeted: Vec::new(),
            storage_ops: Vec::new(),
            broadcast_events: Vec::new(),
            deadline: None,
        })
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub fn is_dirty(&self) -> bool {
        self.presence.is_some() || !self.presence_targeted.is_empty() || !self.storage_ops.is_empty() || !self.broadcast_events.is_empty()
    }

    /// When the connection task's flush sleep should next fire, if anything
    /// is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.throttle);
        }
    }

    /// Merge a presence diff into the single pending presence buffer —
    /// latest value wins per key within a throttle window.
    pub fn queue_presence(&mut self, patch: Map<String, Value>) {
        self.arm();
        let buffer = self.presence.get_or_insert_with(Map::new);
        for (key, value) in patch {
            buffer.insert(key, value);
        }
    }

    pub fn queue_presence_resync(&mut self, target: ActorId, snapshot: Map<String, Value>) {
        self.arm();
        self.presence_targeted.push((target, snapshot));
    }

    pub fn queue_storage_ops(&mut self, ops: Vec<Op>) {
        if ops.is_empty() {
            return;
        }
        self.arm();
        self.storage_ops.extend(ops);
    }

    pub fn queue_broadcast(&mut self, event: Value) {
        self.arm();
        self.broadcast_events.push(event);
    }

    /// Drain every buffer into frames, in the fixed order presence → storage
    /// → broadcast, and clear the deadline until the next mutation rearms it.
    pub fn flush(&mut self) -> Vec<ClientMessage> {
        self.deadline = None;
        let mut frames = Vec::new();
        if let Some(data) = self.presence.take() {
            frames.push(ClientMessage::UpdatePresence { data, target_actor: None });
        }
        for (target, data) in self.presence_targeted.drain(..) {
            frames.push(ClientMessage::UpdatePresence { data, target_actor: Some(target) });
        }
        if !self.storage_ops.is_empty() {
            frames.push(ClientMessage::UpdateStorage { ops: std::mem::take(&mut self.storage_ops) });
        }
        for event in self.broadcast_events.drain(..) {
            frames.push(ClientMessage::BroadcastEvent { event });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rejects_throttle_outside_range() {
        assert!(OutboundCoalescer::new(10).is_err());
        assert!(OutboundCoalescer::new(5_000).is_err());
        assert!(OutboundCoalescer::new(100).is_ok());
    }

    #[test]
    fn flush_order_is_presence_then_storage_then_broadcast() {
        let mut c = OutboundCoalescer::new(100).unwrap();
        c.queue_broadcast(json!("ping"));
        c.queue_storage_ops(vec![]);
        c.queue_presence(Map::from_iter([("x".to_string(), json!(1))]));
        let frames = c.flush();
        assert!(matches!(frames[0], ClientMessage::UpdatePresence { .. }));
        assert!(matches!(frames[1], ClientMessage::BroadcastEvent { .. }));
    }

    #[test]
    fn presence_patches_merge_latest_wins() {
        let mut c = OutboundCoalescer::new(100).unwrap();
        c.queue_presence(Map::from_iter([("x".to_string(), json!(1))]));
        c.queue_presence(Map::from_iter([("x".to_string(), json!(2)), ("y".to_string(), json!(3))]));
        let frames = c.flush();
        match &frames[0] {
            ClientMessage::UpdatePresence { data, .. } => {
                assert_eq!(data.get("x"), Some(&json!(2)));
                assert_eq!(data.get("y"), Some(&json!(3)));
            },
            _ => panic!("expected presence frame"),
        }
    }

    #[test]
    fn flush_clears_dirty() {
        let mut c = OutboundCoalescer::new(100).unwrap();
        c.queue_broadcast(json!(1));
        assert!(c.is_dirty());
        c.flush();
        assert!(!c.is_dirty());
    }
}
