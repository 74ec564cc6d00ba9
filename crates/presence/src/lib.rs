//! Presence diffusion and broadcast fan-in (spec.md §4.5).
//!
//! Presence has no server-side history: this crate only ever holds the
//! latest known value per actor. Wire patches use JSON `null` to mean "this
//! key was removed" — JSON has no `undefined`, so `null` is the closest
//! analogue and is reserved for that purpose on the presence wire (ordinary
//! presence values should avoid storing a literal `null`).

use std::collections::HashMap;

use roomkit_protocol::ActorId;
use serde_json::{Map, Value};

/// A local presence edit: `Some(value)` sets the key, `None` deletes it.
/// The Rust equivalent of "merge this patch, where `undefined` means
/// delete" without JSON's `null`/`undefined` ambiguity.
pub type PresencePatch = HashMap<String, Option<Value>>;

/// Current presence for the local actor and every known remote actor.
#[derive(Debug, Clone, Default)]
pub struct PresenceState {
    local: Map<String, Value>,
    remote: HashMap<ActorId, Map<String, Value>>,
    resync_targets: Vec<ActorId>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> &Map<String, Value> {
        &self.local
    }

    pub fn remote(&self, actor: ActorId) -> Option<&Map<String, Value>> {
        self.remote.get(&actor)
    }

    pub fn remote_actors(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.remote.keys().copied()
    }

    /// Merge `patch` into local presence and return the wire-ready diff
    /// (deletions become `Value::Null`) to hand to the outbound coalescer.
    pub fn apply_local_patch(&mut self, patch: PresencePatch) -> Map<String, Value> {
        let mut wire = Map::with_capacity(patch.len());
        for (key, value) in patch {
            match value {
                Some(v) => {
                    self.local.insert(key.clone(), v.clone());
                    wire.insert(key, v);
                },
                None => {
                    self.local.remove(&key);
                    wire.insert(key, Value::Null);
                },
            }
        }
        wire
    }

    /// Merge a partial update received from the server for a remote actor.
    pub fn apply_remote_patch(&mut self, actor: ActorId, patch: Map<String, Value>) {
        let entry = self.remote.entry(actor).or_default();
        for (key, value) in patch {
            if value.is_null() {
                entry.remove(&key);
            } else {
                entry.insert(key, value);
            }
        }
    }

    /// A new peer joined: schedule a targeted full-presence resync for them
    /// on the next flush (spec.md §4.2 presence diffusion rule), since they
    /// have only ever seen diffs from before they connected.
    pub fn note_user_joined(&mut self, actor: ActorId) {
        self.remote.entry(actor).or_default();
        self.resync_targets.push(actor);
    }

    /// A peer disconnected: their presence entry is destroyed outright,
    /// presence has no history (spec.md §3).
    pub fn note_user_left(&mut self, actor: ActorId) {
        self.remote.remove(&actor);
        self.resync_targets.retain(|a| *a != actor);
    }

    /// Drain the actors owed a full presence resync since the last flush.
    pub fn take_resync_targets(&mut self) -> Vec<ActorId> {
        std::mem::take(&mut self.resync_targets)
    }

    /// The complete local presence, as sent for a targeted resync.
    pub fn full_snapshot(&self) -> Map<String, Value> {
        self.local.clone()
    }
}

/// An opaque broadcast payload. Delivery is at-most-once per connected
/// peer — a property of the underlying socket (no application-level
/// retransmission exists), not something tracked here.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent(pub Value);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn local_patch_merges_and_deletes() {
        let mut presence = PresenceState::new();
        let wire = presence.apply_local_patch(HashMap::from([("x".to_string(), Some(json!(1)))]));
        assert_eq!(wire.get("x"), Some(&json!(1)));
        assert_eq!(presence.local().get("x"), Some(&json!(1)));

        let wire = presence.apply_local_patch(HashMap::from([("x".to_string(), None)]));
        assert_eq!(wire.get("x"), Some(&Value::Null));
        assert!(presence.local().get("x").is_none());
    }

    #[test]
    fn remote_merge_is_commutative_per_actor() {
        let mut a = PresenceState::new();
        a.apply_remote_patch(ActorId(2), Map::from_iter([("a".to_string(), json!(1))]));
        a.apply_remote_patch(ActorId(2), Map::from_iter([("b".to_string(), json!(2))]));

        let mut b = PresenceState::new();
        b.apply_remote_patch(ActorId(2), Map::from_iter([("b".to_string(), json!(2))]));
        b.apply_remote_patch(ActorId(2), Map::from_iter([("a".to_string(), json!(1))]));

        assert_eq!(a.remote(ActorId(2)), b.remote(ActorId(2)));
    }

    #[test]
    fn user_joined_then_left_clears_and_cancels_resync() {
        let mut presence = PresenceState::new();
        presence.note_user_joined(ActorId(3));
        assert_eq!(presence.take_resync_targets(), vec![ActorId(3)]);

        presence.note_user_joined(ActorId(4));
        presence.note_user_left(ActorId(4));
        assert!(presence.take_resync_targets().is_empty());
        assert!(presence.remote(ActorId(4)).is_none());
    }

    #[test]
    fn remote_null_deletes_previously_set_key() {
        let mut presence = PresenceState::new();
        presence.apply_remote_patch(ActorId(1), Map::from_iter([("cursor".to_string(), json!([1, 2]))]));
        presence.apply_remote_patch(ActorId(1), Map::from_iter([("cursor".to_string(), Value::Null)]));
        assert!(presence.remote(ActorId(1)).unwrap().get("cursor").is_none());
    }

    use proptest::prelude::*;

    /// Patches are drawn from disjoint key namespaces (`a*` vs. `b*`) —
    /// commutativity only holds key-by-key; two patches racing to set the
    /// *same* key are a last-write-wins conflict, not a reordering.
    fn arb_patch(prefix: &'static str) -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::hash_map(format!("{prefix}[0-3]"), any::<i32>(), 0..4).prop_map(|m| m.into_iter().map(|(k, v)| (k, json!(v))).collect())
    }

    proptest! {
        /// Invariant 4: presence merge is commutative per actor — applying
        /// two disjoint patches in either order lands on the same record.
        #[test]
        fn remote_patch_order_never_affects_final_state(first in arb_patch("a"), second in arb_patch("b")) {
            let mut forward = PresenceState::new();
            forward.apply_remote_patch(ActorId(9), first.clone());
            forward.apply_remote_patch(ActorId(9), second.clone());

            let mut backward = PresenceState::new();
            backward.apply_remote_patch(ActorId(9), second);
            backward.apply_remote_patch(ActorId(9), first);

            prop_assert_eq!(forward.remote(ActorId(9)), backward.remote(ActorId(9)));
        }
    }
}
