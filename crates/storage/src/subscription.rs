use std::collections::HashMap;

use roomkit_protocol::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A notification describing what changed about one node, delivered
/// synchronously at the end of whichever call produced it — a local
/// mutation, a remote op application, or an undo/redo (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub enum StorageUpdate {
    ObjectUpdated { id: NodeId, updated_keys: Vec<String> },
    MapUpdated { id: NodeId, updated_keys: Vec<String> },
    ListUpdated {
        id: NodeId,
        inserted: Vec<NodeId>,
        removed: Vec<NodeId>,
        moved: Vec<NodeId>,
    },
    NodeDeleted { id: NodeId },
}

impl StorageUpdate {
    pub fn node(&self) -> NodeId {
        match self {
            StorageUpdate::ObjectUpdated { id, .. }
            | StorageUpdate::MapUpdated { id, .. }
            | StorageUpdate::ListUpdated { id, .. }
            | StorageUpdate::NodeDeleted { id } => *id,
        }
    }
}

type NodeListener = Box<dyn FnMut(&StorageUpdate)>;
type BatchListener = Box<dyn FnMut(&[StorageUpdate])>;

/// Per-node and whole-document subscriptions. Kept deliberately `!Send`:
/// the engine runs inside a single cooperative task (spec.md §5), so there
/// is no reason to pay for thread-safe closures here.
#[derive(Default)]
pub struct Subscriptions {
    next_id: u64,
    per_node: HashMap<NodeId, Vec<(SubscriptionId, NodeListener)>>,
    batched: Vec<(SubscriptionId, BatchListener)>,
}

impl Subscriptions {
    pub fn subscribe_node(
        &mut self,
        id: NodeId,
        listener: impl FnMut(&StorageUpdate) + 'static,
    ) -> SubscriptionId {
        let sub_id = self.alloc_id();
        self.per_node
            .entry(id)
            .or_default()
            .push((sub_id, Box::new(listener)));
        sub_id
    }

    pub fn subscribe_storage(
        &mut self,
        listener: impl FnMut(&[StorageUpdate]) + 'static,
    ) -> SubscriptionId {
        let sub_id = self.alloc_id();
        self.batched.push((sub_id, Box::new(listener)));
        sub_id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        for listeners in self.per_node.values_mut() {
            listeners.retain(|(existing, _)| *existing != id);
        }
        self.batched.retain(|(existing, _)| *existing != id);
    }

    /// Fan out a batch of updates: per-node listeners first, in node order,
    /// then the whole-document batched listeners once with the full batch.
    pub fn notify(&mut self, updates: &[StorageUpdate]) {
        if updates.is_empty() {
            return;
        }
        for update in updates {
            if let Some(listeners) = self.per_node.get_mut(&update.node()) {
                for (_, listener) in listeners.iter_mut() {
                    listener(update);
                }
            }
        }
        for (_, listener) in self.batched.iter_mut() {
            listener(updates);
        }
    }

    fn alloc_id(&mut self) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        SubscriptionId(id)
    }
}
