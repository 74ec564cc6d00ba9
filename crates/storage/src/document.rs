use std::collections::{HashMap, HashSet};

use roomkit_protocol::{ActorId, NodeId, Op, OpId, ROOT_NODE_ID};
use serde_json::Value;

use crate::{
    error::StorageError,
    id_allocator::IdAllocator,
    node::{Attachment, CrdtPayload, ListPayload, MapPayload, Node, ObjectEntry, ObjectPayload, RegisterPayload, leaf_entries},
    position,
    subscription::{StorageUpdate, SubscriptionId, Subscriptions},
    undo::UndoStack,
};

/// What to put into a newly-created slot: an inline JSON leaf (`Object` keys
/// only — elsewhere it becomes a `Register`) or an empty structural node.
#[derive(Debug, Clone)]
pub enum SetValue {
    Json(Value),
    NewObject,
    NewMap,
    NewList,
}

impl SetValue {
    fn into_create_op(self, ids: &mut IdAllocator, id: NodeId, parent_id: NodeId, parent_key: String) -> Op {
        let op_id = ids.next_op_id();
        match self {
            SetValue::Json(value) => Op::CreateRegister { op_id, id, parent_id, parent_key, value },
            SetValue::NewObject => Op::CreateObject {
                op_id,
                id,
                parent_id,
                parent_key,
                data: Default::default(),
            },
            SetValue::NewMap => Op::CreateMap { op_id, id, parent_id, parent_key },
            SetValue::NewList => Op::CreateList { op_id, id, parent_id, parent_key },
        }
    }
}

/// The CRDT tree for one room, plus everything needed to mutate it locally:
/// id allocation, the outbound op queue, undo history, and change
/// subscriptions (spec.md §3–§4.4).
///
/// Not `Send`: every method borrows `&mut self` synchronously and the whole
/// client runs inside one cooperative task (spec.md §5), so there is no
/// reason to make this safe to share across threads.
pub struct Document {
    ids: IdAllocator,
    nodes: HashMap<NodeId, Node>,
    pending_ops: Vec<Op>,
    in_flight: HashSet<OpId>,
    undo: UndoStack,
    subs: Subscriptions,
}

impl Document {
    pub fn new(local_actor: ActorId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE_ID, Node::new_root(ROOT_NODE_ID));
        Self {
            ids: IdAllocator::new(local_actor),
            nodes,
            pending_ops: Vec::new(),
            in_flight: HashSet::new(),
            undo: UndoStack::default(),
            subs: Subscriptions::default(),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT_NODE_ID
    }

    pub fn local_actor(&self) -> ActorId {
        self.ids.actor()
    }

    /// Bind the server-assigned actor id once the first connection succeeds.
    /// A no-op once already bound — see [`IdAllocator::rebind_actor`].
    pub fn bind_actor(&mut self, actor: ActorId) {
        self.ids.rebind_actor(actor);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn object_entries(&self, id: NodeId) -> Result<Vec<(String, ObjectEntry)>, StorageError> {
        Ok(self
            .require_object(id)?
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn map_entries(&self, id: NodeId) -> Result<Vec<(String, NodeId)>, StorageError> {
        Ok(self
            .require_map(id)?
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    /// List children in position order.
    pub fn list_items(&self, id: NodeId) -> Result<Vec<NodeId>, StorageError> {
        Ok(self.require_list(id)?.entries.values().copied().collect())
    }

    pub fn register_value(&self, id: NodeId) -> Result<Value, StorageError> {
        self.nodes
            .get(&id)
            .and_then(Node::as_register)
            .map(|r| r.value.clone())
            .ok_or(StorageError::NotAttached(id))
    }

    // ── subscriptions ────────────────────────────────────────────────────

    pub fn subscribe_node(&mut self, id: NodeId, listener: impl FnMut(&StorageUpdate) + 'static) -> SubscriptionId {
        self.subs.subscribe_node(id, listener)
    }

    pub fn subscribe_storage(&mut self, listener: impl FnMut(&[StorageUpdate]) + 'static) -> SubscriptionId {
        self.subs.subscribe_storage(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subs.unsubscribe(id);
    }

    // ── outbound queue ───────────────────────────────────────────────────

    /// Drain ops produced by local mutations since the last flush. Every op
    /// returned is marked in-flight so its eventual echo from the server
    /// (see [`Document::apply_remote`]) is recognised and not re-applied.
    pub fn take_pending_ops(&mut self) -> Vec<Op> {
        let ops = std::mem::take(&mut self.pending_ops);
        for op in &ops {
            self.in_flight.insert(op.op_id());
        }
        ops
    }

    // ── remote ops ───────────────────────────────────────────────────────

    /// Apply an op received from the server: either a genuinely remote edit,
    /// or the server's echo of one of our own in-flight ops, in which case
    /// it is dropped (it was already applied optimistically when it was
    /// queued) and this doubles as the local acknowledgement path.
    pub fn apply_remote(&mut self, op: Op) -> Result<(), StorageError> {
        if self.in_flight.remove(&op.op_id()) {
            return Ok(());
        }
        let updates = self.apply_op(&op)?;
        self.subs.notify(&updates);
        Ok(())
    }

    /// Replace the whole tree with a server-provided snapshot (the reply to
    /// `FETCH_STORAGE`). `items` is a flat list of `(node id, serialized
    /// node)` pairs; order does not matter, every node's own `parentId`
    /// ties the tree back together.
    pub fn adopt_snapshot(&mut self, items: Vec<(String, Value)>) -> Result<(), StorageError> {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE_ID, Node::new_root(ROOT_NODE_ID));

        for (id_str, value) in &items {
            let id: NodeId = id_str.parse()?;
            let kind = value
                .get("kind")
                .and_then(Value::as_str)
                .ok_or_else(|| StorageError::MalformedSnapshot(format!("node {id} missing kind")))?;
            let parent = match value.get("parentId").and_then(Value::as_str) {
                Some(raw) => Some(Attachment {
                    parent: raw.parse()?,
                    parent_key: value
                        .get("parentKey")
                        .and_then(Value::as_str)
                        .ok_or_else(|| StorageError::MalformedSnapshot(format!("node {id} missing parentKey")))?
                        .to_string(),
                }),
                None => None,
            };
            let payload = match kind {
                "OBJECT" => CrdtPayload::Object(ObjectPayload {
                    entries: value
                        .get("data")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, ObjectEntry::Leaf(v)))
                        .collect(),
                }),
                "MAP" => CrdtPayload::Map(MapPayload::default()),
                "LIST" => CrdtPayload::List(ListPayload::default()),
                "REGISTER" => CrdtPayload::Register(RegisterPayload {
                    value: value.get("value").cloned().unwrap_or(Value::Null),
                }),
                other => return Err(StorageError::MalformedSnapshot(format!("unknown node kind {other}"))),
            };
            nodes.insert(id, Node { id, parent, payload });
        }

        // Second pass: wire every non-root node into its parent's entries.
        let attachments: Vec<(NodeId, Attachment)> = nodes
            .values()
            .filter(|n| n.id != ROOT_NODE_ID)
            .filter_map(|n| n.parent.clone().map(|a| (n.id, a)))
            .collect();
        for (id, Attachment { parent, parent_key }) in attachments {
            let parent_node = nodes
                .get_mut(&parent)
                .ok_or_else(|| StorageError::MalformedSnapshot(format!("node {id} parent {parent} missing from snapshot")))?;
            match &mut parent_node.payload {
                CrdtPayload::Object(o) => {
                    o.entries.insert(parent_key, ObjectEntry::Child(id));
                },
                CrdtPayload::Map(m) => {
                    m.entries.insert(parent_key, id);
                },
                CrdtPayload::List(l) => {
                    l.entries.insert((parent_key, id.actor), id);
                },
                CrdtPayload::Register(_) => return Err(StorageError::NotAnObject(parent)),
            }
        }

        self.nodes = nodes;
        self.pending_ops.clear();
        self.in_flight.clear();
        Ok(())
    }

    // ── object mutation ──────────────────────────────────────────────────

    pub fn object_set(&mut self, object_id: NodeId, key: &str, value: SetValue) -> Result<Option<NodeId>, StorageError> {
        let old_entry = self.require_object(object_id)?.entries.get(key).cloned();

        let mut recreate_old = Vec::new();
        let mut forward = Vec::new();
        if let Some(ObjectEntry::Child(old_child)) = &old_entry {
            recreate_old = self.subtree_create_ops(*old_child);
            forward.push(Op::DeleteCrdt {
                op_id: self.ids.next_op_id(),
                id: *old_child,
            });
        }

        let new_id = match value {
            SetValue::Json(v) => {
                forward.push(Op::UpdateObject {
                    op_id: self.ids.next_op_id(),
                    id: object_id,
                    key: key.to_string(),
                    value: Some(v),
                });
                None
            },
            other => {
                let child_id = self.ids.next_node_id();
                forward.push(other.into_create_op(&mut self.ids, child_id, object_id, key.to_string()));
                Some(child_id)
            },
        };

        let updates = self.apply_ops_locally(&forward)?;

        let mut inverse = Vec::new();
        if let Some(child_id) = new_id {
            inverse.push(Op::DeleteCrdt {
                op_id: self.ids.next_op_id(),
                id: child_id,
            });
        }
        if !recreate_old.is_empty() {
            inverse.extend(recreate_old);
        } else {
            inverse.push(Op::UpdateObject {
                op_id: self.ids.next_op_id(),
                id: object_id,
                key: key.to_string(),
                value: match old_entry {
                    Some(ObjectEntry::Leaf(v)) => Some(v),
                    _ => None,
                },
            });
        }

        self.commit(forward, inverse, updates);
        Ok(new_id)
    }

    pub fn object_delete_key(&mut self, object_id: NodeId, key: &str) -> Result<(), StorageError> {
        let Some(old_entry) = self.require_object(object_id)?.entries.get(key).cloned() else {
            return Ok(());
        };
        let (forward, inverse) = match &old_entry {
            ObjectEntry::Leaf(v) => (
                vec![Op::UpdateObject {
                    op_id: self.ids.next_op_id(),
                    id: object_id,
                    key: key.to_string(),
                    value: None,
                }],
                vec![Op::UpdateObject {
                    op_id: self.ids.next_op_id(),
                    id: object_id,
                    key: key.to_string(),
                    value: Some(v.clone()),
                }],
            ),
            ObjectEntry::Child(child_id) => {
                let recreate = self.subtree_create_ops(*child_id);
                (
                    vec![Op::DeleteCrdt {
                        op_id: self.ids.next_op_id(),
                        id: *child_id,
                    }],
                    recreate,
                )
            },
        };
        let updates = self.apply_ops_locally(&forward)?;
        self.commit(forward, inverse, updates);
        Ok(())
    }

    // ── map mutation ─────────────────────────────────────────────────────

    pub fn map_set(&mut self, map_id: NodeId, key: &str, value: SetValue) -> Result<NodeId, StorageError> {
        let old_child = self.require_map(map_id)?.entries.get(key).copied();

        let mut forward = Vec::new();
        let mut recreate_old = Vec::new();
        if let Some(old_id) = old_child {
            recreate_old = self.subtree_create_ops(old_id);
            forward.push(Op::DeleteCrdt {
                op_id: self.ids.next_op_id(),
                id: old_id,
            });
        }

        let new_id = self.ids.next_node_id();
        forward.push(value.into_create_op(&mut self.ids, new_id, map_id, key.to_string()));
        let updates = self.apply_ops_locally(&forward)?;

        let mut inverse = vec![Op::DeleteCrdt {
            op_id: self.ids.next_op_id(),
            id: new_id,
        }];
        inverse.extend(recreate_old);

        self.commit(forward, inverse, updates);
        Ok(new_id)
    }

    pub fn map_delete(&mut self, map_id: NodeId, key: &str) -> Result<(), StorageError> {
        let Some(old_id) = self.require_map(map_id)?.entries.get(key).copied() else {
            return Ok(());
        };
        let recreate = self.subtree_create_ops(old_id);
        let forward = vec![Op::DeleteCrdt {
            op_id: self.ids.next_op_id(),
            id: old_id,
        }];
        let updates = self.apply_ops_locally(&forward)?;
        self.commit(forward, recreate, updates);
        Ok(())
    }

    // ── list mutation ────────────────────────────────────────────────────

    pub fn list_insert(&mut self, list_id: NodeId, index: usize, value: SetValue) -> Result<NodeId, StorageError> {
        let position = self.position_for_index(list_id, index)?;

        let child_id = self.ids.next_node_id();
        let op = value.into_create_op(&mut self.ids, child_id, list_id, position);
        let updates = self.apply_ops_locally(std::slice::from_ref(&op))?;

        let inverse = vec![Op::DeleteCrdt {
            op_id: self.ids.next_op_id(),
            id: child_id,
        }];
        self.commit(vec![op], inverse, updates);
        Ok(child_id)
    }

    pub fn list_remove(&mut self, list_id: NodeId, child_id: NodeId) -> Result<(), StorageError> {
        self.require_list_child(list_id, child_id)?;
        let recreate = self.subtree_create_ops(child_id);
        let forward = vec![Op::DeleteCrdt {
            op_id: self.ids.next_op_id(),
            id: child_id,
        }];
        let updates = self.apply_ops_locally(&forward)?;
        self.commit(forward, recreate, updates);
        Ok(())
    }

    pub fn list_move(&mut self, list_id: NodeId, child_id: NodeId, new_index: usize) -> Result<(), StorageError> {
        let current_key = self.require_list_child(list_id, child_id)?;
        let new_position = self.position_for_index_excluding(list_id, new_index, &current_key)?;

        let forward = vec![Op::SetParentKey {
            op_id: self.ids.next_op_id(),
            id: child_id,
            parent_key: new_position,
        }];
        let updates = self.apply_ops_locally(&forward)?;

        let inverse = vec![Op::SetParentKey {
            op_id: self.ids.next_op_id(),
            id: child_id,
            parent_key: current_key,
        }];
        self.commit(forward, inverse, updates);
        Ok(())
    }

    fn position_for_index(&self, list_id: NodeId, index: usize) -> Result<String, StorageError> {
        let ordered: Vec<String> = self.require_list(list_id)?.entries.keys().map(|(p, _)| p.clone()).collect();
        let lo = index.checked_sub(1).and_then(|i| ordered.get(i)).cloned();
        let hi = ordered.get(index).cloned();
        Ok(position::generate_between(lo.as_deref(), hi.as_deref())?)
    }

    fn position_for_index_excluding(&self, list_id: NodeId, index: usize, exclude: &str) -> Result<String, StorageError> {
        let ordered: Vec<String> = self
            .require_list(list_id)?
            .entries
            .keys()
            .map(|(p, _)| p.clone())
            .filter(|p| p != exclude)
            .collect();
        let lo = index.checked_sub(1).and_then(|i| ordered.get(i)).cloned();
        let hi = ordered.get(index).cloned();
        Ok(position::generate_between(lo.as_deref(), hi.as_deref())?)
    }

    fn require_list_child(&self, list_id: NodeId, child_id: NodeId) -> Result<String, StorageError> {
        self.nodes
            .get(&child_id)
            .and_then(|n| n.parent.as_ref())
            .filter(|a| a.parent == list_id)
            .map(|a| a.parent_key.clone())
            .ok_or(StorageError::NotAttached(child_id))
    }

    // ── undo / redo ──────────────────────────────────────────────────────

    pub fn pause_history(&mut self) {
        self.undo.pause();
    }

    pub fn resume_history(&mut self) {
        self.undo.resume();
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Applies the most recent edit's inverse as if it were a brand new
    /// local edit: every op is stamped with a fresh id minted here, never
    /// the id it carried when first recorded, since that id may already be
    /// fully acked (spec.md §3, §4.4).
    pub fn undo(&mut self) -> Result<(), StorageError> {
        let ops = self
            .undo
            .take_undo(|op| op.with_op_id(self.ids.next_op_id()))
            .ok_or(StorageError::NothingToUndo)?;
        let updates = self.apply_ops_locally(&ops)?;
        self.pending_ops.extend(ops);
        self.subs.notify(&updates);
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), StorageError> {
        let ops = self
            .undo
            .take_redo(|op| op.with_op_id(self.ids.next_op_id()))
            .ok_or(StorageError::NothingToRedo)?;
        let updates = self.apply_ops_locally(&ops)?;
        self.pending_ops.extend(ops);
        self.subs.notify(&updates);
        Ok(())
    }

    // ── internals ────────────────────────────────────────────────────────

    fn commit(&mut self, forward: Vec<Op>, inverse: Vec<Op>, updates: Vec<StorageUpdate>) {
        self.pending_ops.extend(forward.clone());
        self.undo.record(forward, inverse);
        self.subs.notify(&updates);
    }

    fn apply_ops_locally(&mut self, ops: &[Op]) -> Result<Vec<StorageUpdate>, StorageError> {
        let mut updates = Vec::new();
        for op in ops {
            updates.extend(self.apply_op(op)?);
        }
        Ok(updates)
    }

    fn apply_op(&mut self, op: &Op) -> Result<Vec<StorageUpdate>, StorageError> {
        match op {
            Op::CreateObject { id, parent_id, parent_key, data, .. } => self.attach_new(
                *id,
                *parent_id,
                parent_key.clone(),
                CrdtPayload::Object(ObjectPayload {
                    entries: data.iter().map(|(k, v)| (k.clone(), ObjectEntry::Leaf(v.clone()))).collect(),
                }),
            ),
            Op::CreateMap { id, parent_id, parent_key, .. } => {
                self.attach_new(*id, *parent_id, parent_key.clone(), CrdtPayload::Map(MapPayload::default()))
            },
            Op::CreateList { id, parent_id, parent_key, .. } => {
                self.attach_new(*id, *parent_id, parent_key.clone(), CrdtPayload::List(ListPayload::default()))
            },
            Op::CreateRegister { id, parent_id, parent_key, value, .. } => self.attach_new(
                *id,
                *parent_id,
                parent_key.clone(),
                CrdtPayload::Register(RegisterPayload { value: value.clone() }),
            ),
            Op::UpdateObject { id, key, value, .. } => self.apply_update_object(*id, key, value.clone()),
            Op::SetParentKey { id, parent_key, .. } => self.apply_set_parent_key(*id, parent_key.clone()),
            Op::DeleteCrdt { id, .. } => self.apply_delete(*id),
        }
    }

    fn attach_new(&mut self, id: NodeId, parent_id: NodeId, parent_key: String, payload: CrdtPayload) -> Result<Vec<StorageUpdate>, StorageError> {
        if self.nodes.contains_key(&id) {
            return Err(StorageError::DuplicateAttach(id));
        }
        if id == parent_id {
            return Err(StorageError::CyclicParent(id));
        }
        let parent = self.nodes.get_mut(&parent_id).ok_or(StorageError::UnknownOpTarget(parent_id))?;
        let update = match &mut parent.payload {
            CrdtPayload::Object(o) => {
                o.entries.insert(parent_key.clone(), ObjectEntry::Child(id));
                StorageUpdate::ObjectUpdated { id: parent_id, updated_keys: vec![parent_key.clone()] }
            },
            CrdtPayload::Map(m) => {
                m.entries.insert(parent_key.clone(), id);
                StorageUpdate::MapUpdated { id: parent_id, updated_keys: vec![parent_key.clone()] }
            },
            CrdtPayload::List(l) => {
                l.entries.insert((parent_key.clone(), id.actor), id);
                StorageUpdate::ListUpdated { id: parent_id, inserted: vec![id], removed: vec![], moved: vec![] }
            },
            CrdtPayload::Register(_) => return Err(StorageError::NotAnObject(parent_id)),
        };
        self.nodes.insert(
            id,
            Node {
                id,
                parent: Some(Attachment { parent: parent_id, parent_key }),
                payload,
            },
        );
        Ok(vec![update])
    }

    fn apply_update_object(&mut self, id: NodeId, key: &str, value: Option<Value>) -> Result<Vec<StorageUpdate>, StorageError> {
        let obj = self.nodes.get_mut(&id).ok_or(StorageError::NotAttached(id))?.as_object_mut().ok_or(StorageError::NotAnObject(id))?;
        match value {
            Some(v) => {
                obj.entries.insert(key.to_string(), ObjectEntry::Leaf(v));
            },
            None => {
                obj.entries.remove(key);
            },
        }
        Ok(vec![StorageUpdate::ObjectUpdated { id, updated_keys: vec![key.to_string()] }])
    }

    fn apply_set_parent_key(&mut self, id: NodeId, new_key: String) -> Result<Vec<StorageUpdate>, StorageError> {
        let attachment = self.nodes.get(&id).ok_or(StorageError::NotAttached(id))?.parent.clone().ok_or(StorageError::NotAttached(id))?;
        let list = self
            .nodes
            .get_mut(&attachment.parent)
            .ok_or(StorageError::UnknownOpTarget(attachment.parent))?
            .as_list_mut()
            .ok_or(StorageError::NotAList(attachment.parent))?;
        list.entries.remove(&(attachment.parent_key.clone(), id.actor));
        list.entries.insert((new_key.clone(), id.actor), id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(Attachment { parent: attachment.parent, parent_key: new_key });
        }
        Ok(vec![StorageUpdate::ListUpdated { id: attachment.parent, inserted: vec![], removed: vec![], moved: vec![id] }])
    }

    fn apply_delete(&mut self, id: NodeId) -> Result<Vec<StorageUpdate>, StorageError> {
        let Attachment { parent, parent_key } = self.nodes.get(&id).ok_or(StorageError::NotAttached(id))?.parent.clone().ok_or(StorageError::NotAttached(id))?;

        let mut updates = Vec::new();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            match &mut parent_node.payload {
                CrdtPayload::Object(o) => {
                    o.entries.remove(&parent_key);
                    updates.push(StorageUpdate::ObjectUpdated { id: parent, updated_keys: vec![parent_key.clone()] });
                },
                CrdtPayload::Map(m) => {
                    m.entries.remove(&parent_key);
                    updates.push(StorageUpdate::MapUpdated { id: parent, updated_keys: vec![parent_key.clone()] });
                },
                CrdtPayload::List(l) => {
                    l.entries.remove(&(parent_key.clone(), id.actor));
                    updates.push(StorageUpdate::ListUpdated { id: parent, inserted: vec![], removed: vec![id], moved: vec![] });
                },
                CrdtPayload::Register(_) => {},
            }
        }
        self.gc_subtree(id, &mut updates);
        Ok(updates)
    }

    fn gc_subtree(&mut self, id: NodeId, updates: &mut Vec<StorageUpdate>) {
        let children: Vec<NodeId> = match self.nodes.get(&id).map(|n| &n.payload) {
            Some(CrdtPayload::Object(o)) => o.entries.values().filter_map(|e| match e {
                ObjectEntry::Child(c) => Some(*c),
                ObjectEntry::Leaf(_) => None,
            }).collect(),
            Some(CrdtPayload::Map(m)) => m.entries.values().copied().collect(),
            Some(CrdtPayload::List(l)) => l.entries.values().copied().collect(),
            Some(CrdtPayload::Register(_)) | None => Vec::new(),
        };
        for child in children {
            self.gc_subtree(child, updates);
        }
        self.nodes.remove(&id);
        updates.push(StorageUpdate::NodeDeleted { id });
    }

    /// Build the ops that would recreate an attached subtree from scratch,
    /// in parent-before-child order, used as the inverse of a deletion or a
    /// slot replacement (spec.md §4.4: undo is an inverse-op journal).
    fn subtree_create_ops(&mut self, id: NodeId) -> Vec<Op> {
        let node = match self.nodes.get(&id) {
            Some(n) => n.clone(),
            None => return Vec::new(),
        };
        let Some(Attachment { parent, parent_key }) = node.parent.clone() else {
            return Vec::new();
        };

        let mut ops = Vec::new();
        match &node.payload {
            CrdtPayload::Object(o) => {
                let op_id = self.ids.next_op_id();
                ops.push(Op::CreateObject { op_id, id, parent_id: parent, parent_key, data: leaf_entries(o) });
                let mut children: Vec<NodeId> = o.entries.values().filter_map(|e| match e {
                    ObjectEntry::Child(c) => Some(*c),
                    ObjectEntry::Leaf(_) => None,
                }).collect();
                children.sort();
                for child in children {
                    ops.extend(self.subtree_create_ops(child));
                }
            },
            CrdtPayload::Map(m) => {
                let op_id = self.ids.next_op_id();
                ops.push(Op::CreateMap { op_id, id, parent_id: parent, parent_key });
                let mut children: Vec<NodeId> = m.entries.values().copied().collect();
                children.sort();
                for child in children {
                    ops.extend(self.subtree_create_ops(child));
                }
            },
            CrdtPayload::List(l) => {
                let op_id = self.ids.next_op_id();
                ops.push(Op::CreateList { op_id, id, parent_id: parent, parent_key });
                for child in l.entries.values().copied().collect::<Vec<_>>() {
                    ops.extend(self.subtree_create_ops(child));
                }
            },
            CrdtPayload::Register(r) => {
                let op_id = self.ids.next_op_id();
                ops.push(Op::CreateRegister { op_id, id, parent_id: parent, parent_key, value: r.value.clone() });
            },
        }
        ops
    }

    fn require_object(&self, id: NodeId) -> Result<&ObjectPayload, StorageError> {
        self.nodes.get(&id).ok_or(StorageError::NotAttached(id))?.as_object().ok_or(StorageError::NotAnObject(id))
    }

    fn require_map(&self, id: NodeId) -> Result<&MapPayload, StorageError> {
        self.nodes.get(&id).ok_or(StorageError::NotAttached(id))?.as_map().ok_or(StorageError::NotAMap(id))
    }

    fn require_list(&self, id: NodeId) -> Result<&ListPayload, StorageError> {
        self.nodes.get(&id).ok_or(StorageError::NotAttached(id))?.as_list().ok_or(StorageError::NotAList(id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Document {
        Document::new(ActorId(1))
    }

    #[test]
    fn set_and_delete_leaf_round_trip_through_undo() {
        let mut d = doc();
        let root = d.root();
        d.object_set(root, "name", SetValue::Json(json!("alice"))).unwrap();
        assert_eq!(d.object_entries(root).unwrap().len(), 1);
        d.undo().unwrap();
        assert_eq!(d.object_entries(root).unwrap().len(), 0);
        d.redo().unwrap();
        assert_eq!(d.object_entries(root).unwrap().len(), 1);
    }

    /// Invariant 5: an op id is never retransmitted once it has gone out —
    /// undoing then redoing the same edit must mint a fresh id each time,
    /// not replay the id from the original edit or the first undo.
    #[test]
    fn undo_and_redo_never_repeat_an_op_id() {
        let mut d = doc();
        let root = d.root();
        d.object_set(root, "name", SetValue::Json(json!("alice"))).unwrap();
        let mut seen: HashSet<OpId> = d.take_pending_ops().iter().map(Op::op_id).collect();

        d.undo().unwrap();
        for op in d.take_pending_ops() {
            assert!(seen.insert(op.op_id()), "undo resent a previously used op id");
        }

        d.redo().unwrap();
        for op in d.take_pending_ops() {
            assert!(seen.insert(op.op_id()), "redo resent a previously used op id");
        }

        d.undo().unwrap();
        for op in d.take_pending_ops() {
            assert!(seen.insert(op.op_id()), "second undo resent a previously used op id");
        }
    }

    #[test]
    fn nested_map_set_delete_and_undo() {
        let mut d = doc();
        let root = d.root();
        let map_id = d.object_set(root, "settings", SetValue::NewMap).unwrap().unwrap();
        d.map_set(map_id, "theme", SetValue::Json(json!("dark"))).unwrap();
        assert_eq!(d.map_entries(map_id).unwrap().len(), 1);
        d.map_delete(map_id, "theme").unwrap();
        assert_eq!(d.map_entries(map_id).unwrap().len(), 0);
        d.undo().unwrap();
        assert_eq!(d.map_entries(map_id).unwrap().len(), 1);
    }

    #[test]
    fn list_insert_remove_and_move_preserve_order() {
        let mut d = doc();
        let root = d.root();
        let list_id = d.object_set(root, "todos", SetValue::NewList).unwrap().unwrap();
        let a = d.list_insert(list_id, 0, SetValue::Json(json!("a"))).unwrap();
        let b = d.list_insert(list_id, 1, SetValue::Json(json!("b"))).unwrap();
        let c = d.list_insert(list_id, 1, SetValue::Json(json!("c"))).unwrap();
        assert_eq!(d.list_items(list_id).unwrap(), vec![a, c, b]);

        d.list_move(list_id, b, 0).unwrap();
        assert_eq!(d.list_items(list_id).unwrap(), vec![b, a, c]);

        d.list_remove(list_id, a).unwrap();
        assert_eq!(d.list_items(list_id).unwrap(), vec![b, c]);
    }

    #[test]
    fn deleting_a_child_object_garbage_collects_its_subtree() {
        let mut d = doc();
        let root = d.root();
        let child = d.object_set(root, "nested", SetValue::NewObject).unwrap().unwrap();
        d.object_set(child, "leaf", SetValue::Json(json!(1))).unwrap();
        d.object_delete_key(root, "nested").unwrap();
        assert!(!d.contains(child));
    }

    #[test]
    fn remote_echo_of_in_flight_op_is_not_double_applied() {
        let mut d = doc();
        let root = d.root();
        d.object_set(root, "x", SetValue::Json(json!(1))).unwrap();
        let ops = d.take_pending_ops();
        for op in ops {
            d.apply_remote(op).unwrap();
        }
        assert_eq!(d.object_entries(root).unwrap().len(), 1);
    }

    #[test]
    fn pause_history_groups_edits_into_one_undo_step() {
        let mut d = doc();
        let root = d.root();
        d.pause_history();
        d.object_set(root, "a", SetValue::Json(json!(1))).unwrap();
        d.object_set(root, "b", SetValue::Json(json!(2))).unwrap();
        assert!(!d.can_undo());
        d.resume_history();
        assert!(d.can_undo());
        d.undo().unwrap();
        assert_eq!(d.object_entries(root).unwrap().len(), 0);
        assert!(!d.can_undo());
    }

    #[test]
    fn bind_actor_only_affects_ids_minted_afterward() {
        let mut d = Document::new(ActorId::LOCAL_UNASSIGNED);
        let root = d.root();
        d.object_set(root, "nested", SetValue::NewObject).unwrap();
        d.bind_actor(ActorId(4));
        let second = d.object_set(root, "other", SetValue::NewObject).unwrap().unwrap();
        assert_eq!(second.actor, ActorId(4));
        assert_eq!(d.local_actor(), ActorId(4));
    }

    #[test]
    fn adopt_snapshot_rebuilds_tree_from_flat_items() {
        let mut d = doc();
        let child = NodeId::new(ActorId(9), 1);
        let items = vec![(
            child.to_string(),
            json!({ "kind": "REGISTER", "parentId": d.root().to_string(), "parentKey": "greeting", "value": "hi" }),
        )];
        d.adopt_snapshot(items).unwrap();
        assert_eq!(d.register_value(child).unwrap(), json!("hi"));
    }

    use proptest::prelude::*;

    fn arb_sets() -> impl Strategy<Value = Vec<(String, i32)>> {
        prop::collection::vec(("[a-e]", any::<i32>()), 1..8)
    }

    proptest! {
        /// Invariant 1: undoing every recorded entry in reverse order
        /// restores the state from before any of them were applied.
        #[test]
        fn undo_every_entry_restores_initial_state(sets in arb_sets()) {
            let mut d = doc();
            let root = d.root();
            for (key, value) in &sets {
                d.object_set(root, key, SetValue::Json(json!(value))).unwrap();
            }
            let applied = sets.len();
            for _ in 0..applied {
                d.undo().unwrap();
            }
            prop_assert_eq!(d.object_entries(root).unwrap().len(), 0);
            prop_assert!(!d.can_undo());
        }

        /// Invariant 2: two documents that start from the same empty state
        /// and exchange every emitted op in the same order converge to
        /// bit-identical storage, regardless of which peer produced them.
        #[test]
        fn exchanging_ops_in_order_converges(sets in arb_sets()) {
            let mut a = Document::new(ActorId(1));
            let mut b = Document::new(ActorId(2));
            let root = a.root();

            for (key, value) in &sets {
                a.object_set(root, key, SetValue::Json(json!(value))).unwrap();
            }
            for op in a.take_pending_ops() {
                b.apply_remote(op).unwrap();
            }

            let mut a_entries = a.object_entries(root).unwrap();
            let mut b_entries = b.object_entries(root).unwrap();
            a_entries.sort_by(|x, y| x.0.cmp(&y.0));
            b_entries.sort_by(|x, y| x.0.cmp(&y.0));
            prop_assert_eq!(a_entries, b_entries);
        }
    }
}
