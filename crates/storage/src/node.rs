use std::collections::BTreeMap;

use roomkit_protocol::{ActorId, NodeId, NodeKind};
use serde_json::{Map, Value};

/// A value stored directly under an `Object` key: either an inline JSON leaf
/// or a back-reference to an attached child node (spec.md §3 data model).
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEntry {
    Leaf(Value),
    Child(NodeId),
}

/// Where an attached node sits in the tree: exactly one parent, plus the key
/// (Object/Map) or fractional position (List) it is attached under.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub parent: NodeId,
    pub parent_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectPayload {
    pub entries: std::collections::HashMap<String, ObjectEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct MapPayload {
    pub entries: std::collections::HashMap<String, NodeId>,
}

/// Children ordered by `(position, owner_actor)` so that two concurrent
/// inserts that land on an identical position are still totally ordered —
/// the lower actor id sorts first (spec.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct ListPayload {
    pub entries: BTreeMap<(String, ActorId), NodeId>,
}

#[derive(Debug, Clone)]
pub struct RegisterPayload {
    pub value: Value,
}

#[derive(Debug, Clone)]
pub enum CrdtPayload {
    Object(ObjectPayload),
    Map(MapPayload),
    List(ListPayload),
    Register(RegisterPayload),
}

impl CrdtPayload {
    pub fn kind(&self) -> NodeKind {
        match self {
            CrdtPayload::Object(_) => NodeKind::Object,
            CrdtPayload::Map(_) => NodeKind::Map,
            CrdtPayload::List(_) => NodeKind::List,
            CrdtPayload::Register(_) => NodeKind::Register,
        }
    }
}

/// An attached CRDT tree node. The kernel every concrete variant shares:
/// an id, a parent link (absent only for the root), and a tagged payload
/// (spec.md §9 Design Note: capability interface over a tagged variant,
/// not deep inheritance).
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<Attachment>,
    pub payload: CrdtPayload,
}

impl Node {
    pub fn new_root(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            payload: CrdtPayload::Object(ObjectPayload::default()),
        }
    }

    pub fn as_object(&self) -> Option<&ObjectPayload> {
        match &self.payload {
            CrdtPayload::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ObjectPayload> {
        match &mut self.payload {
            CrdtPayload::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapPayload> {
        match &self.payload {
            CrdtPayload::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapPayload> {
        match &mut self.payload {
            CrdtPayload::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListPayload> {
        match &self.payload {
            CrdtPayload::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut ListPayload> {
        match &mut self.payload {
            CrdtPayload::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<&RegisterPayload> {
        match &self.payload {
            CrdtPayload::Register(r) => Some(r),
            _ => None,
        }
    }
}

/// Leaf-only fields of an `Object`, as carried by a `CREATE_OBJECT` op.
pub fn leaf_entries(payload: &ObjectPayload) -> Map<String, Value> {
    payload
        .entries
        .iter()
        .filter_map(|(k, v)| match v {
            ObjectEntry::Leaf(value) => Some((k.clone(), value.clone())),
            ObjectEntry::Child(_) => None,
        })
        .collect()
}
