use serde::{Deserialize, Serialize};

use crate::ids::{ActorId, NodeId};

/// A per-client-session-unique operation id. Distinct from [`NodeId`]: an op
/// targets a node but is not itself addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub actor: ActorId,
    pub seq: u64,
}

/// What kind of node a `CREATE_*` op is instantiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    Object,
    Map,
    List,
    Register,
}

/// A single CRDT mutation, as emitted locally, received from a remote actor,
/// or echoed back as an ack of a local op (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Op {
    CreateObject {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        data: serde_json::Map<String, serde_json::Value>,
    },
    CreateMap {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
    },
    CreateList {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
    },
    CreateRegister {
        op_id: OpId,
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        value: serde_json::Value,
    },
    /// Key set to a value, or (value = None) key deleted.
    UpdateObject {
        op_id: OpId,
        id: NodeId,
        key: String,
        value: Option<serde_json::Value>,
    },
    /// Re-position a list child under a new fractional key.
    SetParentKey {
        op_id: OpId,
        id: NodeId,
        parent_key: String,
    },
    DeleteCrdt {
        op_id: OpId,
        id: NodeId,
    },
}

impl Op {
    pub fn op_id(&self) -> OpId {
        match self {
            Op::CreateObject { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::UpdateObject { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteCrdt { op_id, .. } => *op_id,
        }
    }

    pub fn target(&self) -> NodeId {
        match self {
            Op::CreateObject { id, .. }
            | Op::CreateMap { id, .. }
            | Op::CreateList { id, .. }
            | Op::CreateRegister { id, .. }
            | Op::UpdateObject { id, .. }
            | Op::SetParentKey { id, .. }
            | Op::DeleteCrdt { id, .. } => *id,
        }
    }

    /// Same op, stamped with a freshly minted id. Undo/redo replay an op's
    /// structural shape (which node, what value) but must never resend the
    /// `op_id` of an op that already went out on the wire once.
    pub fn with_op_id(self, op_id: OpId) -> Self {
        match self {
            Op::CreateObject { id, parent_id, parent_key, data, .. } => Op::CreateObject { op_id, id, parent_id, parent_key, data },
            Op::CreateMap { id, parent_id, parent_key, .. } => Op::CreateMap { op_id, id, parent_id, parent_key },
            Op::CreateList { id, parent_id, parent_key, .. } => Op::CreateList { op_id, id, parent_id, parent_key },
            Op::CreateRegister { id, parent_id, parent_key, value, .. } => Op::CreateRegister { op_id, id, parent_id, parent_key, value },
            Op::UpdateObject { id, key, value, .. } => Op::UpdateObject { op_id, id, key, value },
            Op::SetParentKey { id, parent_key, .. } => Op::SetParentKey { op_id, id, parent_key },
            Op::DeleteCrdt { id, .. } => Op::DeleteCrdt { op_id, id },
        }
    }
}
