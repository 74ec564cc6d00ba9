use roomkit_protocol::NodeId;
use thiserror::Error;

/// User API misuse and engine-internal failures (spec.md §7).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("node {0} is not attached to the document")]
    NotAttached(NodeId),

    #[error("node {0} is not an Object")]
    NotAnObject(NodeId),

    #[error("node {0} is not a Map")]
    NotAMap(NodeId),

    #[error("node {0} is not a List")]
    NotAList(NodeId),

    #[error("key {key:?} on object {id} holds a child node, not a leaf value")]
    KeyHoldsChild { id: NodeId, key: String },

    #[error("attach target {0} already has an id (duplicate attach)")]
    DuplicateAttach(NodeId),

    #[error("op {0} targets a node id this document has never seen")]
    UnknownOpTarget(NodeId),

    #[error("node {0} cannot be its own parent")]
    CyclicParent(NodeId),

    #[error("undo stack is empty")]
    NothingToUndo,

    #[error("redo stack is empty")]
    NothingToRedo,

    #[error("ran out of distinguishable list positions between two neighbours")]
    PositionSpaceExhausted,

    #[error("malformed storage snapshot: {0}")]
    MalformedSnapshot(String),
}

impl From<roomkit_protocol::ProtocolError> for StorageError {
    fn from(err: roomkit_protocol::ProtocolError) -> Self {
        StorageError::MalformedSnapshot(err.to_string())
    }
}
