//! The CRDT tree: a document of `Object`/`Map`/`List`/`Register` nodes,
//! local mutation, remote-op application, undo/redo, and change
//! subscriptions (spec.md §3–§4.4). No networking lives here — `roomkit-room`
//! owns the connection and hands this crate ops to apply and drains ops to
//! send.

mod document;
mod error;
mod id_allocator;
mod node;
mod position;
mod subscription;
mod undo;

pub use document::{Document, SetValue};
pub use error::StorageError;
pub use node::{Attachment, CrdtPayload, ListPayload, MapPayload, Node, ObjectEntry, ObjectPayload, RegisterPayload};
pub use subscription::{StorageUpdate, SubscriptionId};
