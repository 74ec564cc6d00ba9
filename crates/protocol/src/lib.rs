//! Wire protocol, ids, and op kinds shared by every layer of the room client.
//!
//! This crate has no networking and no async in it: it is purely the
//! vocabulary that `roomkit-storage`, `roomkit-presence`, and `roomkit-room`
//! speak to each other and to the relay server.

mod error;
mod ids;
mod message;
mod op;

pub use error::ProtocolError;
pub use ids::{ActorId, NodeId, RoomId};
pub use message::{ClientMessage, RoomUser, ServerMessage, split_batch};
pub use op::{NodeKind, Op, OpId};

/// Heartbeat ping interval while the connection is `open` (spec.md §4.1).
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// No frame of any kind received for this long while `open` forces `unavailable`.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

/// Exponential backoff schedule, capped, with jitter applied by the caller.
pub const BACKOFF_SCHEDULE_MS: &[u64] = &[250, 500, 1_000, 2_000, 5_000, 10_000];

/// Default outbound coalescer throttle.
pub const DEFAULT_THROTTLE_MS: u64 = 100;
/// Inclusive valid range for the outbound coalescer throttle.
pub const THROTTLE_RANGE_MS: std::ops::RangeInclusive<u64> = 80..=1_000;

/// The reserved id of the document root, present before any `FETCH_STORAGE`.
pub const ROOT_NODE_ID: NodeId = NodeId::new(ActorId(0), 0);
