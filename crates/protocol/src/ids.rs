use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A room identifier: an opaque, non-empty, application-chosen string
/// (spec.md §3). `Arc<str>` so cloning a `RoomId` into every subscriber
/// callback and pool-map key is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn new(id: impl Into<Arc<str>>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProtocolError::EmptyRoomId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoomId::new(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RoomId::new(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0.to_string()
    }
}

/// A server-assigned actor id, unique per connected session (spec.md §3).
///
/// Actor ids are not reused within a room's lifetime as seen by a client;
/// a reconnect may receive a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u32);

impl ActorId {
    pub const LOCAL_UNASSIGNED: ActorId = ActorId(u32::MAX);
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for ActorId {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .map(ActorId)
            .map_err(|_| ProtocolError::ActorIdOutOfRange(value))
    }
}

/// `"<actorId>:<counter>"`. The counter is monotonically increasing and
/// persistent across reconnects of the same client (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub actor: ActorId,
    pub seq: u64,
}

impl NodeId {
    pub const fn new(actor: ActorId, seq: u64) -> Self {
        Self { actor, seq }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor.0, self.seq)
    }
}

impl FromStr for NodeId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (actor_str, seq_str) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidNodeId(s.to_string()))?;
        let actor: u32 = actor_str
            .parse()
            .map_err(|_| ProtocolError::InvalidNodeId(s.to_string()))?;
        let seq: u64 = seq_str
            .parse()
            .map_err(|_| ProtocolError::InvalidNodeId(s.to_string()))?;
        Ok(Self {
            actor: ActorId(actor),
            seq,
        })
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_fromstr() {
        let id = NodeId::new(ActorId(7), 42);
        let text = id.to_string();
        assert_eq!(text, "7:42");
        assert_eq!(text.parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn root_is_0_0() {
        assert_eq!(crate::ROOT_NODE_ID.to_string(), "0:0");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("nope".parse::<NodeId>().is_err());
        assert!("1:".parse::<NodeId>().is_err());
        assert!(":1".parse::<NodeId>().is_err());
    }

    #[test]
    fn room_id_rejects_empty() {
        assert!(RoomId::new("").is_err());
        assert_eq!(RoomId::new("r1").unwrap().as_str(), "r1");
    }
}
