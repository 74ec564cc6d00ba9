use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as DeError};
use serde_json::{Map, Value, json};

use crate::{error::ProtocolError, ids::ActorId, op::Op};

// ── Message codes (spec.md §6.2) ────────────────────────────────────────────

mod code {
    pub const C2S_UPDATE_PRESENCE: u32 = 100;
    pub const C2S_BROADCAST_EVENT: u32 = 103;
    pub const C2S_FETCH_STORAGE: u32 = 200;
    pub const C2S_UPDATE_STORAGE: u32 = 201;

    pub const S2C_UPDATE_PRESENCE: u32 = 100;
    pub const S2C_USER_JOINED: u32 = 101;
    pub const S2C_USER_LEFT: u32 = 102;
    pub const S2C_BROADCAST_EVENT: u32 = 103;
    pub const S2C_ROOM_STATE: u32 = 104;
    pub const S2C_INITIAL_STORAGE_STATE: u32 = 200;
    pub const S2C_UPDATE_STORAGE: u32 = 201;
}

/// A connected room user, as carried in `ROOM_STATE` / `USER_JOINED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUser {
    pub actor: ActorId,
    #[serde(default)]
    pub info: Option<Value>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A frame sent from this client to the relay server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    UpdatePresence {
        data: Map<String, Value>,
        target_actor: Option<ActorId>,
    },
    BroadcastEvent {
        event: Value,
    },
    FetchStorage,
    UpdateStorage {
        ops: Vec<Op>,
    },
}

impl Serialize for ClientMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let value = match self {
            ClientMessage::UpdatePresence { data, target_actor } => json!({
                "type": code::C2S_UPDATE_PRESENCE,
                "data": data,
                "targetActor": target_actor,
            }),
            ClientMessage::BroadcastEvent { event } => json!({
                "type": code::C2S_BROADCAST_EVENT,
                "event": event,
            }),
            ClientMessage::FetchStorage => json!({ "type": code::C2S_FETCH_STORAGE }),
            ClientMessage::UpdateStorage { ops } => json!({
                "type": code::C2S_UPDATE_STORAGE,
                "ops": ops,
            }),
        };
        value.serialize(serializer)
    }
}

/// A frame received from the relay server.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    UpdatePresence {
        actor: ActorId,
        data: Map<String, Value>,
    },
    UserJoined {
        actor: ActorId,
        info: Option<Value>,
        scopes: Vec<String>,
    },
    UserLeft {
        actor: ActorId,
    },
    BroadcastEvent {
        actor: ActorId,
        event: Value,
    },
    RoomState {
        /// The id the server assigned this connection, alongside the
        /// roster — the wire protocol has no separate "welcome" message,
        /// so `ROOM_STATE` is where a client first learns its own actor id.
        your_actor: ActorId,
        users: Vec<RoomUser>,
    },
    InitialStorageState {
        items: Vec<(String, Value)>,
    },
    UpdateStorage {
        ops: Vec<Op>,
    },
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        ServerMessage::from_value(value).map_err(DeError::custom)
    }
}

impl ServerMessage {
    /// Parse a single JSON value (the caller is responsible for splitting a
    /// batched array frame into individual values first, see [`split_batch`]).
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let code = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::MalformedFrame("missing `type`".into()))?;

        let field = |name: &str| -> Result<Value, ProtocolError> {
            value
                .get(name)
                .cloned()
                .ok_or_else(|| ProtocolError::MalformedFrame(format!("missing `{name}`")))
        };
        let from_field = |name: &str| -> Result<_, ProtocolError> {
            serde_json::from_value(field(name)?)
                .map_err(|e| ProtocolError::MalformedFrame(format!("`{name}`: {e}")))
        };

        match code as u32 {
            code::S2C_UPDATE_PRESENCE => Ok(ServerMessage::UpdatePresence {
                actor: from_field("actor")?,
                data: from_field("data")?,
            }),
            code::S2C_USER_JOINED => Ok(ServerMessage::UserJoined {
                actor: from_field("actor")?,
                info: value.get("info").cloned(),
                scopes: value
                    .get("scopes")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?
                    .unwrap_or_default(),
            }),
            code::S2C_USER_LEFT => Ok(ServerMessage::UserLeft {
                actor: from_field("actor")?,
            }),
            code::S2C_BROADCAST_EVENT => Ok(ServerMessage::BroadcastEvent {
                actor: from_field("actor")?,
                event: field("event")?,
            }),
            code::S2C_ROOM_STATE => Ok(ServerMessage::RoomState {
                your_actor: from_field("yourActor")?,
                users: from_field("users")?,
            }),
            code::S2C_INITIAL_STORAGE_STATE => {
                let items: Vec<(String, Value)> = from_field("items")?;
                Ok(ServerMessage::InitialStorageState { items })
            },
            code::S2C_UPDATE_STORAGE => Ok(ServerMessage::UpdateStorage {
                ops: from_field("ops")?,
            }),
            other => Err(ProtocolError::UnknownMessageCode(other)),
        }
    }
}

/// Split a server text frame into one or more JSON values: the server may
/// batch several messages into a single JSON array (spec.md §6.2).
pub fn split_batch(raw: &str) -> Result<Vec<Value>, ProtocolError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid JSON: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_update_storage() {
        let msg = ClientMessage::UpdateStorage { ops: vec![] };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":201"));
    }

    #[test]
    fn parses_room_state() {
        let raw = r#"{"type":104,"yourActor":7,"users":[{"actor":1,"scopes":["room:write"]}]}"#;
        let parsed: ServerMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            ServerMessage::RoomState { your_actor, users } => {
                assert_eq!(your_actor, ActorId(7));
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].actor, ActorId(1));
            },
            _ => panic!("expected RoomState"),
        }
    }

    #[test]
    fn splits_batched_array_frame() {
        let raw = r#"[{"type":102,"actor":1},{"type":102,"actor":2}]"#;
        let values = split_batch(raw).unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn rejects_unknown_code() {
        let raw = r#"{"type":999}"#;
        let err = ServerMessage::from_value(serde_json::from_str(raw).unwrap()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageCode(999)));
    }
}
