//! The client pool: a host's single entry point for joining rooms, wiring
//! shared options and environment signals into every [`Room`] it owns
//! (spec.md §4.6).

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use roomkit_protocol::{DEFAULT_THROTTLE_MS, RoomId, THROTTLE_RANGE_MS};
use roomkit_room::{AuthEndpoint, AuthMethod, AuthTransport, ReqwestAuthTransport, Room, RoomConfig, RoomError, Transport, TungsteniteTransport};
use thiserror::Error;
use tracing::info;

/// Mirrors the options object a host constructs a client from (spec.md §6.1):
/// a flat, two-optional-fields-for-one-choice shape rather than an enum,
/// since exactly one of `public_api_key`/`auth_endpoint` being set is a
/// runtime fact about the value a host passed in, not something the type
/// system can enforce without also accepting the JS-style shape the rest of
/// this crate's public surface mirrors.
pub struct ClientOptions {
    pub public_api_key: Option<String>,
    pub auth_endpoint: Option<AuthEndpoint>,
    pub throttle_ms: u64,
    pub liveblocks_server: Option<String>,
    pub public_authorize_endpoint: Option<String>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self {
            public_api_key: None,
            auth_endpoint: None,
            throttle_ms: DEFAULT_THROTTLE_MS,
            liveblocks_server: None,
            public_authorize_endpoint: None,
        }
    }

    fn validate(&self) -> Result<(), ClientError> {
        match (&self.public_api_key, &self.auth_endpoint) {
            (None, None) => return Err(ClientError::MissingAuth),
            (Some(_), Some(_)) => return Err(ClientError::ConflictingAuth),
            _ => {},
        }
        if !THROTTLE_RANGE_MS.contains(&self.throttle_ms) {
            return Err(ClientError::InvalidThrottle {
                value: self.throttle_ms,
                min: *THROTTLE_RANGE_MS.start(),
                max: *THROTTLE_RANGE_MS.end(),
            });
        }
        Ok(())
    }

    fn room_config(&self, room_id: RoomId) -> RoomConfig {
        let auth = match (&self.public_api_key, &self.auth_endpoint) {
            (Some(key), _) => AuthMethod::PublicApiKey(key.clone()),
            (None, Some(endpoint)) => AuthMethod::Endpoint(endpoint.clone()),
            (None, None) => unreachable!("validated in Client::new"),
        };
        let mut config = RoomConfig::new(room_id, auth);
        config.throttle_ms = self.throttle_ms;
        if let Some(server) = &self.liveblocks_server {
            config.liveblocks_server = server.clone();
        }
        if let Some(endpoint) = &self.public_authorize_endpoint {
            config.public_authorize_endpoint = endpoint.clone();
        }
        config
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-`enter` options (spec.md §4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct EnterOptions {
    /// Build the `Room` without connecting it — lets a host mount storage
    /// for server-side rendering before any networking happens. The host
    /// calls [`Room::connect`] itself once it actually wants the socket.
    pub without_connecting: bool,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("exactly one of `public_api_key` or `auth_endpoint` must be set")]
    MissingAuth,
    #[error("`public_api_key` and `auth_endpoint` are mutually exclusive")]
    ConflictingAuth,
    #[error("throttle must be between {min} and {max} ms, got {value}")]
    InvalidThrottle { value: u64, min: u64, max: u64 },
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// The two environment changes the pool reacts to by nudging every room
/// past its remaining backoff (spec.md §4.1, §4.6): the host process came
/// back online, or a window/tab became visible again. Real OS/browser
/// wiring is left to the host embedding this crate — [`NoopEnvironmentSignals`]
/// never fires, which is also what a test harness wants by default.
pub enum EnvironmentEvent {
    Online,
    Visible,
}

pub trait EnvironmentSignals {
    fn subscribe(&self, on_event: Box<dyn FnMut(EnvironmentEvent)>);
}

#[derive(Debug, Default)]
pub struct NoopEnvironmentSignals;

impl EnvironmentSignals for NoopEnvironmentSignals {
    fn subscribe(&self, _on_event: Box<dyn FnMut(EnvironmentEvent)>) {}
}

struct ClientShared {
    options: ClientOptions,
    make_transport: Box<dyn Fn(&RoomId) -> Rc<dyn Transport>>,
    make_auth_transport: Box<dyn Fn(&RoomId) -> Rc<dyn AuthTransport>>,
    rooms: RefCell<HashMap<RoomId, Room>>,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        for room in self.rooms.borrow().values() {
            room.leave();
        }
    }
}

/// A host's single entry point for joining rooms. Cheap to clone
/// (`Rc`-backed); every room it has entered is leaved when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Client(Rc<ClientShared>);

impl Client {
    pub fn new(
        options: ClientOptions,
        make_transport: impl Fn(&RoomId) -> Rc<dyn Transport> + 'static,
        make_auth_transport: impl Fn(&RoomId) -> Rc<dyn AuthTransport> + 'static,
        environment: Rc<dyn EnvironmentSignals>,
    ) -> Result<Self, ClientError> {
        options.validate()?;
        let shared = Rc::new(ClientShared {
            options,
            make_transport: Box::new(make_transport),
            make_auth_transport: Box::new(make_auth_transport),
            rooms: RefCell::new(HashMap::new()),
        });

        let weak = Rc::downgrade(&shared);
        environment.subscribe(Box::new(move |event| {
            let Some(shared) = weak.upgrade() else { return };
            for room in shared.rooms.borrow().values() {
                match event {
                    EnvironmentEvent::Online => room.signal_online(),
                    EnvironmentEvent::Visible => room.signal_visible(),
                }
            }
        }));

        Ok(Self(shared))
    }

    /// Build a client wired to real networking (`tokio-tungstenite` +
    /// `reqwest`) with no environment signal source. Most hosts running
    /// outside a browser reach for this.
    pub fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let transport: Rc<dyn Transport> = Rc::new(TungsteniteTransport);
        let auth_transport: Rc<dyn AuthTransport> = Rc::new(ReqwestAuthTransport::default());
        Self::new(
            options,
            move |_| transport.clone(),
            move |_| auth_transport.clone(),
            Rc::new(NoopEnvironmentSignals),
        )
    }

    /// Join `room_id`, creating and connecting a fresh [`Room`] the first
    /// time it is entered and returning the existing one on every
    /// subsequent call (spec.md §4.6). `opts.without_connecting` skips the
    /// auto-connect, e.g. to mount storage during server-side rendering.
    pub fn enter(&self, room_id: RoomId, opts: EnterOptions) -> Result<Room, ClientError> {
        if let Some(room) = self.0.rooms.borrow().get(&room_id) {
            return Ok(room.clone());
        }
        let config = self.0.options.room_config(room_id.clone());
        let transport = (self.0.make_transport)(&room_id);
        let auth_transport = (self.0.make_auth_transport)(&room_id);
        let room = Room::new(config, transport, auth_transport)?;
        if !opts.without_connecting {
            room.connect();
        }
        info!(room = %room_id, "entered room");
        self.0.rooms.borrow_mut().insert(room_id, room.clone());
        Ok(room)
    }

    pub fn get_room(&self, room_id: &RoomId) -> Option<Room> {
        self.0.rooms.borrow().get(room_id).cloned()
    }

    /// Leave and forget `room_id`. A later [`Client::enter`] of the same id
    /// builds an entirely fresh `Room`.
    pub fn leave(&self, room_id: &RoomId) {
        if let Some(room) = self.0.rooms.borrow_mut().remove(room_id) {
            room.leave();
            info!(room = %room_id, "left room");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use roomkit_room::fake_transport::{FakeAuthTransport, FakeTransport};

    use super::*;

    fn options_with_key() -> ClientOptions {
        let mut options = ClientOptions::new();
        options.public_api_key = Some("key".to_string());
        options
    }

    #[test]
    fn missing_auth_is_rejected() {
        let err = Client::new(ClientOptions::new(), |_| unreachable!(), |_| unreachable!(), Rc::new(NoopEnvironmentSignals)).unwrap_err();
        assert!(matches!(err, ClientError::MissingAuth));
    }

    #[test]
    fn conflicting_auth_is_rejected() {
        let mut options = options_with_key();
        options.auth_endpoint = Some(AuthEndpoint::Url("https://example.com".to_string()));
        let err = Client::new(options, |_| unreachable!(), |_| unreachable!(), Rc::new(NoopEnvironmentSignals)).unwrap_err();
        assert!(matches!(err, ClientError::ConflictingAuth));
    }

    #[test]
    fn invalid_throttle_is_rejected() {
        let mut options = options_with_key();
        options.throttle_ms = 10;
        let err = Client::new(options, |_| unreachable!(), |_| unreachable!(), Rc::new(NoopEnvironmentSignals)).unwrap_err();
        assert!(matches!(err, ClientError::InvalidThrottle { .. }));
    }

    #[tokio::test]
    async fn enter_reuses_existing_room_for_same_id() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let calls = Rc::new(RefCell::new(0));
                let calls_for_factory = calls.clone();
                let client = Client::new(
                    options_with_key(),
                    move |_room_id| {
                        *calls_for_factory.borrow_mut() += 1;
                        let (transport, _server) = FakeTransport::new();
                        Rc::new(transport) as Rc<dyn Transport>
                    },
                    |_| Rc::new(FakeAuthTransport { token: "t".to_string() }) as Rc<dyn AuthTransport>,
                    Rc::new(NoopEnvironmentSignals),
                )
                .unwrap();

                let room_id = RoomId::new("room-1").unwrap();
                let first = client.enter(room_id.clone(), EnterOptions::default()).unwrap();
                let second = client.enter(room_id.clone(), EnterOptions::default()).unwrap();
                assert_eq!(first.room_id(), second.room_id());
                assert_eq!(*calls.borrow(), 1);

                client.leave(&room_id);
                assert!(client.get_room(&room_id).is_none());
            })
            .await;
    }

    /// Invariant 5: `leave(r); enter(r)` yields a fresh room, not influenced
    /// by the instance that was left.
    #[tokio::test]
    async fn leave_then_enter_builds_a_fresh_room() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let calls = Rc::new(RefCell::new(0));
                let calls_for_factory = calls.clone();
                let client = Client::new(
                    options_with_key(),
                    move |_room_id| {
                        *calls_for_factory.borrow_mut() += 1;
                        let (transport, _server) = FakeTransport::new();
                        Rc::new(transport) as Rc<dyn Transport>
                    },
                    |_| Rc::new(FakeAuthTransport { token: "t".to_string() }) as Rc<dyn AuthTransport>,
                    Rc::new(NoopEnvironmentSignals),
                )
                .unwrap();

                let room_id = RoomId::new("room-1").unwrap();
                let first = client.enter(room_id.clone(), EnterOptions::default()).unwrap();
                first.object_set(first.root(), "x", roomkit_storage::SetValue::Json(serde_json::json!(1))).unwrap();
                client.leave(&room_id);

                let second = client.enter(room_id.clone(), EnterOptions::default()).unwrap();
                assert_eq!(*calls.borrow(), 2);
                assert_eq!(second.object_entries(second.root()).unwrap().len(), 0);
                assert_eq!(second.status(), roomkit_room::ConnectionStatus::Closed);
            })
            .await;
    }

    /// spec.md §4.6: `without_connecting` lets a host mount storage without
    /// ever spawning the connection task.
    #[tokio::test]
    async fn without_connecting_skips_auto_connect() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(
                    options_with_key(),
                    |_room_id| {
                        let (transport, _server) = FakeTransport::new();
                        Rc::new(transport) as Rc<dyn Transport>
                    },
                    |_| Rc::new(FakeAuthTransport { token: "t".to_string() }) as Rc<dyn AuthTransport>,
                    Rc::new(NoopEnvironmentSignals),
                )
                .unwrap();

                let room_id = RoomId::new("room-1").unwrap();
                let opts = EnterOptions { without_connecting: true };
                let room = client.enter(room_id, opts).unwrap();
                assert_eq!(room.status(), roomkit_room::ConnectionStatus::Closed);
            })
            .await;
    }
}
