//! The `Room` facade: owns one room's document, presence, and outbound
//! coalescer, and drives the connection state machine from a single
//! spawned task (spec.md §4.1, §5).

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use futures::future::LocalBoxFuture;
use roomkit_presence::{PresencePatch, PresenceState};
use roomkit_protocol::{
    ActorId, ClientMessage, NodeId, RoomId, RoomUser, ServerMessage, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, THROTTLE_RANGE_MS, split_batch,
};
use roomkit_storage::{Document, ObjectEntry, SetValue, StorageError, StorageUpdate, SubscriptionId};
use serde_json::{Map, Value};
use tokio::{
    sync::{Notify, watch},
    time::Instant,
};
use tracing::{info, warn};

use crate::{
    backoff::Backoff,
    coalescer::OutboundCoalescer,
    error::{AuthFailure, RoomError},
    state::ConnectionStatus,
    transport::{AuthTransport, Socket, Transport},
};

/// Default WebSocket relay base, overridable via [`RoomConfig::liveblocks_server`]
/// (spec.md §9 open question: `liveblocksServer` is an official override option).
pub const DEFAULT_RELAY_SERVER: &str = "wss://relay.example.com/v1";
pub const DEFAULT_PUBLIC_AUTHORIZE_ENDPOINT: &str = "https://relay.example.com/v1/authorize";

const PRESENCE_HISTORY_DEPTH: usize = 50;

/// spec.md §7: "Repeated violations within a window force reconnection."
/// More than this many malformed frames/ops within [`VIOLATION_WINDOW`]
/// means the relay or our framing assumptions have drifted badly enough
/// that a fresh connection is more likely to recover than continuing to
/// drop messages one at a time.
const VIOLATION_THRESHOLD: usize = 5;
const VIOLATION_WINDOW: Duration = Duration::from_secs(10);

/// How this room obtains a session token before opening its socket
/// (spec.md §6.1).
pub enum AuthMethod {
    PublicApiKey(String),
    Endpoint(AuthEndpoint),
}

/// The two forms `authEndpoint` can take in spec.md §6.1: a URL this room's
/// [`AuthTransport`] POSTs to, or a host-supplied callback returning a token
/// directly (no HTTP round trip through `AuthTransport` at all).
#[derive(Clone)]
pub enum AuthEndpoint {
    Url(String),
    Callback(Rc<dyn Fn(&str) -> LocalBoxFuture<'static, Result<String, RoomError>>>),
}

pub struct RoomConfig {
    pub room_id: RoomId,
    pub auth: AuthMethod,
    pub throttle_ms: u64,
    pub liveblocks_server: String,
    pub public_authorize_endpoint: String,
}

impl RoomConfig {
    pub fn new(room_id: RoomId, auth: AuthMethod) -> Self {
        Self {
            room_id,
            auth,
            throttle_ms: roomkit_protocol::DEFAULT_THROTTLE_MS,
            liveblocks_server: DEFAULT_RELAY_SERVER.to_string(),
            public_authorize_endpoint: DEFAULT_PUBLIC_AUTHORIZE_ENDPOINT.to_string(),
        }
    }
}

/// A local presence edit added to history: paired forward/inverse patches
/// that move between the undo and redo deques without ever being
/// recomputed, the same shape as [`roomkit_storage`]'s undo stack.
struct PresenceHistoryEntry {
    forward: PresencePatch,
    inverse: PresencePatch,
}

struct Inner {
    document: Document,
    presence: PresenceState,
    coalescer: OutboundCoalescer,
    roster: HashMap<ActorId, RoomUser>,
    fetched_storage: bool,
    presence_undo: VecDeque<PresenceHistoryEntry>,
    presence_redo: VecDeque<PresenceHistoryEntry>,
    /// Timestamps of recent malformed frames/ops, pruned to [`VIOLATION_WINDOW`]
    /// on every violation (spec.md §7).
    violations: VecDeque<Instant>,
}

struct Shared {
    config: RoomConfig,
    transport: Rc<dyn Transport>,
    auth_transport: Rc<dyn AuthTransport>,
    inner: RefCell<Inner>,
    status_tx: watch::Sender<ConnectionStatus>,
    error_listeners: RefCell<Vec<Box<dyn FnMut(&RoomError)>>>,
    broadcast_listeners: RefCell<Vec<Box<dyn FnMut(ActorId, &Value)>>>,
    retry_notify: Notify,
    task: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

/// A handle to a joined room. Cheap to clone (`Rc`-backed) — every clone
/// shares the same document, presence, and connection task.
#[derive(Clone)]
pub struct Room(Rc<Shared>);

enum OpenExit {
    Closed,
    Error(RoomError),
}

impl Room {
    pub fn new(config: RoomConfig, transport: Rc<dyn Transport>, auth_transport: Rc<dyn AuthTransport>) -> Result<Self, RoomError> {
        if !THROTTLE_RANGE_MS.contains(&config.throttle_ms) {
            return Err(RoomError::InvalidThrottle {
                value: config.throttle_ms,
                min: *THROTTLE_RANGE_MS.start(),
                max: *THROTTLE_RANGE_MS.end(),
            });
        }
        let coalescer = OutboundCoalescer::new(config.throttle_ms)?;
        let inner = Inner {
            document: Document::new(ActorId::LOCAL_UNASSIGNED),
            presence: PresenceState::new(),
            coalescer,
            roster: HashMap::new(),
            fetched_storage: false,
            presence_undo: VecDeque::new(),
            presence_redo: VecDeque::new(),
            violations: VecDeque::new(),
        };
        let (status_tx, _) = watch::channel(ConnectionStatus::Closed);
        Ok(Self(Rc::new(Shared {
            config,
            transport,
            auth_transport,
            inner: RefCell::new(inner),
            status_tx,
            error_listeners: RefCell::new(Vec::new()),
            broadcast_listeners: RefCell::new(Vec::new()),
            retry_notify: Notify::new(),
            task: RefCell::new(None),
        })))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.0.config.room_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.0.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.0.status_tx.subscribe()
    }

    pub fn subscribe_error(&self, listener: impl FnMut(&RoomError) + 'static) {
        self.0.error_listeners.borrow_mut().push(Box::new(listener));
    }

    pub fn subscribe_broadcast(&self, listener: impl FnMut(ActorId, &Value) + 'static) {
        self.0.broadcast_listeners.borrow_mut().push(Box::new(listener));
    }

    /// Spawn the connection-driving task on the current `LocalSet`. A no-op
    /// if already connected or connecting — matches the client pool's
    /// `withoutConnecting` escape hatch (spec.md §4.6): a host constructs a
    /// `Room` and defers calling this until it actually wants networking.
    pub fn connect(&self) {
        if self.0.task.borrow().is_some() {
            return;
        }
        let room = self.clone();
        let handle = tokio::task::spawn_local(async move { room.run().await });
        *self.0.task.borrow_mut() = Some(handle);
    }

    /// Cancel all timers, drop the connection, and leave the room terminal
    /// until [`Room::connect`] is called again (spec.md §5 Cancellation).
    pub fn leave(&self) {
        if let Some(handle) = self.0.task.borrow_mut().take() {
            handle.abort();
        }
        self.set_status(ConnectionStatus::Closed);
    }

    /// The environment signalled `online` after being offline, or became
    /// visible while `unavailable` — skip the remaining backoff and retry
    /// now (spec.md §4.1, §4.6).
    pub fn signal_online(&self) {
        self.0.retry_notify.notify_one();
    }

    pub fn signal_visible(&self) {
        self.0.retry_notify.notify_one();
    }

    // ── storage read accessors ───────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.0.inner.borrow().document.root()
    }

    pub fn local_actor(&self) -> ActorId {
        self.0.inner.borrow().document.local_actor()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.0.inner.borrow().document.contains(id)
    }

    pub fn object_entries(&self, id: NodeId) -> Result<Vec<(String, ObjectEntry)>, RoomError> {
        Ok(self.0.inner.borrow().document.object_entries(id)?)
    }

    pub fn map_entries(&self, id: NodeId) -> Result<Vec<(String, NodeId)>, RoomError> {
        Ok(self.0.inner.borrow().document.map_entries(id)?)
    }

    pub fn list_items(&self, id: NodeId) -> Result<Vec<NodeId>, RoomError> {
        Ok(self.0.inner.borrow().document.list_items(id)?)
    }

    pub fn register_value(&self, id: NodeId) -> Result<Value, RoomError> {
        Ok(self.0.inner.borrow().document.register_value(id)?)
    }

    pub fn subscribe_node(&self, id: NodeId, listener: impl FnMut(&StorageUpdate) + 'static) -> SubscriptionId {
        self.0.inner.borrow_mut().document.subscribe_node(id, listener)
    }

    pub fn subscribe_storage(&self, listener: impl FnMut(&[StorageUpdate]) + 'static) -> SubscriptionId {
        self.0.inner.borrow_mut().document.subscribe_storage(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.0.inner.borrow_mut().document.unsubscribe(id);
    }

    // ── storage mutation (spec.md §4.3: synchronous, never suspends) ────

    pub fn object_set(&self, object_id: NodeId, key: &str, value: SetValue) -> Result<Option<NodeId>, RoomError> {
        self.mutate(|doc| doc.object_set(object_id, key, value))
    }

    pub fn object_delete_key(&self, object_id: NodeId, key: &str) -> Result<(), RoomError> {
        self.mutate(|doc| doc.object_delete_key(object_id, key))
    }

    pub fn map_set(&self, map_id: NodeId, key: &str, value: SetValue) -> Result<NodeId, RoomError> {
        self.mutate(|doc| doc.map_set(map_id, key, value))
    }

    pub fn map_delete(&self, map_id: NodeId, key: &str) -> Result<(), RoomError> {
        self.mutate(|doc| doc.map_delete(map_id, key))
    }

    pub fn list_insert(&self, list_id: NodeId, index: usize, value: SetValue) -> Result<NodeId, RoomError> {
        self.mutate(|doc| doc.list_insert(list_id, index, value))
    }

    pub fn list_remove(&self, list_id: NodeId, child_id: NodeId) -> Result<(), RoomError> {
        self.mutate(|doc| doc.list_remove(list_id, child_id))
    }

    pub fn list_move(&self, list_id: NodeId, child_id: NodeId, new_index: usize) -> Result<(), RoomError> {
        self.mutate(|doc| doc.list_move(list_id, child_id, new_index))
    }

    pub fn can_undo(&self) -> bool {
        self.0.inner.borrow().document.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.0.inner.borrow().document.can_redo()
    }

    pub fn undo(&self) -> Result<(), RoomError> {
        self.mutate(|doc| doc.undo())
    }

    pub fn redo(&self) -> Result<(), RoomError> {
        self.mutate(|doc| doc.redo())
    }

    pub fn pause_history(&self) {
        self.0.inner.borrow_mut().document.pause_history();
    }

    pub fn resume_history(&self) {
        self.0.inner.borrow_mut().document.resume_history();
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Document) -> Result<T, StorageError>) -> Result<T, RoomError> {
        let mut inner = self.0.inner.borrow_mut();
        let result = f(&mut inner.document)?;
        let ops = inner.document.take_pending_ops();
        inner.coalescer.queue_storage_ops(ops);
        Ok(result)
    }

    // ── presence ──────────────────────────────────────────────────────────

    pub fn my_presence(&self) -> Map<String, Value> {
        self.0.inner.borrow().presence.local().clone()
    }

    pub fn presence_of(&self, actor: ActorId) -> Option<Map<String, Value>> {
        self.0.inner.borrow().presence.remote(actor).cloned()
    }

    pub fn connected_users(&self) -> Vec<RoomUser> {
        self.0.inner.borrow().roster.values().cloned().collect()
    }

    /// Merge `patch` into local presence (spec.md §4.5). With
    /// `add_to_history: true` the patch becomes undoable via
    /// [`Room::undo_presence`]/[`Room::redo_presence`] — kept as its own
    /// bounded stack rather than folded into the storage undo stack: the
    /// two mutation kinds live in different crates with different entry
    /// shapes, and spec.md only requires that the patch *become* undoable,
    /// not that one `undo()` button cover both (documented in DESIGN.md).
    pub fn update_presence(&self, patch: PresencePatch, add_to_history: bool) {
        let mut inner = self.0.inner.borrow_mut();
        let inverse: Option<PresencePatch> = if add_to_history {
            Some(patch.keys().map(|k| (k.clone(), inner.presence.local().get(k).cloned())).collect())
        } else {
            None
        };
        let wire = inner.presence.apply_local_patch(patch.clone());
        inner.coalescer.queue_presence(wire);
        if let Some(inverse) = inverse {
            inner.presence_redo.clear();
            if inner.presence_undo.len() >= PRESENCE_HISTORY_DEPTH {
                inner.presence_undo.pop_front();
            }
            inner.presence_undo.push_back(PresenceHistoryEntry { forward: patch, inverse });
        }
    }

    pub fn can_undo_presence(&self) -> bool {
        !self.0.inner.borrow().presence_undo.is_empty()
    }

    pub fn can_redo_presence(&self) -> bool {
        !self.0.inner.borrow().presence_redo.is_empty()
    }

    pub fn undo_presence(&self) -> Result<(), RoomError> {
        let mut inner = self.0.inner.borrow_mut();
        let entry = inner.presence_undo.pop_back().ok_or(StorageError::NothingToUndo)?;
        let wire = inner.presence.apply_local_patch(entry.inverse.clone());
        inner.coalescer.queue_presence(wire);
        inner.presence_redo.push_back(entry);
        Ok(())
    }

    pub fn redo_presence(&self) -> Result<(), RoomError> {
        let mut inner = self.0.inner.borrow_mut();
        let entry = inner.presence_redo.pop_back().ok_or(StorageError::NothingToRedo)?;
        let wire = inner.presence.apply_local_patch(entry.forward.clone());
        inner.coalescer.queue_presence(wire);
        inner.presence_undo.push_back(entry);
        Ok(())
    }

    pub fn broadcast_event(&self, event: Value) {
        self.0.inner.borrow_mut().coalescer.queue_broadcast(event);
    }

    // ── connection-driving task ──────────────────────────────────────────

    fn set_status(&self, status: ConnectionStatus) {
        let _ = self.0.status_tx.send(status);
    }

    fn emit_error(&self, err: &RoomError) {
        warn!(room = %self.0.config.room_id, %err, "room error");
        for listener in self.0.error_listeners.borrow_mut().iter_mut() {
            listener(err);
        }
    }

    async fn run(self) {
        let mut backoff = Backoff::new();
        loop {
            self.set_status(ConnectionStatus::Authenticating);
            let token = match self.authenticate().await {
                Ok(token) => token,
                Err(AuthFailure::Permanent(reason)) => {
                    self.set_status(ConnectionStatus::Failed { reason: reason.clone() });
                    self.emit_error(&RoomError::Auth(AuthFailure::Permanent(reason)));
                    return;
                },
                Err(AuthFailure::Transient(reason)) => {
                    self.emit_error(&RoomError::Auth(AuthFailure::Transient(reason)));
                    self.set_status(ConnectionStatus::Unavailable);
                    self.wait_for_retry(backoff.next_delay()).await;
                    continue;
                },
            };

            self.set_status(ConnectionStatus::Connecting);
            let url = format!("{}/rooms/{}/connect?token={}", self.0.config.liveblocks_server, self.0.config.room_id, token);
            let mut socket = match self.0.transport.connect(&url).await {
                Ok(socket) => socket,
                Err(err) => {
                    self.emit_error(&err);
                    self.set_status(ConnectionStatus::Unavailable);
                    self.wait_for_retry(backoff.next_delay()).await;
                    continue;
                },
            };

            if let Err(err) = self.await_room_state(socket.as_mut()).await {
                self.emit_error(&err);
                socket.close().await;
                self.set_status(ConnectionStatus::Unavailable);
                self.wait_for_retry(backoff.next_delay()).await;
                continue;
            }

            backoff.reset();
            self.set_status(ConnectionStatus::Open);
            info!(room = %self.0.config.room_id, "room open");

            if !self.0.inner.borrow().fetched_storage {
                if let Ok(text) = serde_json::to_string(&ClientMessage::FetchStorage) {
                    if let Err(err) = socket.send(text).await {
                        self.emit_error(&err);
                    }
                }
                self.0.inner.borrow_mut().fetched_storage = true;
            }

            // Replay anything buffered while disconnected, or queued before
            // the first-ever connection, immediately on entering `open`.
            self.flush_once(socket.as_mut()).await;

            match self.drive_open_connection(socket.as_mut()).await {
                OpenExit::Closed => {},
                OpenExit::Error(err) => self.emit_error(&err),
            }
            socket.close().await;
            self.set_status(ConnectionStatus::Unavailable);
            self.wait_for_retry(backoff.next_delay()).await;
        }
    }

    async fn authenticate(&self) -> Result<String, AuthFailure> {
        let room = self.0.config.room_id.as_str();
        match &self.0.config.auth {
            AuthMethod::PublicApiKey(key) => self
                .0
                .auth_transport
                .authorize(&self.0.config.public_authorize_endpoint, room, Some(key))
                .await
                .map_err(into_auth_failure),
            AuthMethod::Endpoint(AuthEndpoint::Url(url)) => self.0.auth_transport.authorize(url, room, None).await.map_err(into_auth_failure),
            AuthMethod::Endpoint(AuthEndpoint::Callback(callback)) => callback(room).await.map_err(into_auth_failure),
        }
    }

    async fn await_room_state(&self, socket: &mut (dyn Socket + '_)) -> Result<(), RoomError> {
        loop {
            let frame = match socket.recv().await {
                Some(result) => result?,
                None => return Err(RoomError::Transport("socket closed before ROOM_STATE".into())),
            };
            for value in split_batch(&frame)? {
                match ServerMessage::from_value(value) {
                    Ok(ServerMessage::RoomState { your_actor, users }) => {
                        let mut inner = self.0.inner.borrow_mut();
                        inner.document.bind_actor(your_actor);
                        inner.roster = users.into_iter().map(|u| (u.actor, u)).collect();
                        return Ok(());
                    },
                    Ok(_) => warn!(room = %self.0.config.room_id, "unexpected frame before ROOM_STATE"),
                    Err(err) => warn!(room = %self.0.config.room_id, %err, "malformed frame before ROOM_STATE"),
                }
            }
        }
    }

    async fn drive_open_connection(&self, socket: &mut (dyn Socket + '_)) -> OpenExit {
        let mut last_frame_at = Instant::now();
        let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        heartbeat.tick().await;

        loop {
            let flush_deadline = self.0.inner.borrow().coalescer.deadline();
            let flush_sleep = async {
                match flush_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let heartbeat_timeout = tokio::time::sleep_until(last_frame_at + Duration::from_millis(HEARTBEAT_TIMEOUT_MS));

            tokio::select! {
                frame = socket.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            last_frame_at = Instant::now();
                            if let Err(err) = self.handle_incoming(&text) {
                                return OpenExit::Error(err);
                            }
                        },
                        Some(Err(err)) => return OpenExit::Error(err),
                        None => return OpenExit::Closed,
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(err) = socket.ping().await {
                        return OpenExit::Error(err);
                    }
                },
                _ = flush_sleep => {
                    self.flush_once(socket).await;
                },
                _ = heartbeat_timeout => {
                    return OpenExit::Error(RoomError::Transport("heartbeat timeout".into()));
                },
            }
        }
    }

    /// Record a malformed frame or op and, once more than
    /// [`VIOLATION_THRESHOLD`] have landed within [`VIOLATION_WINDOW`],
    /// return an error that forces a reconnect (spec.md §7).
    fn note_violation(&self) -> Result<(), RoomError> {
        let mut inner = self.0.inner.borrow_mut();
        let now = Instant::now();
        inner.violations.retain(|seen| now.saturating_duration_since(*seen) < VIOLATION_WINDOW);
        inner.violations.push_back(now);
        if inner.violations.len() > VIOLATION_THRESHOLD {
            let count = inner.violations.len();
            inner.violations.clear();
            return Err(RoomError::TooManyViolations { count });
        }
        Ok(())
    }

    fn handle_incoming(&self, raw: &str) -> Result<(), RoomError> {
        let values = match split_batch(raw) {
            Ok(values) => values,
            Err(err) => {
                warn!(room = %self.0.config.room_id, %err, "dropping malformed frame");
                self.note_violation()?;
                return Ok(());
            },
        };
        for value in values {
            match ServerMessage::from_value(value) {
                Ok(ServerMessage::UpdatePresence { actor, data }) => {
                    self.0.inner.borrow_mut().presence.apply_remote_patch(actor, data);
                },
                Ok(ServerMessage::UserJoined { actor, info, scopes }) => {
                    let mut inner = self.0.inner.borrow_mut();
                    inner.presence.note_user_joined(actor);
                    inner.roster.insert(actor, RoomUser { actor, info, scopes });
                },
                Ok(ServerMessage::UserLeft { actor }) => {
                    let mut inner = self.0.inner.borrow_mut();
                    inner.presence.note_user_left(actor);
                    inner.roster.remove(&actor);
                },
                Ok(ServerMessage::BroadcastEvent { actor, event }) => {
                    for listener in self.0.broadcast_listeners.borrow_mut().iter_mut() {
                        listener(actor, &event);
                    }
                },
                Ok(ServerMessage::RoomState { your_actor, users }) => {
                    let mut inner = self.0.inner.borrow_mut();
                    inner.document.bind_actor(your_actor);
                    inner.roster = users.into_iter().map(|u| (u.actor, u)).collect();
                },
                Ok(ServerMessage::InitialStorageState { items }) => {
                    self.0.inner.borrow_mut().document.adopt_snapshot(items)?;
                },
                Ok(ServerMessage::UpdateStorage { ops }) => {
                    for op in ops {
                        let result = self.0.inner.borrow_mut().document.apply_remote(op);
                        if let Err(err) = result {
                            warn!(room = %self.0.config.room_id, %err, "dropping malformed remote op");
                            self.note_violation()?;
                        }
                    }
                },
                Err(err) => {
                    warn!(room = %self.0.config.room_id, %err, "dropping malformed frame");
                    self.note_violation()?;
                },
            }
        }

        // A newly joined peer is owed a full presence resync on the next
        // flush (spec.md §4.2 presence diffusion rule).
        let mut inner = self.0.inner.borrow_mut();
        let targets = inner.presence.take_resync_targets();
        if !targets.is_empty() {
            let snapshot = inner.presence.full_snapshot();
            for target in targets {
                inner.coalescer.queue_presence_resync(target, snapshot.clone());
            }
        }
        Ok(())
    }

    async fn flush_once(&self, socket: &mut (dyn Socket + '_)) {
        let frames = self.0.inner.borrow_mut().coalescer.flush();
        for frame in frames {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if let Err(err) = socket.send(text).await {
                self.emit_error(&err);
                break;
            }
        }
    }

    async fn wait_for_retry(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = self.0.retry_notify.notified() => {},
        }
    }
}

fn into_auth_failure(err: RoomError) -> AuthFailure {
    match err {
        RoomError::Auth(failure) => failure,
        other => AuthFailure::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::fake::{FakeAuthTransport, FakeServerHandle, FakeTransport};

    fn room_state_frame(your_actor: u32) -> String {
        json!({ "type": 104, "yourActor": your_actor, "users": [] }).to_string()
    }

    fn initial_storage_frame(items: Vec<(String, Value)>) -> String {
        json!({ "type": 200, "items": items }).to_string()
    }

    async fn wait_for_open(room: &Room) {
        let mut status = room.subscribe_status();
        while *status.borrow() != ConnectionStatus::Open {
            status.changed().await.unwrap();
        }
    }

    /// Spins up a room against a fake transport, completes the handshake up
    /// through `ROOM_STATE` + an empty `INITIAL_STORAGE_STATE`, and drains
    /// the `FETCH_STORAGE` frame the room sends on first entering `open`.
    async fn opened_room() -> (Room, FakeServerHandle) {
        let (transport, server) = FakeTransport::new();
        let auth = FakeAuthTransport { token: "token".to_string() };
        let config = RoomConfig::new(RoomId::new("r1").unwrap(), AuthMethod::PublicApiKey("pk_test".to_string()));
        let room = Room::new(config, Rc::new(transport), Rc::new(auth)).unwrap();
        room.connect();

        server.to_client.send(room_state_frame(1)).unwrap();
        wait_for_open(&room).await;

        let fetch = server.from_client.recv().await.unwrap();
        assert!(fetch.contains("\"type\":200"));
        server.to_client.send(initial_storage_frame(vec![])).unwrap();

        (room, server)
    }

    #[tokio::test]
    async fn s1_room_state_then_empty_storage_yields_open_with_empty_root() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (room, _server) = opened_room().await;
                assert_eq!(room.status(), ConnectionStatus::Open);
                assert!(room.contains(room.root()));
                assert_eq!(room.object_entries(room.root()).unwrap().len(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn s3_two_sets_within_one_throttle_window_coalesce_into_one_frame() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (room, server) = opened_room().await;
                let root = room.root();

                room.object_set(root, "x", SetValue::Json(json!(1))).unwrap();
                room.object_set(root, "x", SetValue::Json(json!(2))).unwrap();

                let frame = server.from_client.recv().await.unwrap();
                let parsed: Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(parsed["type"], 201);
                let ops = parsed["ops"].as_array().unwrap();
                assert_eq!(ops.len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn s4_undo_after_set_emits_single_inverse_op_and_clears_local_state() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (room, server) = opened_room().await;
                let root = room.root();

                room.object_set(root, "x", SetValue::Json(json!(1))).unwrap();
                let _first_flush = server.from_client.recv().await.unwrap();

                room.undo().unwrap();
                assert_eq!(room.object_entries(root).unwrap().len(), 0);

                let frame = server.from_client.recv().await.unwrap();
                let parsed: Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(parsed["type"], 201);
                assert_eq!(parsed["ops"].as_array().unwrap().len(), 1);
            })
            .await;
    }

    /// spec.md §7: repeated malformed frames within the violation window
    /// force a reconnect rather than being dropped forever.
    #[tokio::test]
    async fn repeated_malformed_frames_force_reconnect() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (room, server) = opened_room().await;
                let mut status = room.subscribe_status();

                for _ in 0..=VIOLATION_THRESHOLD {
                    server.to_client.send("not valid json".to_string()).unwrap();
                }

                loop {
                    status.changed().await.unwrap();
                    if *status.borrow() == ConnectionStatus::Unavailable {
                        break;
                    }
                }
            })
            .await;
    }

    #[tokio::test]
    async fn throttle_below_minimum_is_rejected_at_construction() {
        let (transport, _server) = FakeTransport::new();
        let auth = FakeAuthTransport { token: "token".to_string() };
        let mut config = RoomConfig::new(RoomId::new("r1").unwrap(), AuthMethod::PublicApiKey("pk_test".to_string()));
        config.throttle_ms = 50;
        let err = Room::new(config, Rc::new(transport), Rc::new(auth)).unwrap_err();
        assert!(matches!(err, RoomError::InvalidThrottle { value: 50, .. }));
    }
}
