//! Injection seams for the socket and the auth POST (spec.md §6.1
//! `WebSocketPolyfill`/`fetchPolyfill`). `?Send` throughout: the whole room
//! runs on one cooperative task (spec.md §5), so there is no reason to pay
//! for thread-safe futures here.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{AuthFailure, RoomError};

/// A single open duplex connection to the relay server.
#[async_trait(?Send)]
pub trait Socket {
    async fn send(&mut self, text: String) -> Result<(), RoomError>;

    /// Next text frame, or `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<String, RoomError>>;

    /// Send a liveness ping (spec.md §4.1). Transports with no native ping
    /// frame (e.g. the in-process test fake) can leave this a no-op — the
    /// heartbeat timeout is keyed off received frames either way.
    async fn ping(&mut self) -> Result<(), RoomError> {
        Ok(())
    }

    async fn close(&mut self);
}

pub type BoxedSocket = Box<dyn Socket>;

/// Opens a [`Socket`] for a given relay URL. The default impl wraps
/// `tokio-tungstenite`; a host embedding `roomkit` in a non-Tokio-native
/// environment supplies its own.
#[async_trait(?Send)]
pub trait Transport {
    async fn connect(&self, url: &str) -> Result<BoxedSocket, RoomError>;
}

/// Performs the auth POST described in spec.md §6.2. The default impl
/// wraps `reqwest`.
#[async_trait(?Send)]
pub trait AuthTransport {
    async fn authorize(&self, endpoint: &str, room: &str, public_api_key: Option<&str>) -> Result<String, RoomError>;
}

// ── default tokio-tungstenite / reqwest implementations ────────────────────

pub struct TungsteniteSocket {
    inner: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait(?Send)]
impl Socket for TungsteniteSocket {
    async fn send(&mut self, text: String) -> Result<(), RoomError> {
        self.inner.send(Message::Text(text.into())).await.map_err(|e| RoomError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RoomError>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => None,
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => Some(Err(RoomError::Transport(e.to_string()))),
            };
        }
    }

    async fn ping(&mut self) -> Result<(), RoomError> {
        self.inner.send(Message::Ping(Vec::new().into())).await.map_err(|e| RoomError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

#[derive(Debug, Default)]
pub struct TungsteniteTransport;

#[async_trait(?Send)]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<BoxedSocket, RoomError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| RoomError::Transport(e.to_string()))?;
        Ok(Box::new(TungsteniteSocket { inner: stream }))
    }
}

#[derive(Debug, Default)]
pub struct ReqwestAuthTransport {
    client: reqwest::Client,
}

#[async_trait(?Send)]
impl AuthTransport for ReqwestAuthTransport {
    async fn authorize(&self, endpoint: &str, room: &str, public_api_key: Option<&str>) -> Result<String, RoomError> {
        let mut body = json!({ "room": room });
        if let Some(key) = public_api_key {
            body["publicApiKey"] = Value::String(key.to_string());
        }
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| RoomError::Auth(AuthFailure::Transient(e.to_string())))?;

        match response.status().as_u16() {
            200 => {
                let body: Value = response.json().await.map_err(|e| RoomError::Auth(AuthFailure::Transient(e.to_string())))?;
                body.get("token")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| RoomError::Auth(AuthFailure::Transient("auth response missing `token`".into())))
            },
            401 | 403 => Err(RoomError::Auth(AuthFailure::Permanent(format!("HTTP {}", response.status())))),
            status => Err(RoomError::Auth(AuthFailure::Transient(format!("HTTP {status}")))),
        }
    }
}

/// An in-process, mpsc-backed [`Transport`]/[`Socket`] pair standing in for
/// a real WebSocket in tests — the same role the teacher's `StdioTransport`
/// tests give a spawned `cat` process.
pub mod fake {
    use tokio::sync::mpsc;

    use super::*;

    pub struct FakeSocket {
        outbox: mpsc::UnboundedSender<String>,
        inbox: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait(?Send)]
    impl Socket for FakeSocket {
        async fn send(&mut self, text: String) -> Result<(), RoomError> {
            self.outbox.send(text).map_err(|_| RoomError::Transport("fake socket closed".into()))
        }

        async fn recv(&mut self) -> Option<Result<String, RoomError>> {
            self.inbox.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.inbox.close();
        }
    }

    /// The test-side handle: send frames the client will receive, and
    /// observe frames the client sends.
    pub struct FakeServerHandle {
        pub to_client: mpsc::UnboundedSender<String>,
        pub from_client: mpsc::UnboundedReceiver<String>,
    }

    pub struct FakeTransport {
        socket: std::cell::RefCell<Option<FakeSocket>>,
    }

    impl FakeTransport {
        pub fn new() -> (Self, FakeServerHandle) {
            let (to_client, client_inbox) = mpsc::unbounded_channel();
            let (client_outbox, from_client) = mpsc::unbounded_channel();
            let transport = Self {
                socket: std::cell::RefCell::new(Some(FakeSocket { outbox: client_outbox, inbox: client_inbox })),
            };
            (transport, FakeServerHandle { to_client, from_client })
        }
    }

    #[async_trait(?Send)]
    impl Transport for FakeTransport {
        async fn connect(&self, _url: &str) -> Result<BoxedSocket, RoomError> {
            self.socket
                .borrow_mut()
                .take()
                .map(|s| Box::new(s) as BoxedSocket)
                .ok_or_else(|| RoomError::Transport("fake transport already connected once".into()))
        }
    }

    pub struct FakeAuthTransport {
        pub token: String,
    }

    #[async_trait(?Send)]
    impl AuthTransport for FakeAuthTransport {
        async fn authorize(&self, _endpoint: &str, _room: &str, _public_api_key: Option<&str>) -> Result<String, RoomError> {
            Ok(self.token.clone())
        }
    }
}
