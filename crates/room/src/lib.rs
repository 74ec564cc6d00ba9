//! The room connection state machine: authentication, reconnect-with-backoff,
//! heartbeat, outbound coalescing, and the `Room` facade that ties storage and
//! presence to the wire (spec.md §4.1, §4.2, §4.6).

mod backoff;
mod coalescer;
mod error;
mod room;
mod state;
mod transport;

pub use error::{AuthFailure, RoomError};
pub use room::{AuthEndpoint, AuthMethod, Room, RoomConfig, DEFAULT_PUBLIC_AUTHORIZE_ENDPOINT, DEFAULT_RELAY_SERVER};
pub use state::ConnectionStatus;
pub use transport::{AuthTransport, BoxedSocket, ReqwestAuthTransport, Socket, Transport, TungsteniteSocket, TungsteniteTransport};

pub mod fake_transport {
    pub use crate::transport::fake::*;
}
