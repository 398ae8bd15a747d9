//! Client-side chat sessions with the agent

pub mod channel;
pub mod transport;

pub use channel::{SessionChannel, SessionConfig};
pub use transport::{OutboundFrame, Transport, TransportEvent, TransportLink, WebSocketTransport};
