//! Transport Module - Streaming-Verbindung zum Agenten
//!
//! - JSON-Nachrichten des Live-Protokolls
//! - WebSocket-Client mit Zustandsmaschine und ausgehender Queue

mod client;
mod messages;

pub use client::{SessionTransport, TransportError, TransportEvent, TransportState};
pub use messages::{ClientMessage, ServerMessage, Setup};
