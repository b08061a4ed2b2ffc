//! Realtime service connection
//!
//! Wire types, the duplex transport, and assistant transcript aggregation.
//!
//! # Architecture
//!
//! ```text
//! ClientMessage ──to_json──▶ TransportChannels.outgoing ──▶ WebSocket
//!                                                              │
//! ServerMessage ◀──parse──── TransportChannels.incoming ◀──────┘
//! ```
//!
//! Connection loss is reported, never retried: the user reconnects.

mod protocol;
mod transcript_aggregator;
mod transport;

pub use protocol::{
    ClientMessage, ContentPart, ConversationItem, ErrorInfo, ResponseInfo, ServerMessage,
    SessionInfo, REALTIME_API_URL,
};
pub use transcript_aggregator::TranscriptAggregator;
pub use transport::{
    ConnectRequest, Connector, TransportChannels, TransportEvent, WebSocketConnector, CLOSE_NORMAL,
};
pub(crate) use transport::connect_with_timeout;
