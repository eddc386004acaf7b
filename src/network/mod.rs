//! Network subsystem for the WebSocket relay link

pub mod outbound;
pub mod state;
pub mod transport;

pub use outbound::{Outbound, OutboundPolicy};
pub use state::{ConnectionState, ReconnectPolicy};
pub use transport::{validate_url, InboundSink, RelayTransport, TransportConfig, TransportStats};
