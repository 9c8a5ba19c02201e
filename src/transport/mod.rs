//! # Transport Layer
//!
//! TCP connections between cluster nodes.
//!
//! - **Incoming**: the accepting side, one read loop per connection
//! - **Outbound**: the connecting side, write-only after the handshake
//! - **Stream**: plain buffered or LZ4 block streams under the frame codec

pub mod incoming;
pub mod outbound;
pub mod stream;

pub use incoming::{
    ConnectionContext, ConnectionEnd, ConnectionState, ConnectionStats, ConnectionSummary,
    IncomingConnection,
};
pub use outbound::{OutboundConnection, OutboundOptions};
pub use stream::{InboundStream, OutboundStream};
