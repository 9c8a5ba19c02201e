//! # Core Protocol Components
//!
//! Values, packets, the packet registry and the message frame codec.
//!
//! ## Components
//! - **Value / PageKey**: tagged SQL values and partition routing keys
//! - **Wire**: bounds-checked primitive field reads and writes
//! - **Packet**: typed, versioned packet bodies
//! - **Registry**: packet type tag to decoder
//! - **Codec**: Tokio codec for message frames
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Id(4)] [Timestamp(4)] [Type(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB (prevents memory exhaustion)
//! - Magic number checked before anything else in the frame
//! - Counts and lengths validated against the bytes present before allocation

pub mod codec;
pub mod packet;
pub mod registry;
pub mod value;
pub mod wire;
