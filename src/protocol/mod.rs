//! # Protocol Layer
//!
//! Connection handshake, peer version bookkeeping and message dispatch.
//!
//! ## Components
//! - **Handshake**: preamble, version exchange, endpoint identity
//! - **Versions**: shared table of peer protocol versions
//! - **Membership**: where peers that are ahead of us get saved
//! - **Dispatcher**: correlation-id callbacks and request handlers
//!
//! ## Handshake Flow
//! ```text
//! Connecting side                      Accepting side
//!   |-- Magic + Header(version, lz4) ----->|
//!   |<--------------- Max version ---------|
//!   |-- Max version + Endpoint ----------->|
//!   |== Frames (optionally LZ4 blocks) ===>|
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod membership;
pub mod versions;

pub use dispatcher::{DispatchOutcome, Dispatcher, InboundMessage, ResponseHandle};
pub use membership::{Membership, SavedEndpoints};
pub use versions::VersionTable;
