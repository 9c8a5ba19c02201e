//! # Internode Protocol
//!
//! Cluster messaging and transactional statement routing for a distributed
//! SQL node.
//!
//! ## Layers
//! - [`router`]: transaction demarcation and remote statement execution
//! - [`service`]: the messaging service and the statement service
//! - [`transport`]: incoming and outbound TCP connections
//! - [`protocol`]: handshake, peer versions and dispatch
//! - [`core`]: values, packets and the frame codec
//! - [`utils`]: compression, logging, metrics and time
//!
//! ## Quick Start
//! ```rust,no_run
//! use std::sync::Arc;
//! use internode_protocol::config::MessagingConfig;
//! use internode_protocol::protocol::SavedEndpoints;
//! use internode_protocol::service::MessagingService;
//!
//! # async fn run() -> internode_protocol::error::Result<()> {
//! let messaging = MessagingService::bind(
//!     MessagingConfig::default(),
//!     Arc::new(SavedEndpoints::new()),
//! )
//! .await?;
//! println!("listening on {}", messaging.local_endpoint());
//! messaging.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod router;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{ClusterConfig, MessagingConfig, CURRENT_VERSION};
pub use core::packet::{Packet, PacketType};
pub use error::{DbError, DbResult, ProtocolError, Result};
pub use router::{Prepared, Router, ServerSession, Session, TransactionalRouter};
pub use service::{MessagingService, StatementService};
