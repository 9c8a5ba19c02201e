//! # Utility Modules
//!
//! Supporting utilities for compression, logging, metrics and timing.
//!
//! ## Components
//! - **Compression**: LZ4 block stream with xxHash32 block checksums
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Wall clock and cross-node timestamp reconciliation
//!
//! ## Security
//! - Block sizes capped at 64 KiB before any allocation
//! - Every decompressed block is checksummed

pub mod compression;
pub mod logging;
pub mod metrics;
pub mod time;

pub use compression::Lz4BlockCodec;
pub use metrics::{Metrics, MetricsSnapshot};
