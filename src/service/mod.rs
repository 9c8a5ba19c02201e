//! # Node Services
//!
//! - **Messaging**: listener, outbound pool and request/response plumbing
//! - **Statements**: executes statements routed here by peers

pub mod messaging;
pub mod statements;

pub use messaging::MessagingService;
pub use statements::{
    PreparedInfo, QueryRequest, StatementExecutor, StatementService, UpdateRequest,
};
