//! # Statement Routing
//!
//! Routers form a pipeline: [`TransactionalRouter`] decides transaction
//! boundaries and hands the statement to the next stage, normally a
//! [`RemoteRouter`] that executes it on the nodes owning its data.
//!
//! ```text
//! Prepared -> TransactionalRouter -> RemoteRouter -> MessagingService -> peers
//! ```

use std::future::Future;

use crate::core::value::Value;
use crate::error::DbResult;

pub mod remote;
pub mod session;
pub mod transactional;

pub use remote::{Placement, RemoteRouter};
pub use session::{Prepared, ServerSession, Session, TransactionId};
pub use transactional::TransactionalRouter;

/// Kind of a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Merge,
    /// DDL
    Define,
    Select,
}

impl StatementKind {
    /// Statements that return an update count and may need demarcation.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            StatementKind::Insert
                | StatementKind::Update
                | StatementKind::Delete
                | StatementKind::Merge
        )
    }
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub column_count: i32,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// One stage of the routing pipeline.
pub trait Router: Send + Sync {
    fn execute_define_command(
        &self,
        prepared: &Prepared,
    ) -> impl Future<Output = DbResult<i32>> + Send;

    fn execute_select(
        &self,
        prepared: &Prepared,
        max_rows: i32,
        scrollable: bool,
    ) -> impl Future<Output = DbResult<QueryResult>> + Send;

    fn execute_insert(&self, prepared: &Prepared) -> impl Future<Output = DbResult<i32>> + Send;

    fn execute_update(&self, prepared: &Prepared) -> impl Future<Output = DbResult<i32>> + Send;

    fn execute_delete(&self, prepared: &Prepared) -> impl Future<Output = DbResult<i32>> + Send;

    fn execute_merge(&self, prepared: &Prepared) -> impl Future<Output = DbResult<i32>> + Send;
}
