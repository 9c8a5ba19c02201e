//! Sessions and prepared statements as the router sees them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::core::value::{PageKey, Value};
use crate::error::{constants, DbError, DbResult};
use crate::router::StatementKind;

/// Identifies a session's current transaction.
pub type TransactionId = u64;

/// Transaction primitives of a client session.
///
/// A session is driven by one caller at a time; implementations only need
/// interior mutability, not ordering across callers.
pub trait Session: Send + Sync {
    /// Attach a transaction for `prepared`, reusing the current one if any.
    fn get_transaction(&self, prepared: &Prepared) -> DbResult<TransactionId>;

    fn is_auto_commit(&self) -> bool;

    fn set_auto_commit(&self, auto_commit: bool);

    fn add_savepoint(&self, name: &str) -> DbResult<()>;

    /// Commit the current transaction. `ddl` marks a schema change.
    fn commit(&self, ddl: bool) -> DbResult<()>;

    fn rollback(&self) -> DbResult<()>;

    /// Undo everything after savepoint `name`, keeping the transaction open.
    fn rollback_to_savepoint(&self, name: &str) -> DbResult<()>;
}

/// A statement ready to be routed.
///
/// Built once by the preparation layer and consumed by one execution.
#[derive(Clone)]
pub struct Prepared {
    kind: StatementKind,
    local: bool,
    batch: bool,
    session: Arc<dyn Session>,
    sql: String,
    command_id: i32,
    parameters: Vec<Value>,
    page_keys: Vec<PageKey>,
    replication_name: Option<String>,
    fetch_size: i32,
}

impl Prepared {
    pub fn new(kind: StatementKind, session: Arc<dyn Session>) -> Self {
        Self {
            kind,
            local: false,
            batch: false,
            session,
            sql: String::new(),
            command_id: 0,
            parameters: Vec::new(),
            page_keys: Vec::new(),
            replication_name: None,
            fetch_size: 0,
        }
    }

    /// Executes on this node only.
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Touches several rows or targets that must change together.
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = sql.into();
        self
    }

    pub fn with_command_id(mut self, command_id: i32) -> Self {
        self.command_id = command_id;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_page_keys(mut self, page_keys: Vec<PageKey>) -> Self {
        self.page_keys = page_keys;
        self
    }

    pub fn with_replication_name(mut self, name: impl Into<String>) -> Self {
        self.replication_name = Some(name.into());
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: i32) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn command_id(&self) -> i32 {
        self.command_id
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn page_keys(&self) -> &[PageKey] {
        &self.page_keys
    }

    pub fn replication_name(&self) -> Option<&str> {
        self.replication_name.as_deref()
    }

    pub fn fetch_size(&self) -> i32 {
        self.fetch_size
    }
}

impl fmt::Debug for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("batch", &self.batch)
            .field("sql", &self.sql)
            .field("command_id", &self.command_id)
            .finish()
    }
}

#[derive(Debug)]
struct SessionState {
    auto_commit: bool,
    savepoints: Vec<String>,
    transaction: Option<TransactionId>,
}

/// In-memory session.
#[derive(Debug)]
pub struct ServerSession {
    state: Mutex<SessionState>,
    next_transaction: AtomicU64,
}

impl Default for ServerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                auto_commit: true,
                savepoints: Vec::new(),
                transaction: None,
            }),
            next_transaction: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn transaction(&self) -> Option<TransactionId> {
        self.state().transaction
    }

    pub fn savepoints(&self) -> Vec<String> {
        self.state().savepoints.clone()
    }

    fn end_transaction(&self) -> Option<TransactionId> {
        let mut state = self.state();
        state.savepoints.clear();
        state.transaction.take()
    }
}

impl Session for ServerSession {
    fn get_transaction(&self, _prepared: &Prepared) -> DbResult<TransactionId> {
        let mut state = self.state();
        if let Some(id) = state.transaction {
            return Ok(id);
        }
        let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        state.transaction = Some(id);
        trace!(transaction = id, "Transaction started");
        Ok(id)
    }

    fn is_auto_commit(&self) -> bool {
        self.state().auto_commit
    }

    fn set_auto_commit(&self, auto_commit: bool) {
        self.state().auto_commit = auto_commit;
    }

    fn add_savepoint(&self, name: &str) -> DbResult<()> {
        let mut state = self.state();
        if state.transaction.is_none() {
            return Err(DbError::Transaction(constants::ERR_NO_TRANSACTION.into()));
        }
        state.savepoints.push(name.to_string());
        Ok(())
    }

    fn commit(&self, _ddl: bool) -> DbResult<()> {
        if let Some(id) = self.end_transaction() {
            trace!(transaction = id, "Transaction committed");
        }
        Ok(())
    }

    fn rollback(&self) -> DbResult<()> {
        if let Some(id) = self.end_transaction() {
            trace!(transaction = id, "Transaction rolled back");
        }
        Ok(())
    }

    fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        let mut state = self.state();
        match state.savepoints.iter().rposition(|s| s == name) {
            Some(pos) => {
                state.savepoints.truncate(pos);
                Ok(())
            }
            None => Err(DbError::Transaction(format!("Savepoint not found: {name}"))),
        }
    }
}
