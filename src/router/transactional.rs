//! Transaction demarcation stage.
//!
//! Every statement first attaches a transaction on its session. Write
//! statements that are both non-local and batched must then apply atomically
//! across nodes:
//!
//! - on an auto-commit session the router owns a *top* transaction: it turns
//!   auto-commit off, commits on success, rolls back on failure and always
//!   turns auto-commit back on;
//! - inside an open transaction it is a *nested* participant: it pushes
//!   [`INTERNAL_SAVEPOINT`] and on failure rolls back to it only.
//!
//! Everything else runs in whatever transaction context already exists.

use tracing::{debug, warn};

use crate::config::INTERNAL_SAVEPOINT;
use crate::error::{DbError, DbResult};
use crate::router::session::{Prepared, Session};
use crate::router::{QueryResult, Router, StatementKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    None,
    Top,
    Nested,
}

/// Finishes the demarcation exactly once, including when the execution
/// future is dropped before it settles.
struct Demarcation<'a> {
    session: &'a dyn Session,
    role: Role,
    settled: bool,
}

impl<'a> Demarcation<'a> {
    fn new(session: &'a dyn Session, role: Role) -> Self {
        Self {
            session,
            role,
            settled: false,
        }
    }

    fn settle(&mut self, failed: bool) {
        self.settled = true;
        if failed {
            let undo = match self.role {
                Role::Top => self.session.rollback(),
                Role::Nested => self.session.rollback_to_savepoint(INTERNAL_SAVEPOINT),
                Role::None => Ok(()),
            };
            if let Err(e) = undo {
                warn!(role = ?self.role, error = %e, "Rollback failed");
            }
        }
        if self.role == Role::Top {
            self.session.set_auto_commit(true);
        }
    }
}

impl Drop for Demarcation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(role = ?self.role, "Statement cancelled, undoing its work");
            self.settle(true);
        }
    }
}

/// Wraps the next routing stage with transaction demarcation.
pub struct TransactionalRouter<R> {
    nested: R,
}

impl<R: Router> TransactionalRouter<R> {
    pub fn new(nested: R) -> Self {
        Self { nested }
    }

    pub fn nested(&self) -> &R {
        &self.nested
    }

    fn begin_transaction(prepared: &Prepared) -> DbResult<()> {
        prepared.session().get_transaction(prepared).map(|_| ())
    }

    /// Run a write statement under the demarcation rules above and return
    /// its update count.
    pub async fn execute(&self, prepared: &Prepared) -> DbResult<i32> {
        let kind = prepared.kind();
        if !kind.is_dml() {
            return Err(DbError::UnsupportedStatement(kind));
        }
        Self::begin_transaction(prepared)?;

        let session: &dyn Session = prepared.session().as_ref();
        let role = if !prepared.is_local() && prepared.is_batch() {
            if session.is_auto_commit() {
                session.set_auto_commit(false);
                Role::Top
            } else {
                session.add_savepoint(INTERNAL_SAVEPOINT)?;
                Role::Nested
            }
        } else {
            Role::None
        };

        let mut demarcation = Demarcation::new(session, role);
        let result = self.run(prepared, kind, role, session).await;
        demarcation.settle(result.is_err());
        result.map_err(DbError::convert)
    }

    async fn run(
        &self,
        prepared: &Prepared,
        kind: StatementKind,
        role: Role,
        session: &dyn Session,
    ) -> DbResult<i32> {
        let update_count = match kind {
            StatementKind::Insert => self.nested.execute_insert(prepared).await?,
            StatementKind::Update => self.nested.execute_update(prepared).await?,
            StatementKind::Delete => self.nested.execute_delete(prepared).await?,
            StatementKind::Merge => self.nested.execute_merge(prepared).await?,
            other => return Err(DbError::UnsupportedStatement(other)),
        };
        if role == Role::Top {
            session.commit(false)?;
        }
        Ok(update_count)
    }
}

impl<R: Router> Router for TransactionalRouter<R> {
    async fn execute_define_command(&self, prepared: &Prepared) -> DbResult<i32> {
        Self::begin_transaction(prepared)?;
        self.nested.execute_define_command(prepared).await
    }

    async fn execute_select(
        &self,
        prepared: &Prepared,
        max_rows: i32,
        scrollable: bool,
    ) -> DbResult<QueryResult> {
        Self::begin_transaction(prepared)?;
        self.nested
            .execute_select(prepared, max_rows, scrollable)
            .await
    }

    async fn execute_insert(&self, prepared: &Prepared) -> DbResult<i32> {
        self.execute(prepared).await
    }

    async fn execute_update(&self, prepared: &Prepared) -> DbResult<i32> {
        self.execute(prepared).await
    }

    async fn execute_delete(&self, prepared: &Prepared) -> DbResult<i32> {
        self.execute(prepared).await
    }

    async fn execute_merge(&self, prepared: &Prepared) -> DbResult<i32> {
        self.execute(prepared).await
    }
}
