//! Transaction demarcation behavior of the `TransactionalRouter`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use internode_protocol::config::INTERNAL_SAVEPOINT;
use internode_protocol::error::{DbError, DbResult, ProtocolError};
use internode_protocol::router::{
    Prepared, QueryResult, Router, Session, StatementKind, TransactionId, TransactionalRouter,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    GetTransaction,
    SetAutoCommit(bool),
    AddSavepoint(String),
    Commit(bool),
    Rollback,
    RollbackToSavepoint(String),
}

#[derive(Default)]
struct RecordingSession {
    auto_commit: Mutex<bool>,
    calls: Mutex<Vec<Call>>,
    fail_rollback: bool,
    fail_savepoint: bool,
}

impl RecordingSession {
    fn new(auto_commit: bool) -> Self {
        Self {
            auto_commit: Mutex::new(auto_commit),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

impl Session for RecordingSession {
    fn get_transaction(&self, _prepared: &Prepared) -> DbResult<TransactionId> {
        self.record(Call::GetTransaction);
        Ok(1)
    }

    fn is_auto_commit(&self) -> bool {
        *self.auto_commit.lock().unwrap()
    }

    fn set_auto_commit(&self, auto_commit: bool) {
        *self.auto_commit.lock().unwrap() = auto_commit;
        self.record(Call::SetAutoCommit(auto_commit));
    }

    fn add_savepoint(&self, name: &str) -> DbResult<()> {
        self.record(Call::AddSavepoint(name.to_string()));
        if self.fail_savepoint {
            return Err(DbError::Transaction("savepoint refused".into()));
        }
        Ok(())
    }

    fn commit(&self, ddl: bool) -> DbResult<()> {
        self.record(Call::Commit(ddl));
        Ok(())
    }

    fn rollback(&self) -> DbResult<()> {
        self.record(Call::Rollback);
        if self.fail_rollback {
            return Err(DbError::Transaction("rollback refused".into()));
        }
        Ok(())
    }

    fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        self.record(Call::RollbackToSavepoint(name.to_string()));
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Succeed(i32),
    Fail,
    Hang,
}

struct StubRouter {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl StubRouter {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    async fn run(&self) -> DbResult<i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed(n) => Ok(n),
            Behavior::Fail => Err(DbError::Protocol(ProtocolError::Remote {
                code: 1,
                message: "constraint violated".into(),
            })),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
        }
    }
}

impl Router for StubRouter {
    async fn execute_define_command(&self, _prepared: &Prepared) -> DbResult<i32> {
        self.run().await
    }

    async fn execute_select(
        &self,
        _prepared: &Prepared,
        _max_rows: i32,
        _scrollable: bool,
    ) -> DbResult<QueryResult> {
        self.run().await.map(|_| QueryResult::default())
    }

    async fn execute_insert(&self, _prepared: &Prepared) -> DbResult<i32> {
        self.run().await
    }

    async fn execute_update(&self, _prepared: &Prepared) -> DbResult<i32> {
        self.run().await
    }

    async fn execute_delete(&self, _prepared: &Prepared) -> DbResult<i32> {
        self.run().await
    }

    async fn execute_merge(&self, _prepared: &Prepared) -> DbResult<i32> {
        self.run().await
    }
}

fn batch(kind: StatementKind, session: &Arc<RecordingSession>) -> Prepared {
    Prepared::new(kind, session.clone()).with_batch(true)
}

#[tokio::test]
async fn top_level_batch_commits_and_restores_auto_commit() {
    let session = Arc::new(RecordingSession::new(true));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Succeed(7)));

    let count = router
        .execute(&batch(StatementKind::Update, &session))
        .await
        .unwrap();

    assert_eq!(count, 7);
    assert_eq!(
        session.calls(),
        vec![
            Call::GetTransaction,
            Call::SetAutoCommit(false),
            Call::Commit(false),
            Call::SetAutoCommit(true),
        ]
    );
    assert!(session.is_auto_commit());
}

#[tokio::test]
async fn top_level_failure_rolls_back_and_restores_auto_commit() {
    let session = Arc::new(RecordingSession::new(true));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Fail));

    let err = router
        .execute(&batch(StatementKind::Insert, &session))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DbError::Protocol(ProtocolError::Remote { code: 1, .. })
    ));
    assert_eq!(session.count(|c| *c == Call::Rollback), 1);
    assert_eq!(session.count(|c| matches!(c, Call::Commit(_))), 0);
    assert_eq!(session.calls().last(), Some(&Call::SetAutoCommit(true)));
}

#[tokio::test]
async fn failed_rollback_still_reports_original_error() {
    let session = Arc::new(RecordingSession {
        fail_rollback: true,
        ..RecordingSession::new(true)
    });
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Fail));

    let err = router
        .execute(&batch(StatementKind::Delete, &session))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Protocol(ProtocolError::Remote { .. })));
    assert!(session.is_auto_commit());
}

#[tokio::test]
async fn nested_batch_uses_internal_savepoint() {
    let session = Arc::new(RecordingSession::new(false));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Fail));

    router
        .execute(&batch(StatementKind::Merge, &session))
        .await
        .unwrap_err();

    assert_eq!(
        session.calls(),
        vec![
            Call::GetTransaction,
            Call::AddSavepoint(INTERNAL_SAVEPOINT.to_string()),
            Call::RollbackToSavepoint(INTERNAL_SAVEPOINT.to_string()),
        ]
    );
    assert!(!session.is_auto_commit());
}

#[tokio::test]
async fn nested_success_neither_commits_nor_touches_auto_commit() {
    let session = Arc::new(RecordingSession::new(false));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Succeed(2)));

    assert_eq!(
        router
            .execute(&batch(StatementKind::Update, &session))
            .await
            .unwrap(),
        2
    );
    assert_eq!(session.count(|c| matches!(c, Call::Commit(_))), 0);
    assert_eq!(session.count(|c| matches!(c, Call::SetAutoCommit(_))), 0);
}

#[tokio::test]
async fn savepoint_failure_skips_execution() {
    let session = Arc::new(RecordingSession {
        fail_savepoint: true,
        ..RecordingSession::new(false)
    });
    let stub = StubRouter::new(Behavior::Succeed(1));
    let router = TransactionalRouter::new(stub);

    let err = router
        .execute(&batch(StatementKind::Update, &session))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Transaction(_)));
    assert_eq!(router.nested().calls.load(Ordering::SeqCst), 0);
    assert_eq!(session.count(|c| matches!(c, Call::RollbackToSavepoint(_))), 0);
}

#[tokio::test]
async fn local_or_single_statements_run_without_demarcation() {
    let kinds = [
        StatementKind::Insert,
        StatementKind::Update,
        StatementKind::Delete,
        StatementKind::Merge,
    ];
    let cases: [fn(StatementKind, &Arc<RecordingSession>) -> Prepared; 2] = [
        |kind, s| Prepared::new(kind, s.clone()),
        |kind, s| batch(kind, s).with_local(true),
    ];
    for kind in kinds {
        for prepared_fn in cases {
            let session = Arc::new(RecordingSession::new(true));
            let router = TransactionalRouter::new(StubRouter::new(Behavior::Fail));

            router
                .execute(&prepared_fn(kind, &session))
                .await
                .unwrap_err();

            assert_eq!(session.calls(), vec![Call::GetTransaction], "{kind:?}");
            assert_eq!(router.nested().calls.load(Ordering::SeqCst), 1);
        }
    }
}

#[tokio::test]
async fn non_dml_is_rejected_before_begin() {
    let session = Arc::new(RecordingSession::new(true));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Succeed(1)));

    let err = router
        .execute(&batch(StatementKind::Select, &session))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DbError::UnsupportedStatement(StatementKind::Select)
    ));
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn define_and_select_begin_transaction_then_delegate() {
    let session = Arc::new(RecordingSession::new(true));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Succeed(0)));

    let define = Prepared::new(StatementKind::Define, session.clone());
    router.execute_define_command(&define).await.unwrap();
    let select = Prepared::new(StatementKind::Select, session.clone());
    router.execute_select(&select, 10, false).await.unwrap();

    assert_eq!(session.calls(), vec![Call::GetTransaction, Call::GetTransaction]);
    assert_eq!(router.nested().calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn router_entry_points_route_through_execute() {
    let session = Arc::new(RecordingSession::new(true));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Succeed(1)));

    let total = router
        .execute_insert(&batch(StatementKind::Insert, &session))
        .await
        .unwrap()
        + router
            .execute_delete(&batch(StatementKind::Delete, &session))
            .await
            .unwrap();

    assert_eq!(total, 2);
    assert_eq!(session.count(|c| *c == Call::Commit(false)), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_execution_rolls_back() {
    let session = Arc::new(RecordingSession::new(true));
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Hang));
    let prepared = batch(StatementKind::Update, &session);

    let outcome =
        tokio::time::timeout(Duration::from_millis(50), router.execute(&prepared)).await;

    assert!(outcome.is_err());
    assert_eq!(session.count(|c| *c == Call::Rollback), 1);
    assert_eq!(session.calls().last(), Some(&Call::SetAutoCommit(true)));
    assert!(session.is_auto_commit());
}

#[tokio::test]
async fn server_session_round_trip() {
    use internode_protocol::router::ServerSession;

    let session = Arc::new(ServerSession::new());
    let router = TransactionalRouter::new(StubRouter::new(Behavior::Succeed(4)));
    let prepared = Prepared::new(StatementKind::Insert, session.clone()).with_batch(true);

    assert_eq!(router.execute(&prepared).await.unwrap(), 4);
    assert!(session.transaction().is_none());
    assert!(session.is_auto_commit());
}
