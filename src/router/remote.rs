//! Execution stage that runs statements on the nodes owning their data.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use tracing::{debug, instrument, trace};

use crate::core::packet::{
    Packet, PreparedStatementPrepare, PreparedStatementQuery, PreparedStatementUpdate,
    QueryHeader, StatementQuery, StatementUpdate,
};
use crate::error::{DbError, DbResult, ProtocolError};
use crate::router::session::Prepared;
use crate::router::{QueryResult, Router};
use crate::service::messaging::MessagingService;

/// Names the nodes a statement must run on.
pub trait Placement: Send + Sync {
    fn targets(&self, prepared: &Prepared) -> DbResult<Vec<SocketAddr>>;
}

impl<F> Placement for F
where
    F: Fn(&Prepared) -> DbResult<Vec<SocketAddr>> + Send + Sync,
{
    fn targets(&self, prepared: &Prepared) -> DbResult<Vec<SocketAddr>> {
        self(prepared)
    }
}

pub struct RemoteRouter<P> {
    messaging: Arc<MessagingService>,
    placement: P,
    prepared_on: Mutex<HashSet<(SocketAddr, i32)>>,
    next_result_id: AtomicI32,
}

impl<P: Placement> RemoteRouter<P> {
    pub fn new(messaging: Arc<MessagingService>, placement: P) -> Self {
        Self {
            messaging,
            placement,
            prepared_on: Mutex::new(HashSet::new()),
            next_result_id: AtomicI32::new(1),
        }
    }

    pub fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    /// Whether `command_id` is already prepared on `target`.
    pub fn is_prepared_on(&self, target: SocketAddr, command_id: i32) -> bool {
        self.prepared()
            .map(|set| set.contains(&(target, command_id)))
            .unwrap_or(false)
    }

    fn prepared(&self) -> DbResult<std::sync::MutexGuard<'_, HashSet<(SocketAddr, i32)>>> {
        self.prepared_on
            .lock()
            .map_err(|_| DbError::general("Prepared statement cache lock poisoned"))
    }

    fn targets(&self, prepared: &Prepared) -> DbResult<Vec<SocketAddr>> {
        let targets = self.placement.targets(prepared)?;
        if targets.is_empty() {
            return Err(DbError::general(format!(
                "No target nodes for statement: {}",
                prepared.sql()
            )));
        }
        Ok(targets)
    }

    async fn request(&self, packet: Packet, to: SocketAddr) -> DbResult<Packet> {
        let handle = self.messaging.send_request(packet, to).await?;
        Ok(handle.wait().await?)
    }

    async fn ensure_prepared(&self, prepared: &Prepared, target: SocketAddr) -> DbResult<()> {
        let command_id = prepared.command_id();
        if self.is_prepared_on(target, command_id) {
            return Ok(());
        }
        let request = PreparedStatementPrepare {
            command_id,
            sql: prepared.sql().to_string(),
        };
        match self.request(request.into(), target).await? {
            Packet::PreparedStatementPrepareAck(ack) => {
                trace!(peer = %target, command_id, parameters = ack.parameter_count, "Statement prepared");
                self.prepared()?.insert((target, command_id));
                Ok(())
            }
            other => Err(unexpected_ack(&other)),
        }
    }

    async fn update_on(&self, prepared: &Prepared, target: SocketAddr) -> DbResult<i32> {
        let packet: Packet = if prepared.parameters().is_empty() {
            StatementUpdate {
                page_keys: prepared.page_keys().to_vec(),
                sql: prepared.sql().to_string(),
                replication_name: prepared.replication_name().map(str::to_string),
            }
            .into()
        } else {
            self.ensure_prepared(prepared, target).await?;
            PreparedStatementUpdate {
                page_keys: prepared.page_keys().to_vec(),
                command_id: prepared.command_id(),
                parameters: prepared.parameters().to_vec(),
                replication_name: prepared.replication_name().map(str::to_string),
            }
            .into()
        };
        match self.request(packet, target).await? {
            Packet::StatementUpdateAck(ack) => Ok(ack.update_count),
            other => Err(unexpected_ack(&other)),
        }
    }

    async fn query_on(
        &self,
        prepared: &Prepared,
        target: SocketAddr,
        header: QueryHeader,
    ) -> DbResult<QueryResult> {
        let packet: Packet = if prepared.parameters().is_empty() {
            StatementQuery {
                query: header,
                sql: prepared.sql().to_string(),
            }
            .into()
        } else {
            self.ensure_prepared(prepared, target).await?;
            PreparedStatementQuery {
                query: header,
                command_id: prepared.command_id(),
                parameters: prepared.parameters().to_vec(),
            }
            .into()
        };
        match self.request(packet, target).await? {
            Packet::StatementQueryAck(ack) => Ok(QueryResult {
                column_count: ack.column_count,
                rows: ack.rows,
            }),
            other => Err(unexpected_ack(&other)),
        }
    }

    /// Run an update on every target concurrently and sum the counts.
    #[instrument(skip_all, fields(kind = ?prepared.kind(), command_id = prepared.command_id()))]
    pub async fn update(&self, prepared: &Prepared) -> DbResult<i32> {
        let targets = self.targets(prepared)?;
        let counts =
            try_join_all(targets.iter().map(|&target| self.update_on(prepared, target))).await?;
        let total = counts.iter().fold(0i32, |acc, c| acc.saturating_add(*c));
        debug!(targets = targets.len(), total, "Update applied");
        Ok(total)
    }

    /// Query every target and concatenate rows, keeping at most `max_rows`
    /// when it is positive.
    #[instrument(skip_all, fields(command_id = prepared.command_id()))]
    pub async fn query(
        &self,
        prepared: &Prepared,
        max_rows: i32,
        scrollable: bool,
    ) -> DbResult<QueryResult> {
        let targets = self.targets(prepared)?;
        let result_id = self.next_result_id.fetch_add(1, Ordering::Relaxed);
        let header = QueryHeader {
            page_keys: prepared.page_keys().to_vec(),
            result_id,
            max_rows,
            fetch_size: prepared.fetch_size(),
            scrollable,
        };
        let parts = try_join_all(
            targets
                .iter()
                .map(|&target| self.query_on(prepared, target, header.clone())),
        )
        .await?;

        let limit = usize::try_from(max_rows).ok().filter(|&n| n > 0);
        let mut merged = QueryResult::default();
        for part in parts {
            if merged.column_count == 0 {
                merged.column_count = part.column_count;
            }
            merged.rows.extend(part.rows);
        }
        if let Some(limit) = limit {
            merged.rows.truncate(limit);
        }
        debug!(targets = targets.len(), rows = merged.row_count(), "Query complete");
        Ok(merged)
    }
}

fn unexpected_ack(packet: &Packet) -> DbError {
    DbError::Protocol(ProtocolError::Decode(format!(
        "Unexpected {} in reply",
        packet.packet_type()
    )))
}

impl<P: Placement> Router for RemoteRouter<P> {
    async fn execute_define_command(&self, prepared: &Prepared) -> DbResult<i32> {
        self.update(prepared).await
    }

    async fn execute_select(
        &self,
        prepared: &Prepared,
        max_rows: i32,
        scrollable: bool,
    ) -> DbResult<QueryResult> {
        self.query(prepared, max_rows, scrollable).await
    }

    async fn execute_insert(&self, prepared: &Prepared) -> DbResult<i32> {
        self.update(prepared).await
    }

    async fn execute_update(&self, prepared: &Prepared) -> DbResult<i32> {
        self.update(prepared).await
    }

    async fn execute_delete(&self, prepared: &Prepared) -> DbResult<i32> {
        self.update(prepared).await
    }

    async fn execute_merge(&self, prepared: &Prepared) -> DbResult<i32> {
        self.update(prepared).await
    }
}
