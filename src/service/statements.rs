//! Executes statements that peers route to this node.
//!
//! Each statement request is answered on the sender's endpoint with its ack
//! type, or with an [`ErrorPacket`] when it cannot be executed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::core::packet::{
    ErrorPacket, Packet, PacketType, PreparedStatementPrepareAck, QueryHeader,
    StatementQueryAck, StatementUpdateAck,
};
use crate::core::value::{PageKey, Value};
use crate::error::{DbResult, Result};
use crate::protocol::dispatcher::InboundMessage;
use crate::router::QueryResult;
use crate::service::messaging::MessagingService;

/// Error code for a statement that failed to execute.
pub const ERR_CODE_EXECUTION: i32 = 1;
/// Error code for a command id that was never prepared by the sender.
pub const ERR_CODE_UNKNOWN_COMMAND: i32 = 2;
/// Error code for a packet that is not a statement request.
pub const ERR_CODE_UNSUPPORTED: i32 = 3;

const REQUEST_TYPES: [PacketType; 5] = [
    PacketType::PreparedStatementPrepare,
    PacketType::PreparedStatementQuery,
    PacketType::PreparedStatementUpdate,
    PacketType::StatementQuery,
    PacketType::StatementUpdate,
];

/// What preparing a statement reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedInfo {
    pub is_query: bool,
    pub parameter_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub page_keys: Vec<PageKey>,
    pub replication_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub page_keys: Vec<PageKey>,
    pub max_rows: i32,
    pub fetch_size: i32,
    pub scrollable: bool,
}

/// The local storage engine as seen by remote execution.
pub trait StatementExecutor: Send + Sync + 'static {
    fn prepare(&self, sql: &str) -> DbResult<PreparedInfo>;

    fn update(&self, request: UpdateRequest) -> DbResult<i32>;

    fn query(&self, request: QueryRequest) -> DbResult<QueryResult>;
}

#[derive(Debug, Clone)]
struct CachedStatement {
    sql: String,
    info: PreparedInfo,
}

pub struct StatementService {
    executor: Arc<dyn StatementExecutor>,
    prepared: Mutex<HashMap<(SocketAddr, i32), CachedStatement>>,
}

impl StatementService {
    pub fn new(executor: Arc<dyn StatementExecutor>) -> Self {
        Self {
            executor,
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// Create a service and register its handlers on `messaging`.
    pub fn install(
        messaging: &Arc<MessagingService>,
        executor: Arc<dyn StatementExecutor>,
    ) -> Result<Arc<Self>> {
        let service = Arc::new(Self::new(executor));
        for packet_type in REQUEST_TYPES {
            let weak = Arc::downgrade(messaging);
            let service = Arc::clone(&service);
            messaging.register_handler(packet_type, move |message: InboundMessage| {
                let Some(messaging) = weak.upgrade() else {
                    return;
                };
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let reply = service.handle(message.from, &message.packet);
                    if let Err(e) = messaging.send_reply(reply, message.id, message.from).await {
                        debug!(peer = %message.from, id = message.id, error = %e, "Failed to send reply");
                    }
                });
            })?;
        }
        Ok(service)
    }

    /// Number of statements prepared by peers.
    pub fn prepared_count(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(SocketAddr, i32), CachedStatement>> {
        match self.prepared.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lookup(&self, from: SocketAddr, command_id: i32) -> Option<CachedStatement> {
        self.cache().get(&(from, command_id)).cloned()
    }

    /// Execute one request from `from` and build its reply.
    pub fn handle(&self, from: SocketAddr, packet: &Packet) -> Packet {
        trace!(peer = %from, packet_type = %packet.packet_type(), "Executing request");
        match packet {
            Packet::PreparedStatementPrepare(p) => match self.executor.prepare(&p.sql) {
                Ok(info) => {
                    self.cache().insert(
                        (from, p.command_id),
                        CachedStatement {
                            sql: p.sql.clone(),
                            info,
                        },
                    );
                    PreparedStatementPrepareAck {
                        is_query: info.is_query,
                        parameter_count: info.parameter_count,
                    }
                    .into()
                }
                Err(e) => execution_error(from, e),
            },
            Packet::PreparedStatementUpdate(p) => {
                let Some(cached) = self.lookup(from, p.command_id) else {
                    return unknown_command(from, p.command_id);
                };
                if let Some(reply) = check_arity(&cached, p.parameters.len()) {
                    return reply;
                }
                self.update(
                    from,
                    UpdateRequest {
                        sql: cached.sql,
                        parameters: p.parameters.clone(),
                        page_keys: p.page_keys.clone(),
                        replication_name: p.replication_name.clone(),
                    },
                )
            }
            Packet::StatementUpdate(p) => self.update(
                from,
                UpdateRequest {
                    sql: p.sql.clone(),
                    parameters: Vec::new(),
                    page_keys: p.page_keys.clone(),
                    replication_name: p.replication_name.clone(),
                },
            ),
            Packet::PreparedStatementQuery(p) => {
                let Some(cached) = self.lookup(from, p.command_id) else {
                    return unknown_command(from, p.command_id);
                };
                if let Some(reply) = check_arity(&cached, p.parameters.len()) {
                    return reply;
                }
                self.query(from, &p.query, cached.sql, p.parameters.clone())
            }
            Packet::StatementQuery(p) => self.query(from, &p.query, p.sql.clone(), Vec::new()),
            other => ErrorPacket {
                code: ERR_CODE_UNSUPPORTED,
                message: format!("Not a statement request: {}", other.packet_type()),
            }
            .into(),
        }
    }

    fn update(&self, from: SocketAddr, request: UpdateRequest) -> Packet {
        match self.executor.update(request) {
            Ok(update_count) => StatementUpdateAck { update_count }.into(),
            Err(e) => execution_error(from, e),
        }
    }

    fn query(
        &self,
        from: SocketAddr,
        header: &QueryHeader,
        sql: String,
        parameters: Vec<Value>,
    ) -> Packet {
        let request = QueryRequest {
            sql,
            parameters,
            page_keys: header.page_keys.clone(),
            max_rows: header.max_rows,
            fetch_size: header.fetch_size,
            scrollable: header.scrollable,
        };
        match self.executor.query(request) {
            Ok(mut result) => {
                if let Some(limit) = usize::try_from(header.max_rows).ok().filter(|&n| n > 0) {
                    result.rows.truncate(limit);
                }
                let ack = StatementQueryAck {
                    result_id: header.result_id,
                    column_count: result.column_count,
                    rows: result.rows,
                };
                // a malformed result would not decode on the caller's side
                match ack.check_shape() {
                    Ok(()) => ack.into(),
                    Err(e) => execution_error(from, e.into()),
                }
            }
            Err(e) => execution_error(from, e),
        }
    }
}

fn check_arity(cached: &CachedStatement, supplied: usize) -> Option<Packet> {
    let expected = cached.info.parameter_count;
    if usize::try_from(expected).ok() == Some(supplied) {
        return None;
    }
    Some(
        ErrorPacket {
            code: ERR_CODE_EXECUTION,
            message: format!("Expected {expected} parameters, got {supplied}"),
        }
        .into(),
    )
}

fn unknown_command(from: SocketAddr, command_id: i32) -> Packet {
    warn!(peer = %from, command_id, "Request for unprepared command");
    ErrorPacket {
        code: ERR_CODE_UNKNOWN_COMMAND,
        message: format!("Unknown command id: {command_id}"),
    }
    .into()
}

fn execution_error(from: SocketAddr, e: crate::error::DbError) -> Packet {
    debug!(peer = %from, error = %e, "Statement failed");
    ErrorPacket {
        code: ERR_CODE_EXECUTION,
        message: e.to_string(),
    }
    .into()
}
