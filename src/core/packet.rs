//! Typed, versioned protocol packets.
//!
//! Every packet body implements [`PacketBody`]: `encode` and `decode` are
//! exact mirrors of each other, field for field, and fields introduced by a
//! later protocol version are guarded by the same version check on both
//! sides. Lists are always preceded by their count.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::VERSION_2;
use crate::core::value::{PageKey, Value};
use crate::core::wire::{WireReader, WireWrite};
use crate::error::{ProtocolError, Result};

/// Wire tag of every packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    PreparedStatementPrepare,
    PreparedStatementPrepareAck,
    PreparedStatementQuery,
    PreparedStatementUpdate,
    StatementQuery,
    StatementUpdate,
    StatementQueryAck,
    StatementUpdateAck,
    Error,
}

impl PacketType {
    /// All packet kinds, in tag order.
    pub const ALL: [PacketType; 9] = [
        PacketType::PreparedStatementPrepare,
        PacketType::PreparedStatementPrepareAck,
        PacketType::PreparedStatementQuery,
        PacketType::PreparedStatementUpdate,
        PacketType::StatementQuery,
        PacketType::StatementUpdate,
        PacketType::StatementQueryAck,
        PacketType::StatementUpdateAck,
        PacketType::Error,
    ];

    /// Get the tag byte for the wire protocol
    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::PreparedStatementPrepare => 1,
            PacketType::PreparedStatementPrepareAck => 2,
            PacketType::PreparedStatementQuery => 3,
            PacketType::PreparedStatementUpdate => 4,
            PacketType::StatementQuery => 5,
            PacketType::StatementUpdate => 6,
            PacketType::StatementQueryAck => 7,
            PacketType::StatementUpdateAck => 8,
            PacketType::Error => 9,
        }
    }

    /// Detect packet type from tag byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_byte() == byte)
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::PreparedStatementPrepare => "PREPARED_STATEMENT_PREPARE",
            PacketType::PreparedStatementPrepareAck => "PREPARED_STATEMENT_PREPARE_ACK",
            PacketType::PreparedStatementQuery => "PREPARED_STATEMENT_QUERY",
            PacketType::PreparedStatementUpdate => "PREPARED_STATEMENT_UPDATE",
            PacketType::StatementQuery => "STATEMENT_QUERY",
            PacketType::StatementUpdate => "STATEMENT_UPDATE",
            PacketType::StatementQueryAck => "STATEMENT_QUERY_ACK",
            PacketType::StatementUpdateAck => "STATEMENT_UPDATE_ACK",
            PacketType::Error => "ERROR",
        }
    }

    /// Responses are matched to a waiting caller by correlation id;
    /// everything else is an inbound request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            PacketType::PreparedStatementPrepareAck
                | PacketType::StatementQueryAck
                | PacketType::StatementUpdateAck
                | PacketType::Error
        )
    }

    /// The packet type that acknowledges a request of this type.
    pub fn ack_type(self) -> Option<PacketType> {
        match self {
            PacketType::PreparedStatementPrepare => Some(PacketType::PreparedStatementPrepareAck),
            PacketType::PreparedStatementQuery | PacketType::StatementQuery => {
                Some(PacketType::StatementQueryAck)
            }
            PacketType::PreparedStatementUpdate | PacketType::StatementUpdate => {
                Some(PacketType::StatementUpdateAck)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A packet body with a fixed type tag and a version-aware codec.
pub trait PacketBody: Sized + Into<Packet> {
    const TYPE: PacketType;

    fn encode<B: BufMut>(&self, out: &mut B, version: i32);

    fn decode(input: &mut WireReader<'_>, version: i32) -> Result<Self>;
}

/// Fields shared by every query packet.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHeader {
    pub page_keys: Vec<PageKey>,
    pub result_id: i32,
    pub max_rows: i32,
    pub fetch_size: i32,
    pub scrollable: bool,
}

impl QueryHeader {
    fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_page_keys(&self.page_keys);
        out.put_i32(self.result_id);
        out.put_i32(self.max_rows);
        out.put_i32(self.fetch_size);
        out.put_bool(self.scrollable);
    }

    fn decode(input: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            page_keys: input.read_page_keys()?,
            result_id: input.read_i32()?,
            max_rows: input.read_i32()?,
            fetch_size: input.read_i32()?,
            scrollable: input.read_bool()?,
        })
    }
}

/// Asks the remote node to prepare `sql` under `command_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatementPrepare {
    pub command_id: i32,
    pub sql: String,
}

impl PacketBody for PreparedStatementPrepare {
    const TYPE: PacketType = PacketType::PreparedStatementPrepare;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        out.put_i32(self.command_id);
        out.put_string(&self.sql);
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        Ok(Self {
            command_id: input.read_i32()?,
            sql: input.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatementPrepareAck {
    pub is_query: bool,
    pub parameter_count: i32,
}

impl PacketBody for PreparedStatementPrepareAck {
    const TYPE: PacketType = PacketType::PreparedStatementPrepareAck;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        out.put_bool(self.is_query);
        out.put_i32(self.parameter_count);
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        Ok(Self {
            is_query: input.read_bool()?,
            parameter_count: input.read_i32()?,
        })
    }
}

/// Runs a previously prepared query with bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatementQuery {
    pub query: QueryHeader,
    pub command_id: i32,
    pub parameters: Vec<Value>,
}

impl PacketBody for PreparedStatementQuery {
    const TYPE: PacketType = PacketType::PreparedStatementQuery;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        self.query.encode(out);
        out.put_i32(self.command_id);
        out.put_values(&self.parameters);
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        let query = QueryHeader::decode(input)?;
        let command_id = input.read_i32()?;
        let parameters = input.read_values()?;
        Ok(Self {
            query,
            command_id,
            parameters,
        })
    }
}

/// Runs a previously prepared update with bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatementUpdate {
    pub page_keys: Vec<PageKey>,
    pub command_id: i32,
    pub parameters: Vec<Value>,
    /// Only carried from `VERSION_2` on.
    pub replication_name: Option<String>,
}

impl PacketBody for PreparedStatementUpdate {
    const TYPE: PacketType = PacketType::PreparedStatementUpdate;

    fn encode<B: BufMut>(&self, out: &mut B, version: i32) {
        out.put_page_keys(&self.page_keys);
        out.put_i32(self.command_id);
        out.put_values(&self.parameters);
        if version >= VERSION_2 {
            out.put_optional_string(self.replication_name.as_deref());
        }
    }

    fn decode(input: &mut WireReader<'_>, version: i32) -> Result<Self> {
        let page_keys = input.read_page_keys()?;
        let command_id = input.read_i32()?;
        let parameters = input.read_values()?;
        let replication_name = if version >= VERSION_2 {
            input.read_optional_string()?
        } else {
            None
        };
        Ok(Self {
            page_keys,
            command_id,
            parameters,
            replication_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementQuery {
    pub query: QueryHeader,
    pub sql: String,
}

impl PacketBody for StatementQuery {
    const TYPE: PacketType = PacketType::StatementQuery;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        self.query.encode(out);
        out.put_string(&self.sql);
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        let query = QueryHeader::decode(input)?;
        let sql = input.read_string()?;
        Ok(Self { query, sql })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementUpdate {
    pub page_keys: Vec<PageKey>,
    pub sql: String,
    /// Only carried from `VERSION_2` on.
    pub replication_name: Option<String>,
}

impl PacketBody for StatementUpdate {
    const TYPE: PacketType = PacketType::StatementUpdate;

    fn encode<B: BufMut>(&self, out: &mut B, version: i32) {
        out.put_page_keys(&self.page_keys);
        out.put_string(&self.sql);
        if version >= VERSION_2 {
            out.put_optional_string(self.replication_name.as_deref());
        }
    }

    fn decode(input: &mut WireReader<'_>, version: i32) -> Result<Self> {
        let page_keys = input.read_page_keys()?;
        let sql = input.read_string()?;
        let replication_name = if version >= VERSION_2 {
            input.read_optional_string()?
        } else {
            None
        };
        Ok(Self {
            page_keys,
            sql,
            replication_name,
        })
    }
}

/// Rows answering a query, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementQueryAck {
    pub result_id: i32,
    pub column_count: i32,
    pub rows: Vec<Vec<Value>>,
}

impl StatementQueryAck {
    /// Every row must hold exactly `column_count` values, and a result
    /// without columns carries no rows. Acks that fail this cannot be decoded.
    pub fn check_shape(&self) -> Result<()> {
        if self.column_count < 0 {
            return Err(ProtocolError::MalformedLength(self.column_count as i64));
        }
        if self.column_count == 0 && !self.rows.is_empty() {
            return Err(ProtocolError::Custom(format!(
                "{} rows without columns",
                self.rows.len()
            )));
        }
        let width = self.column_count as usize;
        match self.rows.iter().position(|row| row.len() != width) {
            Some(i) => Err(ProtocolError::Custom(format!(
                "Row {i} has {} values, expected {width}",
                self.rows[i].len()
            ))),
            None => Ok(()),
        }
    }
}

impl PacketBody for StatementQueryAck {
    const TYPE: PacketType = PacketType::StatementQueryAck;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        out.put_i32(self.result_id);
        out.put_i32(self.rows.len() as i32);
        out.put_i32(self.column_count);
        for row in &self.rows {
            for value in row {
                out.put_value(value);
            }
        }
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        let result_id = input.read_i32()?;
        let row_count = input.read_i32()?;
        let column_count = input.read_i32()?;
        if row_count < 0 {
            return Err(ProtocolError::MalformedLength(row_count as i64));
        }
        if column_count < 0 {
            return Err(ProtocolError::MalformedLength(column_count as i64));
        }
        // every value takes at least its tag byte; rows without columns carry nothing
        let cells = (row_count as usize).saturating_mul(column_count as usize);
        if cells > input.remaining() || (column_count == 0 && row_count > 0) {
            return Err(ProtocolError::MalformedLength(row_count as i64));
        }
        let row_count = row_count as usize;
        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(column_count as usize);
            for _ in 0..column_count {
                row.push(input.read_value()?);
            }
            rows.push(row);
        }
        Ok(Self {
            result_id,
            column_count,
            rows,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementUpdateAck {
    pub update_count: i32,
}

impl PacketBody for StatementUpdateAck {
    const TYPE: PacketType = PacketType::StatementUpdateAck;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        out.put_i32(self.update_count);
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        Ok(Self {
            update_count: input.read_i32()?,
        })
    }
}

/// Failure answer to any request.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPacket {
    pub code: i32,
    pub message: String,
}

impl PacketBody for ErrorPacket {
    const TYPE: PacketType = PacketType::Error;

    fn encode<B: BufMut>(&self, out: &mut B, _version: i32) {
        out.put_i32(self.code);
        out.put_string(&self.message);
    }

    fn decode(input: &mut WireReader<'_>, _version: i32) -> Result<Self> {
        Ok(Self {
            code: input.read_i32()?,
            message: input.read_string()?,
        })
    }
}

/// Any protocol packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    PreparedStatementPrepare(PreparedStatementPrepare),
    PreparedStatementPrepareAck(PreparedStatementPrepareAck),
    PreparedStatementQuery(PreparedStatementQuery),
    PreparedStatementUpdate(PreparedStatementUpdate),
    StatementQuery(StatementQuery),
    StatementUpdate(StatementUpdate),
    StatementQueryAck(StatementQueryAck),
    StatementUpdateAck(StatementUpdateAck),
    Error(ErrorPacket),
}

macro_rules! packet_from {
    ($($variant:ident => $body:ty),* $(,)?) => {
        $(
            impl From<$body> for Packet {
                fn from(body: $body) -> Self {
                    Packet::$variant(body)
                }
            }
        )*
    };
}

packet_from! {
    PreparedStatementPrepare => PreparedStatementPrepare,
    PreparedStatementPrepareAck => PreparedStatementPrepareAck,
    PreparedStatementQuery => PreparedStatementQuery,
    PreparedStatementUpdate => PreparedStatementUpdate,
    StatementQuery => StatementQuery,
    StatementUpdate => StatementUpdate,
    StatementQueryAck => StatementQueryAck,
    StatementUpdateAck => StatementUpdateAck,
    Error => ErrorPacket,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::PreparedStatementPrepare(_) => PacketType::PreparedStatementPrepare,
            Packet::PreparedStatementPrepareAck(_) => PacketType::PreparedStatementPrepareAck,
            Packet::PreparedStatementQuery(_) => PacketType::PreparedStatementQuery,
            Packet::PreparedStatementUpdate(_) => PacketType::PreparedStatementUpdate,
            Packet::StatementQuery(_) => PacketType::StatementQuery,
            Packet::StatementUpdate(_) => PacketType::StatementUpdate,
            Packet::StatementQueryAck(_) => PacketType::StatementQueryAck,
            Packet::StatementUpdateAck(_) => PacketType::StatementUpdateAck,
            Packet::Error(_) => PacketType::Error,
        }
    }

    pub fn ack_type(&self) -> Option<PacketType> {
        self.packet_type().ack_type()
    }

    pub fn is_response(&self) -> bool {
        self.packet_type().is_response()
    }

    /// Encode the packet body (without its type tag) for `version`.
    pub fn encode<B: BufMut>(&self, out: &mut B, version: i32) {
        match self {
            Packet::PreparedStatementPrepare(p) => p.encode(out, version),
            Packet::PreparedStatementPrepareAck(p) => p.encode(out, version),
            Packet::PreparedStatementQuery(p) => p.encode(out, version),
            Packet::PreparedStatementUpdate(p) => p.encode(out, version),
            Packet::StatementQuery(p) => p.encode(out, version),
            Packet::StatementUpdate(p) => p.encode(out, version),
            Packet::StatementQueryAck(p) => p.encode(out, version),
            Packet::StatementUpdateAck(p) => p.encode(out, version),
            Packet::Error(p) => p.encode(out, version),
        }
    }

    pub fn encode_to_bytes(&self, version: i32) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, version);
        buf.freeze()
    }
}
