//! Column values and routing keys carried inside packets.

/// A single SQL value as it crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub const TAG_NULL: u8 = 0;
    pub const TAG_BOOLEAN: u8 = 1;
    pub const TAG_INT: u8 = 2;
    pub const TAG_LONG: u8 = 3;
    pub const TAG_DOUBLE: u8 = 4;
    pub const TAG_STRING: u8 = 5;
    pub const TAG_BYTES: u8 = 6;

    /// Wire tag written before the value body.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => Self::TAG_NULL,
            Value::Boolean(_) => Self::TAG_BOOLEAN,
            Value::Int(_) => Self::TAG_INT,
            Value::Long(_) => Self::TAG_LONG,
            Value::Double(_) => Self::TAG_DOUBLE,
            Value::String(_) => Self::TAG_STRING,
            Value::Bytes(_) => Self::TAG_BYTES,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Routing key identifying a target partition page.
///
/// `first` marks the key that opens a page range.
#[derive(Debug, Clone, PartialEq)]
pub struct PageKey {
    pub key: Value,
    pub first: bool,
}

impl PageKey {
    pub fn new(key: Value, first: bool) -> Self {
        Self { key, first }
    }
}
