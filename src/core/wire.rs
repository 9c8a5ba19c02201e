//! Primitive field encoding shared by every packet.
//!
//! All integers are big-endian. Strings and byte arrays carry an `i32`
//! length prefix, booleans are a single byte. Reads are bounds-checked and
//! report a truncated payload instead of panicking.

use bytes::{Buf, BufMut};

use crate::core::value::{PageKey, Value};
use crate::error::{constants, ProtocolError, Result};

/// Bounds-checked reader over one packet payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fails unless the payload was consumed exactly.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Decode(format!(
                "{} ({} bytes)",
                constants::ERR_TRAILING_BYTES,
                self.buf.len()
            )))
        }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Decode(constants::ERR_TRUNCATED_PAYLOAD.into()))
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Decode(format!("Invalid boolean byte: {other}"))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    /// Reads a non-negative `i32` count and checks it against the bytes left.
    ///
    /// Every counted element takes at least `min_element_size` bytes, so a
    /// count larger than the payload can hold is rejected before allocating.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(ProtocolError::MalformedLength(count as i64));
        }
        let count = count as usize;
        if count.saturating_mul(min_element_size.max(1)) > self.remaining() {
            return Err(ProtocolError::MalformedLength(count as i64));
        }
        Ok(count)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count(1)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| ProtocolError::Decode(constants::ERR_INVALID_UTF8.into()))
    }

    pub fn read_optional_string(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        let value = match tag {
            Value::TAG_NULL => Value::Null,
            Value::TAG_BOOLEAN => Value::Boolean(self.read_bool()?),
            Value::TAG_INT => Value::Int(self.read_i32()?),
            Value::TAG_LONG => Value::Long(self.read_i64()?),
            Value::TAG_DOUBLE => Value::Double(self.read_f64()?),
            Value::TAG_STRING => Value::String(self.read_string()?),
            Value::TAG_BYTES => Value::Bytes(self.read_bytes()?),
            other => {
                return Err(ProtocolError::Decode(format!("Unknown value tag: {other}")));
            }
        };
        Ok(value)
    }

    /// Reads an `i32` count followed by that many values.
    pub fn read_values(&mut self) -> Result<Vec<Value>> {
        let count = self.read_count(1)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    pub fn read_page_keys(&mut self) -> Result<Vec<PageKey>> {
        // tag byte + first flag
        let count = self.read_count(2)?;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.read_value()?;
            let first = self.read_bool()?;
            keys.push(PageKey { key, first });
        }
        Ok(keys)
    }
}

/// Field writers mirroring [`WireReader`].
pub trait WireWrite: BufMut {
    fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    fn put_bytes_field(&mut self, v: &[u8]) {
        self.put_i32(v.len() as i32);
        self.put_slice(v);
    }

    fn put_string(&mut self, v: &str) {
        self.put_bytes_field(v.as_bytes());
    }

    fn put_optional_string(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.put_bool(true);
                self.put_string(s);
            }
            None => self.put_bool(false),
        }
    }

    fn put_value(&mut self, v: &Value) {
        self.put_u8(v.tag());
        match v {
            Value::Null => {}
            Value::Boolean(b) => self.put_bool(*b),
            Value::Int(i) => self.put_i32(*i),
            Value::Long(l) => self.put_i64(*l),
            Value::Double(d) => self.put_f64(*d),
            Value::String(s) => self.put_string(s),
            Value::Bytes(b) => self.put_bytes_field(b),
        }
    }

    fn put_values(&mut self, values: &[Value]) {
        self.put_i32(values.len() as i32);
        for v in values {
            self.put_value(v);
        }
    }

    fn put_page_keys(&mut self, keys: &[PageKey]) {
        self.put_i32(keys.len() as i32);
        for k in keys {
            self.put_value(&k.key);
            self.put_bool(k.first);
        }
    }
}

impl<B: BufMut> WireWrite for B {}
