//! Maps a packet type tag to its decoder.

use std::collections::HashMap;

use crate::config::{CURRENT_VERSION, VERSION_1};
use crate::core::packet::{
    ErrorPacket, Packet, PacketBody, PacketType, PreparedStatementPrepare,
    PreparedStatementPrepareAck, PreparedStatementQuery, PreparedStatementUpdate,
    StatementQuery, StatementQueryAck, StatementUpdate, StatementUpdateAck,
};
use crate::core::wire::WireReader;
use crate::error::{ProtocolError, Result};

/// Decodes one packet body for a given protocol version.
pub type PacketDecodeFn = fn(&mut WireReader<'_>, i32) -> Result<Packet>;

fn decode_as<T: PacketBody>(input: &mut WireReader<'_>, version: i32) -> Result<Packet> {
    T::decode(input, version).map(Into::into)
}

/// Decoder lookup table keyed by [`PacketType`].
pub struct PacketRegistry {
    decoders: HashMap<PacketType, PacketDecodeFn>,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PacketRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// A registry that knows every built-in packet.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            PacketType::PreparedStatementPrepare,
            decode_as::<PreparedStatementPrepare>,
        );
        registry.register(
            PacketType::PreparedStatementPrepareAck,
            decode_as::<PreparedStatementPrepareAck>,
        );
        registry.register(
            PacketType::PreparedStatementQuery,
            decode_as::<PreparedStatementQuery>,
        );
        registry.register(
            PacketType::PreparedStatementUpdate,
            decode_as::<PreparedStatementUpdate>,
        );
        registry.register(PacketType::StatementQuery, decode_as::<StatementQuery>);
        registry.register(PacketType::StatementUpdate, decode_as::<StatementUpdate>);
        registry.register(PacketType::StatementQueryAck, decode_as::<StatementQueryAck>);
        registry.register(PacketType::StatementUpdateAck, decode_as::<StatementUpdateAck>);
        registry.register(PacketType::Error, decode_as::<ErrorPacket>);
        registry
    }

    /// Install or replace the decoder for `packet_type`.
    pub fn register(&mut self, packet_type: PacketType, decoder: PacketDecodeFn) {
        self.decoders.insert(packet_type, decoder);
    }

    pub fn contains(&self, packet_type: PacketType) -> bool {
        self.decoders.contains_key(&packet_type)
    }

    /// Decode a complete payload. The payload must be consumed exactly.
    pub fn decode(&self, tag: u8, payload: &[u8], version: i32) -> Result<Packet> {
        if !(VERSION_1..=CURRENT_VERSION).contains(&version) {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let packet_type =
            PacketType::from_byte(tag).ok_or(ProtocolError::UnknownPacketType(tag))?;
        let decoder = self
            .decoders
            .get(&packet_type)
            .ok_or(ProtocolError::UnknownPacketType(tag))?;

        let mut input = WireReader::new(payload);
        let packet = decoder(&mut input, version)?;
        input.finish()?;
        Ok(packet)
    }
}
