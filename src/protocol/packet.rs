//! Framed binary packet codec.
//!
//! Wire layout (all fields big-endian):
//!
//! ```text
//! off  size  field
//! 0    2     magic (0xAF01)
//! 2    1     version
//! 3    1     type
//! 4    1     flags
//! 5    4     sequence
//! 9    8     timestamp (nanoseconds, sender-local monotonic)
//! 17   2     payload length
//! 19   N     payload
//! 19+N 4     CRC32 over bytes [0, 19+N)
//! ```

use crate::protocol::monotonic_ns;

/// Magic bytes identifying audio packets.
pub const MAGIC: u16 = 0xAF01;

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Header size in bytes (without payload and CRC).
pub const HEADER_SIZE: usize = 19;

/// CRC trailer size in bytes.
pub const CRC_SIZE: usize = 4;

/// Maximum payload size.
pub const MAX_PAYLOAD: usize = 8192;

/// Packet flag bits.
pub mod flags {
    /// Payload is compressed.
    pub const COMPRESSED: u8 = 0x01;
    /// Low bandwidth mode (12 kHz sample rate).
    pub const LOW_BANDWIDTH: u8 = 0x02;
}

/// Packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Audio from the radio toward clients.
    AudioRx,
    /// Audio from a client toward the radio.
    AudioTx,
    /// Control message payload.
    Control,
    /// Keepalive.
    Heartbeat,
}

impl PacketType {
    pub fn value(self) -> u8 {
        match self {
            PacketType::AudioRx => 0x00,
            PacketType::AudioTx => 0x01,
            PacketType::Control => 0x02,
            PacketType::Heartbeat => 0x03,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PacketType::AudioRx),
            0x01 => Some(PacketType::AudioTx),
            0x02 => Some(PacketType::Control),
            0x03 => Some(PacketType::Heartbeat),
            _ => None,
        }
    }
}

/// One framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: u8,
    pub sequence: u32,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            packet_type,
            flags: 0,
            sequence,
            timestamp: monotonic_ns(),
            payload,
        }
    }

    pub fn rx_audio(sequence: u32, audio: Vec<u8>) -> Self {
        Self::new(PacketType::AudioRx, sequence, audio)
    }

    pub fn tx_audio(sequence: u32, audio: Vec<u8>) -> Self {
        Self::new(PacketType::AudioTx, sequence, audio)
    }

    pub fn control(sequence: u32, control: Vec<u8>) -> Self {
        Self::new(PacketType::Control, sequence, control)
    }

    pub fn heartbeat(sequence: u32) -> Self {
        Self::new(PacketType::Heartbeat, sequence, Vec::new())
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Total on-wire size for a given payload length.
    pub fn wire_size(payload_len: usize) -> usize {
        HEADER_SIZE + payload_len + CRC_SIZE
    }

    /// Serializes the packet including the CRC trailer.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len();
        let mut out = Vec::with_capacity(Self::wire_size(payload_len));

        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(self.version);
        out.push(self.packet_type.value());
        out.push(self.flags);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_be_bytes());

        out
    }

    /// Decodes a packet from a complete frame.
    ///
    /// Returns `None` on short input, wrong magic, unknown type, oversized
    /// payload length or CRC mismatch. The input is never mutated.
    pub fn decode(data: &[u8]) -> Option<Packet> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return None;
        }

        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != MAGIC {
            return None;
        }

        let version = data[2];
        let packet_type = PacketType::from_value(data[3])?;
        let flags = data[4];
        let sequence = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let timestamp = u64::from_be_bytes([
            data[9], data[10], data[11], data[12], data[13], data[14], data[15], data[16],
        ]);
        let payload_len = u16::from_be_bytes([data[17], data[18]]) as usize;

        if payload_len > MAX_PAYLOAD || data.len() < Self::wire_size(payload_len) {
            return None;
        }

        let crc_offset = HEADER_SIZE + payload_len;
        let received_crc = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..crc_offset]);
        if hasher.finalize() != received_crc {
            return None;
        }

        Some(Packet {
            version,
            packet_type,
            flags,
            sequence,
            timestamp,
            payload: data[HEADER_SIZE..crc_offset].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_types() {
        for packet_type in [
            PacketType::AudioRx,
            PacketType::AudioTx,
            PacketType::Control,
            PacketType::Heartbeat,
        ] {
            let packet = Packet::new(packet_type, 42, vec![1, 2, 3, 4]);
            let decoded = Packet::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let packet = Packet::heartbeat(7);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + CRC_SIZE);
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Heartbeat);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_flags_preserved_verbatim() {
        let mut packet = Packet::rx_audio(1, vec![0u8; 16]);
        packet.set_flag(flags::COMPRESSED, true);
        packet.set_flag(flags::LOW_BANDWIDTH, true);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert!(decoded.has_flag(flags::COMPRESSED));
        assert!(decoded.has_flag(flags::LOW_BANDWIDTH));
        assert_eq!(decoded.flags, 0x03);
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let mut packet = Packet::rx_audio(0x01020304, vec![0xAA, 0xBB]);
        packet.timestamp = 0x1112131415161718;
        packet.flags = 0x02;
        let bytes = packet.encode();

        assert_eq!(&bytes[0..2], &[0xAF, 0x01]);
        assert_eq!(bytes[2], VERSION);
        assert_eq!(bytes[3], 0x00);
        assert_eq!(bytes[4], 0x02);
        assert_eq!(&bytes[5..9], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[9..17], &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
        assert_eq!(&bytes[17..19], &[0x00, 0x02]);
        assert_eq!(&bytes[19..21], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let packet = Packet::rx_audio(1, vec![0x00, 0xFF]);
        let mut bytes = packet.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(Packet::decode(&bytes).is_none());
    }

    #[test]
    fn test_single_bit_flips_rejected() {
        let packet = Packet::control(9, vec![0x10, 0x20, 0x30]);
        let clean = packet.encode();
        for byte_index in 0..clean.len() {
            for bit in 0..8 {
                let mut corrupted = clean.clone();
                corrupted[byte_index] ^= 1 << bit;
                assert!(
                    Packet::decode(&corrupted).is_none(),
                    "bit {} of byte {} survived",
                    bit,
                    byte_index
                );
            }
        }
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let packet = Packet::heartbeat(1);
        let mut bytes = packet.encode();
        bytes[0] = 0xDE;
        bytes[1] = 0xAD;
        assert!(Packet::decode(&bytes).is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let packet = Packet::heartbeat(1);
        let mut bytes = packet.encode();
        bytes[3] = 0x7F;
        assert!(Packet::decode(&bytes).is_none());
    }

    #[test]
    fn test_short_input_rejected() {
        let packet = Packet::heartbeat(1);
        let bytes = packet.encode();
        assert!(Packet::decode(&bytes[..bytes.len() - 1]).is_none());
        assert!(Packet::decode(&[]).is_none());
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let packet = Packet::rx_audio(3, vec![0x5A; MAX_PAYLOAD]);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_oversized_payload_length_rejected() {
        let packet = Packet::rx_audio(3, vec![0u8; 8]);
        let mut bytes = packet.encode();
        // Claim a payload larger than MAX_PAYLOAD
        bytes[17] = 0xFF;
        bytes[18] = 0xFF;
        assert!(Packet::decode(&bytes).is_none());
    }
}
