use byteorder::{BigEndian, ByteOrder};

use shared::error::{Error, Result};

use crate::chunk::Chunk;

pub const COMMON_HEADER_SIZE: usize = 12;

const CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// An SCTP packet: common header plus bundled chunks. Ports are fixed at
/// 5000 in the WebRTC encapsulation but still live on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub chunks: Vec<Chunk>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            COMMON_HEADER_SIZE + self.chunks.iter().map(Chunk::encoded_len).sum::<usize>(),
        );
        out.extend_from_slice(&self.source_port.to_be_bytes());
        out.extend_from_slice(&self.destination_port.to_be_bytes());
        out.extend_from_slice(&self.verification_tag.to_be_bytes());
        out.extend_from_slice(&[0u8; 4]); // checksum placeholder
        for chunk in &self.chunks {
            chunk.encode(&mut out);
        }
        let checksum = CRC32C.checksum(&out).to_le_bytes();
        out[8..12].copy_from_slice(&checksum);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < COMMON_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }
        let source_port = BigEndian::read_u16(&raw[0..2]);
        let destination_port = BigEndian::read_u16(&raw[2..4]);
        let verification_tag = BigEndian::read_u32(&raw[4..8]);

        let their_checksum = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let mut digest = CRC32C.digest();
        digest.update(&raw[0..8]);
        digest.update(&[0u8; 4]);
        digest.update(&raw[12..]);
        if digest.finalize() != their_checksum {
            return Err(Error::ErrChecksumMismatch);
        }

        Ok(Self {
            source_port,
            destination_port,
            verification_tag,
            chunks: Chunk::decode_all(&raw[COMMON_HEADER_SIZE..])?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::ChunkInit;

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 0,
            chunks: vec![Chunk::Init(ChunkInit {
                is_ack: false,
                initiate_tag: 77,
                a_rwnd: 1024,
                outbound_streams: 16,
                inbound_streams: 16,
                initial_tsn: 0,
                cookie: None,
            })],
        };
        let wire = packet.encode();
        let decoded = Packet::decode(&wire).unwrap();
        assert_eq!(decoded.source_port, 5000);
        assert_eq!(decoded.chunks.len(), 1);
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let packet = Packet {
            source_port: 5000,
            destination_port: 5000,
            verification_tag: 1,
            chunks: vec![Chunk::CookieAck],
        };
        let mut wire = packet.encode();
        wire[15] ^= 0x40;
        assert_eq!(Packet::decode(&wire).err(), Some(Error::ErrChecksumMismatch));
    }

    #[test]
    fn test_short_packet_rejected() {
        assert_eq!(
            Packet::decode(&[0u8; 8]).err(),
            Some(Error::ErrPacketRawTooSmall)
        );
    }
}
