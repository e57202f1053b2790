use byteorder::{BigEndian, ByteOrder};

use shared::error::{Error, Result};

pub const DTLS_1_2: u16 = 0xFEFD;
pub const RECORD_HEADER_SIZE: usize = 13;
const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

/// RFC 7983: DTLS packets have a first byte in 20..=63.
pub fn is_dtls(raw: &[u8]) -> bool {
    !raw.is_empty() && (20..64).contains(&raw[0])
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    pub fn value(self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }

    pub fn from_value(v: u8) -> Result<Self> {
        match v {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            _ => Err(Error::ErrInvalidContentType(v)),
        }
    }
}

/// One DTLS record. The 48-bit sequence number shares its space with the
/// 16-bit epoch on the wire.
#[derive(Debug, Clone)]
pub struct Record {
    pub content_type: ContentType,
    pub epoch: u16,
    pub sequence_number: u64,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert!(self.sequence_number <= MAX_SEQUENCE_NUMBER);
        out.push(self.content_type.value());
        out.extend_from_slice(&DTLS_1_2.to_be_bytes());
        out.extend_from_slice(&self.epoch.to_be_bytes());
        let mut seq = [0u8; 8];
        BigEndian::write_u64(&mut seq, self.sequence_number);
        out.extend_from_slice(&seq[2..8]);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Splits a datagram into the records bundled in it.
    pub fn decode_all(raw: &[u8]) -> Result<Vec<Record>> {
        let mut records = vec![];
        let mut offset = 0;
        while offset < raw.len() {
            if raw.len() - offset < RECORD_HEADER_SIZE {
                return Err(Error::ErrInvalidPacketLength);
            }
            let content_type = ContentType::from_value(raw[offset])?;
            let version = BigEndian::read_u16(&raw[offset + 1..offset + 3]);
            // 0xFEFF shows up in ClientHello records from implementations
            // that start at DTLS 1.0 compatibility
            if version != DTLS_1_2 && version != 0xFEFF {
                return Err(Error::ErrUnsupportedProtocolVersion);
            }
            let epoch = BigEndian::read_u16(&raw[offset + 3..offset + 5]);
            let mut seq_bytes = [0u8; 8];
            seq_bytes[2..8].copy_from_slice(&raw[offset + 5..offset + 11]);
            let sequence_number = BigEndian::read_u64(&seq_bytes);
            let length = BigEndian::read_u16(&raw[offset + 11..offset + 13]) as usize;
            let end = offset + RECORD_HEADER_SIZE + length;
            if end > raw.len() {
                return Err(Error::ErrInvalidPacketLength);
            }
            records.push(Record {
                content_type,
                epoch,
                sequence_number,
                payload: raw[offset + RECORD_HEADER_SIZE..end].to_vec(),
            });
            offset = end;
        }
        Ok(records)
    }
}

/// Additional data for AEAD record protection (RFC 5246 section 6.2.3.3):
/// epoch || seq48 || type || version || plaintext length.
pub(crate) fn gcm_additional_data(
    content_type: ContentType,
    epoch: u16,
    sequence_number: u64,
    plaintext_len: usize,
) -> [u8; 13] {
    let mut aad = [0u8; 13];
    BigEndian::write_u16(&mut aad[0..2], epoch);
    let mut seq = [0u8; 8];
    BigEndian::write_u64(&mut seq, sequence_number);
    aad[2..8].copy_from_slice(&seq[2..8]);
    aad[8] = content_type.value();
    BigEndian::write_u16(&mut aad[9..11], DTLS_1_2);
    BigEndian::write_u16(&mut aad[11..13], plaintext_len as u16);
    aad
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let record = Record {
            content_type: ContentType::Handshake,
            epoch: 0,
            sequence_number: 0x0000_0123_4567_89ab,
            payload: vec![1, 2, 3, 4],
        };
        let mut wire = vec![];
        record.encode(&mut wire);
        assert_eq!(wire.len(), RECORD_HEADER_SIZE + 4);
        assert!(is_dtls(&wire));

        let decoded = Record::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].content_type, ContentType::Handshake);
        assert_eq!(decoded[0].sequence_number, 0x0000_0123_4567_89ab);
        assert_eq!(decoded[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_bundled_records() {
        let mut wire = vec![];
        for seq in 0..3u64 {
            Record {
                content_type: ContentType::Handshake,
                epoch: 0,
                sequence_number: seq,
                payload: vec![seq as u8],
            }
            .encode(&mut wire);
        }
        let decoded = Record::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].payload, vec![2]);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let record = Record {
            content_type: ContentType::Alert,
            epoch: 0,
            sequence_number: 1,
            payload: vec![2, 0],
        };
        let mut wire = vec![];
        record.encode(&mut wire);
        wire.truncate(wire.len() - 1);
        assert_eq!(
            Record::decode_all(&wire).err(),
            Some(Error::ErrInvalidPacketLength)
        );
    }

    #[test]
    fn test_unknown_content_type_rejected() {
        let mut wire = vec![];
        Record {
            content_type: ContentType::Handshake,
            epoch: 0,
            sequence_number: 0,
            payload: vec![],
        }
        .encode(&mut wire);
        wire[0] = 99;
        assert_eq!(
            Record::decode_all(&wire).err(),
            Some(Error::ErrInvalidContentType(99))
        );
    }
}
