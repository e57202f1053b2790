use bytes::{BufMut, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use shared::error::{Error, Result};

use crate::attributes::{ATTR_FINGERPRINT, ATTR_MESSAGE_INTEGRITY};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_SIZE: usize = 20;
pub const METHOD_BINDING: u16 = 0x0001;

const INTEGRITY_SIZE: usize = 20;
const FINGERPRINT_SIZE: usize = 4;
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// 96-bit STUN transaction id.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        rand::rng().fill_bytes(&mut id);
        Self(id)
    }
}

/// STUN message class, the two C bits of the message type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// Method plus class, packed into the 14-bit message type field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageType {
    pub method: u16,
    pub class: MessageClass,
}

impl MessageType {
    pub fn new(method: u16, class: MessageClass) -> Self {
        Self { method, class }
    }

    pub fn value(&self) -> u16 {
        let m = self.method;
        let c = self.class.bits();
        (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7)
    }

    pub fn from_value(v: u16) -> Self {
        let method = (v & 0x000F) | ((v >> 1) & 0x0070) | ((v >> 2) & 0x0F80);
        let class = MessageClass::from_bits(((v >> 4) & 0b01) | ((v >> 7) & 0b10));
        Self { method, class }
    }
}

/// A STUN message: 20-byte header plus attributes in wire order.
///
/// `raw` holds the encoded bytes after [Message::encode] or the bytes a
/// decoded message was built from; integrity and fingerprint verification
/// operate on it so the checked bytes are exactly the received ones.
#[derive(Debug, Clone)]
pub struct Message {
    pub typ: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<(u16, Vec<u8>)>,
    pub raw: Vec<u8>,
}

impl Message {
    pub fn new(typ: MessageType) -> Self {
        Self {
            typ,
            transaction_id: TransactionId::new(),
            attributes: vec![],
            raw: vec![],
        }
    }

    pub fn binding_request() -> Self {
        Self::new(MessageType::new(METHOD_BINDING, MessageClass::Request))
    }

    pub fn binding_success(transaction_id: TransactionId) -> Self {
        let mut m = Self::new(MessageType::new(METHOD_BINDING, MessageClass::SuccessResponse));
        m.transaction_id = transaction_id;
        m
    }

    pub fn binding_error(transaction_id: TransactionId) -> Self {
        let mut m = Self::new(MessageType::new(METHOD_BINDING, MessageClass::ErrorResponse));
        m.transaction_id = transaction_id;
        m
    }

    /// Quick check whether a datagram can be a STUN message: first two bits
    /// zero and the magic cookie in place, RFC 7983 demux companion.
    pub fn is_stun(raw: &[u8]) -> bool {
        raw.len() >= HEADER_SIZE
            && raw[0] < 4
            && BigEndian::read_u32(&raw[4..8]) == MAGIC_COOKIE
    }

    pub fn add_attribute(&mut self, typ: u16, value: Vec<u8>) {
        self.attributes.push((typ, value));
    }

    pub fn get_attribute(&self, typ: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == typ)
            .map(|(_, v)| v.as_slice())
    }

    fn attributes_size(&self) -> usize {
        self.attributes
            .iter()
            .map(|(_, v)| 4 + (v.len() + 3) / 4 * 4)
            .sum()
    }

    /// Appends MESSAGE-INTEGRITY computed with `key` (the ICE password).
    /// Must be called after all other attributes except FINGERPRINT.
    pub fn add_message_integrity(&mut self, key: &[u8]) {
        let prefix = self.encode_with_extra_length(INTEGRITY_SIZE + 4);
        let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&prefix);
        let tag = mac.finalize().into_bytes();
        self.add_attribute(ATTR_MESSAGE_INTEGRITY, tag.to_vec());
    }

    /// Appends FINGERPRINT. Must be the last attribute.
    pub fn add_fingerprint(&mut self) {
        let prefix = self.encode_with_extra_length(FINGERPRINT_SIZE + 4);
        let crc = CRC32.checksum(&prefix) ^ FINGERPRINT_XOR;
        self.add_attribute(ATTR_FINGERPRINT, crc.to_be_bytes().to_vec());
    }

    fn encode_with_extra_length(&self, extra: usize) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.attributes_size() + extra);
        buf.put_u16(self.typ.value());
        buf.put_u16((self.attributes_size() + extra) as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id.0);
        for (typ, value) in &self.attributes {
            buf.put_u16(*typ);
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
            let padding = (4 - value.len() % 4) % 4;
            buf.put_bytes(0, padding);
        }
        buf.to_vec()
    }

    /// Encodes the message and records the bytes in `raw`.
    pub fn encode(&mut self) -> BytesMut {
        let raw = self.encode_with_extra_length(0);
        self.raw = raw.clone();
        BytesMut::from(&raw[..])
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::ErrUnexpectedHeaderEof);
        }
        let typ = MessageType::from_value(BigEndian::read_u16(&raw[0..2]));
        let length = BigEndian::read_u16(&raw[2..4]) as usize;
        let cookie = BigEndian::read_u32(&raw[4..8]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::ErrInvalidMagicCookie(cookie));
        }
        if raw.len() != HEADER_SIZE + length {
            return Err(Error::ErrAttributeSizeInvalid);
        }
        let mut transaction_id = TransactionId::default();
        transaction_id.0.copy_from_slice(&raw[8..20]);

        let mut attributes = vec![];
        let mut offset = HEADER_SIZE;
        while offset < raw.len() {
            if offset + 4 > raw.len() {
                return Err(Error::ErrAttributeSizeInvalid);
            }
            let attr_type = BigEndian::read_u16(&raw[offset..offset + 2]);
            let attr_len = BigEndian::read_u16(&raw[offset + 2..offset + 4]) as usize;
            let value_end = offset + 4 + attr_len;
            if value_end > raw.len() {
                return Err(Error::ErrAttributeSizeInvalid);
            }
            attributes.push((attr_type, raw[offset + 4..value_end].to_vec()));
            offset = value_end + (4 - attr_len % 4) % 4;
        }

        Ok(Self {
            typ,
            transaction_id,
            attributes,
            raw: raw.to_vec(),
        })
    }

    /// Verifies MESSAGE-INTEGRITY against `key` over the received bytes.
    pub fn verify_integrity(&self, key: &[u8]) -> Result<()> {
        let (offset, tag) = self
            .attribute_offset(ATTR_MESSAGE_INTEGRITY)
            .ok_or(Error::ErrAttributeNotFound)?;

        let mut prefix = self.raw[..offset].to_vec();
        // length as if MESSAGE-INTEGRITY were the last attribute
        BigEndian::write_u16(
            &mut prefix[2..4],
            (offset - HEADER_SIZE + INTEGRITY_SIZE + 4) as u16,
        );
        let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&prefix);
        if mac.verify_slice(tag).is_err() {
            return Err(Error::ErrIntegrityMismatch);
        }
        Ok(())
    }

    /// Verifies the FINGERPRINT attribute over the received bytes.
    pub fn verify_fingerprint(&self) -> Result<()> {
        let (offset, value) = self
            .attribute_offset(ATTR_FINGERPRINT)
            .ok_or(Error::ErrAttributeNotFound)?;
        if value.len() != 4 {
            return Err(Error::ErrAttributeSizeInvalid);
        }

        let mut prefix = self.raw[..offset].to_vec();
        BigEndian::write_u16(
            &mut prefix[2..4],
            (offset - HEADER_SIZE + FINGERPRINT_SIZE + 4) as u16,
        );
        let expected = CRC32.checksum(&prefix) ^ FINGERPRINT_XOR;
        if BigEndian::read_u32(value) != expected {
            return Err(Error::ErrFingerprintMismatch);
        }
        Ok(())
    }

    /// Byte offset of an attribute header within `raw`, with its value.
    fn attribute_offset(&self, typ: u16) -> Option<(usize, &[u8])> {
        let mut offset = HEADER_SIZE;
        for (attr_type, value) in &self.attributes {
            if *attr_type == typ {
                return Some((offset, value.as_slice()));
            }
            offset += 4 + (value.len() + 3) / 4 * 4;
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attributes::*;
    use std::net::SocketAddr;
    use std::str::FromStr;

    #[test]
    fn test_message_type_round_trip() {
        for class in [
            MessageClass::Request,
            MessageClass::Indication,
            MessageClass::SuccessResponse,
            MessageClass::ErrorResponse,
        ] {
            let typ = MessageType::new(METHOD_BINDING, class);
            assert_eq!(MessageType::from_value(typ.value()), typ);
        }
        assert_eq!(
            MessageType::new(METHOD_BINDING, MessageClass::Request).value(),
            0x0001
        );
        assert_eq!(
            MessageType::new(METHOD_BINDING, MessageClass::SuccessResponse).value(),
            0x0101
        );
    }

    #[test]
    fn test_encode_decode_binding_request() {
        let mut m = Message::binding_request();
        m.add_username("remote:local");
        m.add_priority(0x6e_7f_1e_ff);
        m.add_ice_controlling(0x1234_5678_9abc_def0);
        m.add_use_candidate();
        m.add_message_integrity(b"swordfish");
        m.add_fingerprint();
        let raw = m.encode();

        assert!(Message::is_stun(&raw));
        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.typ, m.typ);
        assert_eq!(decoded.transaction_id, m.transaction_id);
        assert_eq!(decoded.username(), Some("remote:local".to_string()));
        assert_eq!(decoded.priority(), Some(0x6e_7f_1e_ff));
        assert_eq!(decoded.ice_controlling(), Some(0x1234_5678_9abc_def0));
        assert!(decoded.has_use_candidate());
        decoded.verify_fingerprint().unwrap();
        decoded.verify_integrity(b"swordfish").unwrap();
    }

    #[test]
    fn test_integrity_rejects_wrong_key_and_tamper() {
        let mut m = Message::binding_request();
        m.add_username("a:b");
        m.add_message_integrity(b"right");
        let mut raw = m.encode().to_vec();

        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(
            decoded.verify_integrity(b"wrong"),
            Err(Error::ErrIntegrityMismatch)
        );

        // flip one bit in the USERNAME value
        raw[HEADER_SIZE + 4] ^= 0x01;
        let tampered = Message::decode(&raw).unwrap();
        assert_eq!(
            tampered.verify_integrity(b"right"),
            Err(Error::ErrIntegrityMismatch)
        );
    }

    #[test]
    fn test_xor_mapped_address_round_trip() {
        for addr in ["192.0.2.1:32853", "[2001:db8::1]:5000"] {
            let addr = SocketAddr::from_str(addr).unwrap();
            let mut m = Message::binding_success(TransactionId::new());
            m.add_xor_mapped_address(addr);
            let raw = m.encode();
            let decoded = Message::decode(&raw).unwrap();
            assert_eq!(decoded.xor_mapped_address().unwrap(), addr);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(&[0u8; 8]).is_err());
        let mut m = Message::binding_request();
        let mut raw = m.encode().to_vec();
        raw[4] = 0; // break the cookie
        assert!(Message::decode(&raw).is_err());
    }
}
