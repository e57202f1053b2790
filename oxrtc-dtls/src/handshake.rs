use byteorder::{BigEndian, ByteOrder};

use shared::error::{Error, Result};

use crate::record::DTLS_1_2;

pub const HANDSHAKE_HEADER_SIZE: usize = 12;

/// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256, the one suite this endpoint
/// speaks.
pub const CIPHER_SUITE: u16 = 0xC02B;
/// use_srtp protection profile SRTP_AES128_CM_HMAC_SHA1_80 (RFC 5764).
pub const SRTP_PROTECTION_PROFILE: u16 = 0x0001;

const EXTENSION_SUPPORTED_GROUPS: u16 = 0x000A;
const EXTENSION_USE_SRTP: u16 = 0x000E;
const NAMED_CURVE_X25519: u16 = 0x001D;
const CURVE_TYPE_NAMED: u8 = 0x03;
const COMPRESSION_NONE: u8 = 0x00;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello,
    ServerHello,
    Certificate,
    ServerKeyExchange,
    ServerHelloDone,
    ClientKeyExchange,
    Finished,
}

impl HandshakeType {
    pub fn value(self) -> u8 {
        match self {
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::Certificate => 11,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
        }
    }

    pub fn from_value(v: u8) -> Result<Self> {
        match v {
            1 => Ok(HandshakeType::ClientHello),
            2 => Ok(HandshakeType::ServerHello),
            11 => Ok(HandshakeType::Certificate),
            12 => Ok(HandshakeType::ServerKeyExchange),
            14 => Ok(HandshakeType::ServerHelloDone),
            16 => Ok(HandshakeType::ClientKeyExchange),
            20 => Ok(HandshakeType::Finished),
            _ => Err(Error::ErrInvalidHandshakeType(v)),
        }
    }
}

/// A handshake message with its DTLS framing. Fragmentation is not
/// produced and not accepted; every message fits one record here.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub typ: HandshakeType,
    pub message_seq: u16,
    pub body: Vec<u8>,
}

impl HandshakeMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HANDSHAKE_HEADER_SIZE + self.body.len());
        out.push(self.typ.value());
        put_u24(&mut out, self.body.len() as u32);
        out.extend_from_slice(&self.message_seq.to_be_bytes());
        put_u24(&mut out, 0); // fragment offset
        put_u24(&mut out, self.body.len() as u32); // fragment length
        out.extend_from_slice(&self.body);
        out
    }

    /// Splits a Handshake record payload into the messages bundled in it.
    pub fn decode_all(raw: &[u8]) -> Result<Vec<HandshakeMessage>> {
        let mut messages = vec![];
        let mut offset = 0;
        while offset < raw.len() {
            if raw.len() - offset < HANDSHAKE_HEADER_SIZE {
                return Err(Error::ErrInvalidPacketLength);
            }
            let typ = HandshakeType::from_value(raw[offset])?;
            let length = get_u24(&raw[offset + 1..offset + 4]) as usize;
            let message_seq = BigEndian::read_u16(&raw[offset + 4..offset + 6]);
            let fragment_offset = get_u24(&raw[offset + 6..offset + 9]) as usize;
            let fragment_length = get_u24(&raw[offset + 9..offset + 12]) as usize;
            if fragment_offset != 0 || fragment_length != length {
                return Err(Error::ErrInvalidPacketLength);
            }
            let end = offset + HANDSHAKE_HEADER_SIZE + length;
            if end > raw.len() {
                return Err(Error::ErrInvalidPacketLength);
            }
            messages.push(HandshakeMessage {
                typ,
                message_seq,
                body: raw[offset + HANDSHAKE_HEADER_SIZE..end].to_vec(),
            });
            offset = end;
        }
        Ok(messages)
    }
}

fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..4]);
}

fn get_u24(raw: &[u8]) -> u32 {
    (u32::from(raw[0]) << 16) | (u32::from(raw[1]) << 8) | u32::from(raw[2])
}

fn encode_extensions(out: &mut Vec<u8>, extensions: &[(u16, Vec<u8>)]) {
    let total: usize = extensions.iter().map(|(_, v)| 4 + v.len()).sum();
    out.extend_from_slice(&(total as u16).to_be_bytes());
    for (typ, value) in extensions {
        out.extend_from_slice(&typ.to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
    }
}

fn parse_extensions(raw: &[u8], offset: &mut usize) -> Result<Vec<(u16, Vec<u8>)>> {
    // extensions block is optional
    if *offset == raw.len() {
        return Ok(vec![]);
    }
    if raw.len() - *offset < 2 {
        return Err(Error::ErrInvalidPacketLength);
    }
    let total = BigEndian::read_u16(&raw[*offset..*offset + 2]) as usize;
    *offset += 2;
    let end = *offset + total;
    if end > raw.len() {
        return Err(Error::ErrInvalidPacketLength);
    }
    let mut extensions = vec![];
    while *offset < end {
        if end - *offset < 4 {
            return Err(Error::ErrInvalidPacketLength);
        }
        let typ = BigEndian::read_u16(&raw[*offset..*offset + 2]);
        let len = BigEndian::read_u16(&raw[*offset + 2..*offset + 4]) as usize;
        *offset += 4;
        if *offset + len > end {
            return Err(Error::ErrInvalidPacketLength);
        }
        extensions.push((typ, raw[*offset..*offset + len].to_vec()));
        *offset += len;
    }
    Ok(extensions)
}

fn use_srtp_extension() -> (u16, Vec<u8>) {
    let mut value = vec![];
    value.extend_from_slice(&2u16.to_be_bytes());
    value.extend_from_slice(&SRTP_PROTECTION_PROFILE.to_be_bytes());
    value.push(0); // no MKI
    (EXTENSION_USE_SRTP, value)
}

fn supported_groups_extension() -> (u16, Vec<u8>) {
    let mut value = vec![];
    value.extend_from_slice(&2u16.to_be_bytes());
    value.extend_from_slice(&NAMED_CURVE_X25519.to_be_bytes());
    (EXTENSION_SUPPORTED_GROUPS, value)
}

fn offers_srtp_profile(extensions: &[(u16, Vec<u8>)]) -> bool {
    extensions.iter().any(|(typ, value)| {
        *typ == EXTENSION_USE_SRTP
            && value.len() >= 4
            && value[2..value.len() - 1]
                .chunks_exact(2)
                .any(|p| BigEndian::read_u16(p) == SRTP_PROTECTION_PROFILE)
    })
}

#[derive(Debug, Clone)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub cipher_suites: Vec<u16>,
    pub offers_srtp: bool,
}

impl ClientHello {
    pub fn encode(random: [u8; 32]) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&DTLS_1_2.to_be_bytes());
        out.extend_from_slice(&random);
        out.push(0); // session id
        out.push(0); // cookie
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&CIPHER_SUITE.to_be_bytes());
        out.push(1);
        out.push(COMPRESSION_NONE);
        encode_extensions(
            &mut out,
            &[supported_groups_extension(), use_srtp_extension()],
        );
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 + 32 + 1 + 1 + 2 {
            return Err(Error::ErrInvalidPacketLength);
        }
        let mut random = [0u8; 32];
        random.copy_from_slice(&raw[2..34]);
        let mut offset = 34;
        let session_id_len = raw[offset] as usize;
        offset += 1 + session_id_len;
        if offset >= raw.len() {
            return Err(Error::ErrInvalidPacketLength);
        }
        let cookie_len = raw[offset] as usize;
        offset += 1 + cookie_len;
        if offset + 2 > raw.len() {
            return Err(Error::ErrInvalidPacketLength);
        }
        let suites_len = BigEndian::read_u16(&raw[offset..offset + 2]) as usize;
        offset += 2;
        if offset + suites_len + 1 > raw.len() || suites_len % 2 != 0 {
            return Err(Error::ErrInvalidPacketLength);
        }
        let cipher_suites = raw[offset..offset + suites_len]
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect();
        offset += suites_len;
        let compression_len = raw[offset] as usize;
        offset += 1 + compression_len;
        if offset > raw.len() {
            return Err(Error::ErrInvalidPacketLength);
        }
        let extensions = parse_extensions(raw, &mut offset)?;
        Ok(Self {
            random,
            cipher_suites,
            offers_srtp: offers_srtp_profile(&extensions),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub random: [u8; 32],
    pub cipher_suite: u16,
    pub offers_srtp: bool,
}

impl ServerHello {
    pub fn encode(random: [u8; 32]) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&DTLS_1_2.to_be_bytes());
        out.extend_from_slice(&random);
        out.push(0); // session id
        out.extend_from_slice(&CIPHER_SUITE.to_be_bytes());
        out.push(COMPRESSION_NONE);
        encode_extensions(&mut out, &[use_srtp_extension()]);
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 + 32 + 1 {
            return Err(Error::ErrInvalidPacketLength);
        }
        let mut random = [0u8; 32];
        random.copy_from_slice(&raw[2..34]);
        let mut offset = 34;
        let session_id_len = raw[offset] as usize;
        offset += 1 + session_id_len;
        if offset + 3 > raw.len() {
            return Err(Error::ErrInvalidPacketLength);
        }
        let cipher_suite = BigEndian::read_u16(&raw[offset..offset + 2]);
        offset += 3; // suite + compression
        let extensions = parse_extensions(raw, &mut offset)?;
        Ok(Self {
            random,
            cipher_suite,
            offers_srtp: offers_srtp_profile(&extensions),
        })
    }
}

/// Certificate message body: a one-element chain of DER certificates.
pub fn encode_certificate(der: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    put_u24(&mut out, (der.len() + 3) as u32);
    put_u24(&mut out, der.len() as u32);
    out.extend_from_slice(der);
    out
}

pub fn parse_certificate(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < 6 {
        return Err(Error::ErrInvalidCertificate);
    }
    let chain_len = get_u24(&raw[0..3]) as usize;
    if chain_len + 3 != raw.len() {
        return Err(Error::ErrInvalidCertificate);
    }
    let cert_len = get_u24(&raw[3..6]) as usize;
    if 6 + cert_len > raw.len() || cert_len == 0 {
        return Err(Error::ErrInvalidCertificate);
    }
    // only the leaf matters, the fingerprint from signaling anchors it
    Ok(raw[6..6 + cert_len].to_vec())
}

/// ServerKeyExchange carrying the ephemeral X25519 public key. The peer is
/// authenticated by the certificate fingerprint exchanged over signaling,
/// so the exchange parameters carry no signature.
pub fn encode_server_key_exchange(public_key: &[u8]) -> Vec<u8> {
    let mut out = vec![CURVE_TYPE_NAMED];
    out.extend_from_slice(&NAMED_CURVE_X25519.to_be_bytes());
    out.push(public_key.len() as u8);
    out.extend_from_slice(public_key);
    out
}

pub fn parse_server_key_exchange(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < 4 || raw[0] != CURVE_TYPE_NAMED {
        return Err(Error::ErrInvalidPacketLength);
    }
    if BigEndian::read_u16(&raw[1..3]) != NAMED_CURVE_X25519 {
        return Err(Error::ErrUnsupportedProtocolVersion);
    }
    let key_len = raw[3] as usize;
    if 4 + key_len != raw.len() {
        return Err(Error::ErrInvalidPacketLength);
    }
    Ok(raw[4..].to_vec())
}

pub fn encode_client_key_exchange(public_key: &[u8]) -> Vec<u8> {
    let mut out = vec![public_key.len() as u8];
    out.extend_from_slice(public_key);
    out
}

pub fn parse_client_key_exchange(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.is_empty() || 1 + raw[0] as usize != raw.len() {
        return Err(Error::ErrInvalidPacketLength);
    }
    Ok(raw[1..].to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handshake_message_round_trip() {
        let msg = HandshakeMessage {
            typ: HandshakeType::ClientHello,
            message_seq: 3,
            body: ClientHello::encode([7u8; 32]),
        };
        let wire = msg.encode();
        let decoded = HandshakeMessage::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].typ, HandshakeType::ClientHello);
        assert_eq!(decoded[0].message_seq, 3);

        let hello = ClientHello::parse(&decoded[0].body).unwrap();
        assert_eq!(hello.random, [7u8; 32]);
        assert_eq!(hello.cipher_suites, vec![CIPHER_SUITE]);
        assert!(hello.offers_srtp);
    }

    #[test]
    fn test_server_hello_offers_srtp() {
        let hello = ServerHello::parse(&ServerHello::encode([1u8; 32])).unwrap();
        assert_eq!(hello.cipher_suite, CIPHER_SUITE);
        assert!(hello.offers_srtp);
    }

    #[test]
    fn test_certificate_round_trip() {
        let der = vec![0x30, 0x82, 0x01, 0x02, 0x03];
        let parsed = parse_certificate(&encode_certificate(&der)).unwrap();
        assert_eq!(parsed, der);
    }

    #[test]
    fn test_key_exchange_round_trip() {
        let key = [0xabu8; 32];
        assert_eq!(
            parse_server_key_exchange(&encode_server_key_exchange(&key)).unwrap(),
            key
        );
        assert_eq!(
            parse_client_key_exchange(&encode_client_key_exchange(&key)).unwrap(),
            key
        );
    }

    #[test]
    fn test_fragmented_message_rejected() {
        let msg = HandshakeMessage {
            typ: HandshakeType::Finished,
            message_seq: 0,
            body: vec![0u8; 12],
        };
        let mut wire = msg.encode();
        // fragment_length != length
        wire[11] = 6;
        assert!(HandshakeMessage::decode_all(&wire).is_err());
    }
}
