use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::Header;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.header.marshal_to(buf)?;
        if buf.len() < n + self.payload.len() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[n..n + self.payload.len()].copy_from_slice(&self.payload);
        Ok(n + self.payload.len())
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(raw)?;
        let mut payload = raw.copy_to_bytes(raw.remaining());
        if header.padding {
            // last octet of the padded payload is the pad count
            let pad_len = usize::from(*payload.last().ok_or(Error::ErrTooShortRtp)?);
            if pad_len == 0 || pad_len > payload.len() {
                return Err(Error::ErrShortPacket);
            }
            payload = payload.slice(..payload.len() - pad_len);
        }
        Ok(Packet { header, payload })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet {
            header: Header {
                version: 2,
                marker: true,
                payload_type: 111,
                sequence_number: 17,
                timestamp: 960,
                ssrc: 0xDEAD_BEEF,
                ..Default::default()
            },
            payload: Bytes::from_static(b"opus frame"),
        };
        let raw = packet.marshal().unwrap();

        let mut buf = &raw[..];
        let parsed = Packet::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_padding_is_stripped() {
        let inner = Packet {
            header: Header {
                version: 2,
                padding: true,
                payload_type: 8,
                sequence_number: 5,
                timestamp: 40,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xAB, 0xCD, 0x00, 0x00, 0x00, 0x04]),
        };
        let raw = inner.marshal().unwrap();

        let mut buf = &raw[..];
        let parsed = Packet::unmarshal(&mut buf).unwrap();
        assert_eq!(&parsed.payload[..], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_invalid_padding_rejected() {
        let inner = Packet {
            header: Header {
                version: 2,
                padding: true,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xFF]),
        };
        let raw = inner.marshal().unwrap();

        let mut buf = &raw[..];
        assert!(Packet::unmarshal(&mut buf).is_err());
    }
}
