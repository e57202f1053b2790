use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 12;
pub const VERSION_SHIFT: u8 = 6;
pub const PADDING_SHIFT: u8 = 5;
pub const EXTENSION_SHIFT: u8 = 4;
pub const CC_MASK: u8 = 0x0F;
pub const MARKER_SHIFT: u8 = 7;
pub const PT_MASK: u8 = 0x7F;

/// RTP fixed header plus CSRC list and one raw header extension block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    pub extension_payload: Bytes,
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut size = HEADER_LENGTH + self.csrc.len() * 4;
        if self.extension {
            // extension payload is carried in 32-bit words
            size += 4 + (self.extension_payload.len() + 3) / 4 * 4;
        }
        size
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrBufferTooSmall);
        }

        buf[0] = (self.version << VERSION_SHIFT)
            | (u8::from(self.padding) << PADDING_SHIFT)
            | (u8::from(self.extension) << EXTENSION_SHIFT)
            | (self.csrc.len() as u8 & CC_MASK);
        buf[1] = (u8::from(self.marker) << MARKER_SHIFT) | (self.payload_type & PT_MASK);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut n = HEADER_LENGTH;
        for csrc in &self.csrc {
            buf[n..n + 4].copy_from_slice(&csrc.to_be_bytes());
            n += 4;
        }

        if self.extension {
            let words = (self.extension_payload.len() + 3) / 4;
            buf[n..n + 2].copy_from_slice(&self.extension_profile.to_be_bytes());
            buf[n + 2..n + 4].copy_from_slice(&(words as u16).to_be_bytes());
            n += 4;
            buf[n..n + self.extension_payload.len()].copy_from_slice(&self.extension_payload);
            let padded = words * 4;
            for b in &mut buf[n + self.extension_payload.len()..n + padded] {
                *b = 0;
            }
            n += padded;
        }

        Ok(n)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(raw: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if raw.remaining() < HEADER_LENGTH {
            return Err(Error::ErrHeaderSizeInsufficient);
        }

        let b0 = raw.get_u8();
        let version = b0 >> VERSION_SHIFT;
        if version != 2 {
            return Err(Error::ErrBadVersion);
        }
        let padding = (b0 >> PADDING_SHIFT) & 1 == 1;
        let extension = (b0 >> EXTENSION_SHIFT) & 1 == 1;
        let csrc_count = usize::from(b0 & CC_MASK);

        let b1 = raw.get_u8();
        let marker = b1 >> MARKER_SHIFT == 1;
        let payload_type = b1 & PT_MASK;

        let sequence_number = raw.get_u16();
        let timestamp = raw.get_u32();
        let ssrc = raw.get_u32();

        if raw.remaining() < csrc_count * 4 {
            return Err(Error::ErrHeaderSizeInsufficient);
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(raw.get_u32());
        }

        let (extension_profile, extension_payload) = if extension {
            if raw.remaining() < 4 {
                return Err(Error::ErrHeaderSizeInsufficient);
            }
            let profile = raw.get_u16();
            let length = usize::from(raw.get_u16()) * 4;
            if raw.remaining() < length {
                return Err(Error::ErrHeaderSizeInsufficient);
            }
            (profile, raw.copy_to_bytes(length))
        } else {
            (0, Bytes::new())
        };

        Ok(Header {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extension_payload,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic_header_round_trip() {
        let header = Header {
            version: 2,
            marker: true,
            payload_type: 96,
            sequence_number: 27023,
            timestamp: 3_653_407_706,
            ssrc: 476_325_762,
            ..Default::default()
        };
        let raw = header.marshal().unwrap();
        assert_eq!(raw.len(), HEADER_LENGTH);
        assert_eq!(raw[0], 0x80);
        assert_eq!(raw[1], 0x80 | 96);

        let mut buf = &raw[..];
        let parsed = Header::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_with_csrc_and_extension() {
        let header = Header {
            version: 2,
            extension: true,
            payload_type: 111,
            sequence_number: 1,
            timestamp: 160,
            ssrc: 0x1234_5678,
            csrc: vec![0x11, 0x22],
            extension_profile: 0xBEDE,
            extension_payload: Bytes::from_static(&[0x10, 0xAA, 0x00, 0x00]),
            ..Default::default()
        };
        let raw = header.marshal().unwrap();
        assert_eq!(raw.len(), 12 + 8 + 8);

        let mut buf = &raw[..];
        let parsed = Header::unmarshal(&mut buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let raw = [0u8; 12];
        let mut buf = &raw[..];
        assert_eq!(Header::unmarshal(&mut buf), Err(Error::ErrBadVersion));
    }

    #[test]
    fn test_rejects_short_header() {
        let raw = [0x80u8; 6];
        let mut buf = &raw[..];
        assert_eq!(
            Header::unmarshal(&mut buf),
            Err(Error::ErrHeaderSizeInsufficient)
        );
    }
}
