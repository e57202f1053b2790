use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use shared::error::{Error, Result};

pub const CHUNK_HEADER_SIZE: usize = 4;

pub const CT_DATA: u8 = 0;
pub const CT_INIT: u8 = 1;
pub const CT_INIT_ACK: u8 = 2;
pub const CT_SACK: u8 = 3;
pub const CT_HEARTBEAT: u8 = 4;
pub const CT_HEARTBEAT_ACK: u8 = 5;
pub const CT_ABORT: u8 = 6;
pub const CT_SHUTDOWN: u8 = 7;
pub const CT_SHUTDOWN_ACK: u8 = 8;
pub const CT_COOKIE_ECHO: u8 = 10;
pub const CT_COOKIE_ACK: u8 = 11;
pub const CT_SHUTDOWN_COMPLETE: u8 = 14;
pub const CT_FORWARD_TSN: u8 = 192;

const PARAM_STATE_COOKIE: u16 = 7;
const PARAM_FORWARD_TSN_SUPPORTED: u16 = 0xC000;

pub const DATA_FLAG_ENDING: u8 = 0x01;
pub const DATA_FLAG_BEGINNING: u8 = 0x02;
pub const DATA_FLAG_UNORDERED: u8 = 0x04;

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// One DATA chunk, a fragment of a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub user_data: Bytes,
}

/// INIT and INIT-ACK share a body; INIT-ACK additionally carries the
/// state cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInit {
    pub is_ack: bool,
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub cookie: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapAckBlock {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSack {
    pub cumulative_tsn_ack: u32,
    pub a_rwnd: u32,
    pub gap_ack_blocks: Vec<GapAckBlock>,
    pub duplicate_tsns: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkForwardTsn {
    pub new_cumulative_tsn: u32,
    /// (stream id, highest skipped stream sequence) pairs.
    pub streams: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(ChunkData),
    Init(ChunkInit),
    Sack(ChunkSack),
    Heartbeat(Vec<u8>),
    HeartbeatAck(Vec<u8>),
    Abort(String),
    Shutdown { cumulative_tsn_ack: u32 },
    ShutdownAck,
    CookieEcho(Vec<u8>),
    CookieAck,
    ShutdownComplete,
    ForwardTsn(ChunkForwardTsn),
}

impl Chunk {
    pub fn chunk_type(&self) -> u8 {
        match self {
            Chunk::Data(_) => CT_DATA,
            Chunk::Init(init) if init.is_ack => CT_INIT_ACK,
            Chunk::Init(_) => CT_INIT,
            Chunk::Sack(_) => CT_SACK,
            Chunk::Heartbeat(_) => CT_HEARTBEAT,
            Chunk::HeartbeatAck(_) => CT_HEARTBEAT_ACK,
            Chunk::Abort(_) => CT_ABORT,
            Chunk::Shutdown { .. } => CT_SHUTDOWN,
            Chunk::ShutdownAck => CT_SHUTDOWN_ACK,
            Chunk::CookieEcho(_) => CT_COOKIE_ECHO,
            Chunk::CookieAck => CT_COOKIE_ACK,
            Chunk::ShutdownComplete => CT_SHUTDOWN_COMPLETE,
            Chunk::ForwardTsn(_) => CT_FORWARD_TSN,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Chunk::Data(data) => {
                let mut flags = 0;
                if data.ending {
                    flags |= DATA_FLAG_ENDING;
                }
                if data.beginning {
                    flags |= DATA_FLAG_BEGINNING;
                }
                if data.unordered {
                    flags |= DATA_FLAG_UNORDERED;
                }
                flags
            }
            _ => 0,
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            Chunk::Data(data) => {
                let mut out = Vec::with_capacity(12 + data.user_data.len());
                out.extend_from_slice(&data.tsn.to_be_bytes());
                out.extend_from_slice(&data.stream_id.to_be_bytes());
                out.extend_from_slice(&data.stream_seq.to_be_bytes());
                out.extend_from_slice(&data.ppid.to_be_bytes());
                out.extend_from_slice(&data.user_data);
                out
            }
            Chunk::Init(init) => {
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&init.initiate_tag.to_be_bytes());
                out.extend_from_slice(&init.a_rwnd.to_be_bytes());
                out.extend_from_slice(&init.outbound_streams.to_be_bytes());
                out.extend_from_slice(&init.inbound_streams.to_be_bytes());
                out.extend_from_slice(&init.initial_tsn.to_be_bytes());
                encode_param(&mut out, PARAM_FORWARD_TSN_SUPPORTED, &[]);
                if let Some(cookie) = &init.cookie {
                    encode_param(&mut out, PARAM_STATE_COOKIE, cookie);
                }
                out
            }
            Chunk::Sack(sack) => {
                let mut out = Vec::with_capacity(12);
                out.extend_from_slice(&sack.cumulative_tsn_ack.to_be_bytes());
                out.extend_from_slice(&sack.a_rwnd.to_be_bytes());
                out.extend_from_slice(&(sack.gap_ack_blocks.len() as u16).to_be_bytes());
                out.extend_from_slice(&(sack.duplicate_tsns.len() as u16).to_be_bytes());
                for gap in &sack.gap_ack_blocks {
                    out.extend_from_slice(&gap.start.to_be_bytes());
                    out.extend_from_slice(&gap.end.to_be_bytes());
                }
                for dup in &sack.duplicate_tsns {
                    out.extend_from_slice(&dup.to_be_bytes());
                }
                out
            }
            Chunk::Heartbeat(info) | Chunk::HeartbeatAck(info) => {
                let mut out = vec![];
                encode_param(&mut out, 1, info);
                out
            }
            Chunk::Abort(reason) => {
                // user-initiated abort cause (12) with the reason as text
                let mut out = vec![];
                encode_param(&mut out, 12, reason.as_bytes());
                out
            }
            Chunk::Shutdown { cumulative_tsn_ack } => cumulative_tsn_ack.to_be_bytes().to_vec(),
            Chunk::CookieEcho(cookie) => cookie.clone(),
            Chunk::ShutdownAck | Chunk::CookieAck | Chunk::ShutdownComplete => vec![],
            Chunk::ForwardTsn(forward) => {
                let mut out = Vec::with_capacity(4 + 4 * forward.streams.len());
                out.extend_from_slice(&forward.new_cumulative_tsn.to_be_bytes());
                for (stream_id, stream_seq) in &forward.streams {
                    out.extend_from_slice(&stream_id.to_be_bytes());
                    out.extend_from_slice(&stream_seq.to_be_bytes());
                }
                out
            }
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let value = self.value();
        let length = CHUNK_HEADER_SIZE + value.len();
        out.push(self.chunk_type());
        out.push(self.flags());
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&value);
        out.resize(out.len() + padded(value.len()) - value.len(), 0);
    }

    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_SIZE + padded(self.value().len())
    }

    /// Decodes every chunk after the common header. Unknown chunk types
    /// with the high bits 01/11 would be skippable per RFC 4960; this
    /// association only meets its own chunks, so unknown is an error.
    pub fn decode_all(raw: &[u8]) -> Result<Vec<Chunk>> {
        let mut chunks = vec![];
        let mut offset = 0;
        while offset < raw.len() {
            if raw.len() - offset < CHUNK_HEADER_SIZE {
                return Err(Error::ErrChunkHeaderTooSmall);
            }
            let typ = raw[offset];
            let flags = raw[offset + 1];
            let length = BigEndian::read_u16(&raw[offset + 2..offset + 4]) as usize;
            if length < CHUNK_HEADER_SIZE || offset + length > raw.len() {
                return Err(Error::ErrChunkHeaderInvalidLength);
            }
            let value = &raw[offset + CHUNK_HEADER_SIZE..offset + length];
            chunks.push(Self::decode_one(typ, flags, value)?);
            offset += padded(length);
        }
        Ok(chunks)
    }

    fn decode_one(typ: u8, flags: u8, value: &[u8]) -> Result<Chunk> {
        match typ {
            CT_DATA => {
                if value.len() < 12 {
                    return Err(Error::ErrChunkHeaderInvalidLength);
                }
                Ok(Chunk::Data(ChunkData {
                    unordered: flags & DATA_FLAG_UNORDERED != 0,
                    beginning: flags & DATA_FLAG_BEGINNING != 0,
                    ending: flags & DATA_FLAG_ENDING != 0,
                    tsn: BigEndian::read_u32(&value[0..4]),
                    stream_id: BigEndian::read_u16(&value[4..6]),
                    stream_seq: BigEndian::read_u16(&value[6..8]),
                    ppid: BigEndian::read_u32(&value[8..12]),
                    user_data: Bytes::copy_from_slice(&value[12..]),
                }))
            }
            CT_INIT | CT_INIT_ACK => {
                if value.len() < 16 {
                    return Err(Error::ErrChunkHeaderInvalidLength);
                }
                let mut cookie = None;
                for (param_type, param_value) in decode_params(&value[16..])? {
                    if param_type == PARAM_STATE_COOKIE {
                        cookie = Some(param_value);
                    }
                }
                Ok(Chunk::Init(ChunkInit {
                    is_ack: typ == CT_INIT_ACK,
                    initiate_tag: BigEndian::read_u32(&value[0..4]),
                    a_rwnd: BigEndian::read_u32(&value[4..8]),
                    outbound_streams: BigEndian::read_u16(&value[8..10]),
                    inbound_streams: BigEndian::read_u16(&value[10..12]),
                    initial_tsn: BigEndian::read_u32(&value[12..16]),
                    cookie,
                }))
            }
            CT_SACK => {
                if value.len() < 12 {
                    return Err(Error::ErrChunkHeaderInvalidLength);
                }
                let num_gaps = BigEndian::read_u16(&value[8..10]) as usize;
                let num_dups = BigEndian::read_u16(&value[10..12]) as usize;
                if value.len() < 12 + 4 * num_gaps + 4 * num_dups {
                    return Err(Error::ErrChunkHeaderInvalidLength);
                }
                let mut gap_ack_blocks = Vec::with_capacity(num_gaps);
                let mut offset = 12;
                for _ in 0..num_gaps {
                    gap_ack_blocks.push(GapAckBlock {
                        start: BigEndian::read_u16(&value[offset..offset + 2]),
                        end: BigEndian::read_u16(&value[offset + 2..offset + 4]),
                    });
                    offset += 4;
                }
                let mut duplicate_tsns = Vec::with_capacity(num_dups);
                for _ in 0..num_dups {
                    duplicate_tsns.push(BigEndian::read_u32(&value[offset..offset + 4]));
                    offset += 4;
                }
                Ok(Chunk::Sack(ChunkSack {
                    cumulative_tsn_ack: BigEndian::read_u32(&value[0..4]),
                    a_rwnd: BigEndian::read_u32(&value[4..8]),
                    gap_ack_blocks,
                    duplicate_tsns,
                }))
            }
            CT_HEARTBEAT | CT_HEARTBEAT_ACK => {
                let info = decode_params(value)?
                    .into_iter()
                    .find(|(t, _)| *t == 1)
                    .map(|(_, v)| v)
                    .unwrap_or_default();
                if typ == CT_HEARTBEAT {
                    Ok(Chunk::Heartbeat(info))
                } else {
                    Ok(Chunk::HeartbeatAck(info))
                }
            }
            CT_ABORT => {
                let reason = decode_params(value)
                    .ok()
                    .and_then(|params| params.into_iter().next())
                    .map(|(_, v)| String::from_utf8_lossy(&v).to_string())
                    .unwrap_or_default();
                Ok(Chunk::Abort(reason))
            }
            CT_SHUTDOWN => {
                if value.len() < 4 {
                    return Err(Error::ErrChunkHeaderInvalidLength);
                }
                Ok(Chunk::Shutdown {
                    cumulative_tsn_ack: BigEndian::read_u32(&value[0..4]),
                })
            }
            CT_SHUTDOWN_ACK => Ok(Chunk::ShutdownAck),
            CT_COOKIE_ECHO => Ok(Chunk::CookieEcho(value.to_vec())),
            CT_COOKIE_ACK => Ok(Chunk::CookieAck),
            CT_SHUTDOWN_COMPLETE => Ok(Chunk::ShutdownComplete),
            CT_FORWARD_TSN => {
                if value.len() < 4 || (value.len() - 4) % 4 != 0 {
                    return Err(Error::ErrChunkHeaderInvalidLength);
                }
                let streams = value[4..]
                    .chunks_exact(4)
                    .map(|pair| {
                        (
                            BigEndian::read_u16(&pair[0..2]),
                            BigEndian::read_u16(&pair[2..4]),
                        )
                    })
                    .collect();
                Ok(Chunk::ForwardTsn(ChunkForwardTsn {
                    new_cumulative_tsn: BigEndian::read_u32(&value[0..4]),
                    streams,
                }))
            }
            _ => Err(Error::ErrUnmarshalUnknownChunkType(typ)),
        }
    }
}

fn encode_param(out: &mut Vec<u8>, typ: u16, value: &[u8]) {
    out.extend_from_slice(&typ.to_be_bytes());
    out.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    out.extend_from_slice(value);
    out.resize(out.len() + padded(value.len()) - value.len(), 0);
}

fn decode_params(raw: &[u8]) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut params = vec![];
    let mut offset = 0;
    while offset + 4 <= raw.len() {
        let typ = BigEndian::read_u16(&raw[offset..offset + 2]);
        let length = BigEndian::read_u16(&raw[offset + 2..offset + 4]) as usize;
        if length < 4 || offset + length > raw.len() {
            return Err(Error::ErrChunkHeaderInvalidLength);
        }
        params.push((typ, raw[offset + 4..offset + length].to_vec()));
        offset += padded(length);
    }
    Ok(params)
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(chunk: Chunk) -> Chunk {
        let mut wire = vec![];
        chunk.encode(&mut wire);
        assert_eq!(wire.len() % 4, 0, "chunks are padded to 4 bytes");
        let mut decoded = Chunk::decode_all(&wire).unwrap();
        assert_eq!(decoded.len(), 1);
        decoded.pop().unwrap()
    }

    #[test]
    fn test_data_chunk_round_trip() {
        let chunk = Chunk::Data(ChunkData {
            unordered: false,
            beginning: true,
            ending: false,
            tsn: 1234567,
            stream_id: 3,
            stream_seq: 42,
            ppid: 51,
            user_data: Bytes::from_static(b"hello"),
        });
        assert_eq!(round_trip(chunk.clone()), chunk);
    }

    #[test]
    fn test_init_ack_carries_cookie() {
        let chunk = Chunk::Init(ChunkInit {
            is_ack: true,
            initiate_tag: 0xdeadbeef,
            a_rwnd: 1500,
            outbound_streams: 1024,
            inbound_streams: 1024,
            initial_tsn: 100,
            cookie: Some(vec![9u8; 32]),
        });
        let decoded = round_trip(chunk.clone());
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_sack_with_gaps_and_dups() {
        let chunk = Chunk::Sack(ChunkSack {
            cumulative_tsn_ack: 1000,
            a_rwnd: 65536,
            gap_ack_blocks: vec![GapAckBlock { start: 2, end: 4 }, GapAckBlock { start: 7, end: 7 }],
            duplicate_tsns: vec![999, 1000],
        });
        assert_eq!(round_trip(chunk.clone()), chunk);
    }

    #[test]
    fn test_forward_tsn_round_trip() {
        let chunk = Chunk::ForwardTsn(ChunkForwardTsn {
            new_cumulative_tsn: 5000,
            streams: vec![(1, 10), (3, 2)],
        });
        assert_eq!(round_trip(chunk.clone()), chunk);
    }

    #[test]
    fn test_abort_reason_round_trip() {
        let chunk = Chunk::Abort("retransmission limit".to_string());
        assert_eq!(round_trip(chunk.clone()), chunk);
    }

    #[test]
    fn test_unknown_chunk_type_rejected() {
        let wire = [0x63u8, 0, 0, 4];
        assert_eq!(
            Chunk::decode_all(&wire).err(),
            Some(Error::ErrUnmarshalUnknownChunkType(0x63))
        );
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let mut wire = vec![];
        Chunk::CookieEcho(vec![1, 2, 3, 4, 5, 6]).encode(&mut wire);
        wire.truncate(7);
        assert!(Chunk::decode_all(&wire).is_err());
    }
}
