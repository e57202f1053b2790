use bytes::{Buf, BufMut, Bytes, BytesMut};

use shared::error::{Error, Result};

pub const TYPE_SENDER_REPORT: u8 = 200;
pub const TYPE_RECEIVER_REPORT: u8 = 201;
pub const TYPE_SOURCE_DESCRIPTION: u8 = 202;
pub const TYPE_GOODBYE: u8 = 203;
pub const TYPE_TRANSPORT_FEEDBACK: u8 = 205;
pub const TYPE_PAYLOAD_FEEDBACK: u8 = 206;

pub const FORMAT_NACK: u8 = 1;
pub const FORMAT_REMB: u8 = 15;

const SDES_CNAME: u8 = 1;
const MAX_REPORT_COUNT: usize = 31;

/// Per-source block carried in sender and receiver reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative loss.
    pub total_lost: u32,
    pub last_sequence_number: u32,
    pub jitter: u32,
    pub last_sender_report: u32,
    pub delay: u32,
}

impl ReceptionReport {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.total_lost > 0x00FF_FFFF {
            return Err(Error::ErrInvalidTotalLost);
        }
        buf.put_u32(self.ssrc);
        buf.put_u32((u32::from(self.fraction_lost) << 24) | self.total_lost);
        buf.put_u32(self.last_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sender_report);
        buf.put_u32(self.delay);
        Ok(())
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 24 {
            return Err(Error::ErrPacketTooShort);
        }
        let ssrc = buf.get_u32();
        let word = buf.get_u32();
        Ok(Self {
            ssrc,
            fraction_lost: (word >> 24) as u8,
            total_lost: word & 0x00FF_FFFF,
            last_sequence_number: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sender_report: buf.get_u32(),
            delay: buf.get_u32(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: String,
}

/// One NACK FCI entry: a base packet id plus a bitmask of the 16
/// sequence numbers after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    pub fn packet_list(&self) -> Vec<u16> {
        let mut seqs = vec![self.packet_id];
        for bit in 0..16u16 {
            if self.lost_packets & (1 << bit) != 0 {
                seqs.push(self.packet_id.wrapping_add(bit + 1));
            }
        }
        seqs
    }
}

/// Packs a sorted list of lost sequence numbers into NACK pairs.
pub fn nack_pairs_from_sequence_numbers(seqs: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = vec![];
    for &seq in seqs {
        if let Some(last) = pairs.last_mut() {
            let offset = seq.wrapping_sub(last.packet_id);
            if offset > 0 && offset <= 16 {
                last.lost_packets |= 1 << (offset - 1);
                continue;
            }
        }
        pairs.push(NackPair {
            packet_id: seq,
            lost_packets: 0,
        });
    }
    pairs
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportLayerNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverEstimatedMaximumBitrate {
    pub sender_ssrc: u32,
    pub bitrate: u64,
    pub ssrcs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
    TransportLayerNack(TransportLayerNack),
    ReceiverEstimatedMaximumBitrate(ReceiverEstimatedMaximumBitrate),
}

fn put_header(buf: &mut BytesMut, count: u8, packet_type: u8, body_len: usize) {
    buf.put_u8(0x80 | (count & 0x1F));
    buf.put_u8(packet_type);
    buf.put_u16(((body_len + 4) / 4 - 1) as u16);
}

impl RtcpPacket {
    pub fn marshal(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        match self {
            RtcpPacket::SenderReport(sr) => {
                if sr.reports.len() > MAX_REPORT_COUNT {
                    return Err(Error::ErrTooManyReports);
                }
                put_header(
                    &mut buf,
                    sr.reports.len() as u8,
                    TYPE_SENDER_REPORT,
                    24 + sr.reports.len() * 24,
                );
                buf.put_u32(sr.ssrc);
                buf.put_u64(sr.ntp_time);
                buf.put_u32(sr.rtp_time);
                buf.put_u32(sr.packet_count);
                buf.put_u32(sr.octet_count);
                for report in &sr.reports {
                    report.encode(&mut buf)?;
                }
            }
            RtcpPacket::ReceiverReport(rr) => {
                if rr.reports.len() > MAX_REPORT_COUNT {
                    return Err(Error::ErrTooManyReports);
                }
                put_header(
                    &mut buf,
                    rr.reports.len() as u8,
                    TYPE_RECEIVER_REPORT,
                    4 + rr.reports.len() * 24,
                );
                buf.put_u32(rr.ssrc);
                for report in &rr.reports {
                    report.encode(&mut buf)?;
                }
            }
            RtcpPacket::SourceDescription(sdes) => {
                let mut body = BytesMut::new();
                for chunk in &sdes.chunks {
                    if chunk.cname.len() > u8::MAX as usize {
                        return Err(Error::ErrStringSizeLimit);
                    }
                    body.put_u32(chunk.ssrc);
                    body.put_u8(SDES_CNAME);
                    body.put_u8(chunk.cname.len() as u8);
                    body.put_slice(chunk.cname.as_bytes());
                    // item list terminator plus padding to a word boundary
                    body.put_u8(0);
                    while body.len() % 4 != 0 {
                        body.put_u8(0);
                    }
                }
                put_header(
                    &mut buf,
                    sdes.chunks.len() as u8,
                    TYPE_SOURCE_DESCRIPTION,
                    body.len(),
                );
                buf.extend_from_slice(&body);
            }
            RtcpPacket::Goodbye(bye) => {
                let mut body = BytesMut::new();
                for ssrc in &bye.sources {
                    body.put_u32(*ssrc);
                }
                if !bye.reason.is_empty() {
                    if bye.reason.len() > u8::MAX as usize {
                        return Err(Error::ErrStringSizeLimit);
                    }
                    body.put_u8(bye.reason.len() as u8);
                    body.put_slice(bye.reason.as_bytes());
                    while body.len() % 4 != 0 {
                        body.put_u8(0);
                    }
                }
                put_header(&mut buf, bye.sources.len() as u8, TYPE_GOODBYE, body.len());
                buf.extend_from_slice(&body);
            }
            RtcpPacket::TransportLayerNack(nack) => {
                put_header(
                    &mut buf,
                    FORMAT_NACK,
                    TYPE_TRANSPORT_FEEDBACK,
                    8 + nack.nacks.len() * 4,
                );
                buf.put_u32(nack.sender_ssrc);
                buf.put_u32(nack.media_ssrc);
                for pair in &nack.nacks {
                    buf.put_u16(pair.packet_id);
                    buf.put_u16(pair.lost_packets);
                }
            }
            RtcpPacket::ReceiverEstimatedMaximumBitrate(remb) => {
                let mut mantissa = remb.bitrate;
                let mut exponent = 0u8;
                while mantissa >= 1 << 18 {
                    mantissa >>= 1;
                    exponent += 1;
                }
                put_header(
                    &mut buf,
                    FORMAT_REMB,
                    TYPE_PAYLOAD_FEEDBACK,
                    16 + remb.ssrcs.len() * 4,
                );
                buf.put_u32(remb.sender_ssrc);
                buf.put_u32(0); // media ssrc is always zero for REMB
                buf.put_slice(b"REMB");
                buf.put_u8(remb.ssrcs.len() as u8);
                buf.put_u8((exponent << 2) | ((mantissa >> 16) as u8 & 0x03));
                buf.put_u16(mantissa as u16);
                for ssrc in &remb.ssrcs {
                    buf.put_u32(*ssrc);
                }
            }
        }
        Ok(buf)
    }

    fn decode(packet_type: u8, count: u8, mut body: Bytes) -> Result<Option<Self>> {
        match packet_type {
            TYPE_SENDER_REPORT => {
                if body.remaining() < 24 {
                    return Err(Error::ErrPacketTooShort);
                }
                let mut sr = SenderReport {
                    ssrc: body.get_u32(),
                    ntp_time: body.get_u64(),
                    rtp_time: body.get_u32(),
                    packet_count: body.get_u32(),
                    octet_count: body.get_u32(),
                    reports: vec![],
                };
                for _ in 0..count {
                    sr.reports.push(ReceptionReport::decode(&mut body)?);
                }
                Ok(Some(RtcpPacket::SenderReport(sr)))
            }
            TYPE_RECEIVER_REPORT => {
                if body.remaining() < 4 {
                    return Err(Error::ErrPacketTooShort);
                }
                let mut rr = ReceiverReport {
                    ssrc: body.get_u32(),
                    reports: vec![],
                };
                for _ in 0..count {
                    rr.reports.push(ReceptionReport::decode(&mut body)?);
                }
                Ok(Some(RtcpPacket::ReceiverReport(rr)))
            }
            TYPE_SOURCE_DESCRIPTION => {
                let mut sdes = SourceDescription { chunks: vec![] };
                for _ in 0..count {
                    if body.remaining() < 4 {
                        return Err(Error::ErrPacketTooShort);
                    }
                    let ssrc = body.get_u32();
                    let mut cname = String::new();
                    let mut consumed = 4usize;
                    loop {
                        if body.remaining() < 1 {
                            return Err(Error::ErrPacketTooShort);
                        }
                        let item_type = body.get_u8();
                        consumed += 1;
                        if item_type == 0 {
                            break;
                        }
                        if body.remaining() < 1 {
                            return Err(Error::ErrPacketTooShort);
                        }
                        let len = usize::from(body.get_u8());
                        consumed += 1 + len;
                        if body.remaining() < len {
                            return Err(Error::ErrPacketTooShort);
                        }
                        let text = body.copy_to_bytes(len);
                        if item_type == SDES_CNAME {
                            cname = String::from_utf8_lossy(&text).into_owned();
                        }
                    }
                    while consumed % 4 != 0 {
                        if body.remaining() < 1 {
                            return Err(Error::ErrPacketTooShort);
                        }
                        body.get_u8();
                        consumed += 1;
                    }
                    sdes.chunks.push(SdesChunk { ssrc, cname });
                }
                Ok(Some(RtcpPacket::SourceDescription(sdes)))
            }
            TYPE_GOODBYE => {
                let mut bye = Goodbye {
                    sources: vec![],
                    reason: String::new(),
                };
                for _ in 0..count {
                    if body.remaining() < 4 {
                        return Err(Error::ErrPacketTooShort);
                    }
                    bye.sources.push(body.get_u32());
                }
                if body.remaining() > 0 {
                    let len = usize::from(body.get_u8());
                    if body.remaining() < len {
                        return Err(Error::ErrPacketTooShort);
                    }
                    let text = body.copy_to_bytes(len);
                    bye.reason = String::from_utf8_lossy(&text).into_owned();
                }
                Ok(Some(RtcpPacket::Goodbye(bye)))
            }
            TYPE_TRANSPORT_FEEDBACK if count == FORMAT_NACK => {
                if body.remaining() < 8 {
                    return Err(Error::ErrPacketTooShort);
                }
                let mut nack = TransportLayerNack {
                    sender_ssrc: body.get_u32(),
                    media_ssrc: body.get_u32(),
                    nacks: vec![],
                };
                while body.remaining() >= 4 {
                    nack.nacks.push(NackPair {
                        packet_id: body.get_u16(),
                        lost_packets: body.get_u16(),
                    });
                }
                Ok(Some(RtcpPacket::TransportLayerNack(nack)))
            }
            TYPE_PAYLOAD_FEEDBACK if count == FORMAT_REMB => {
                if body.remaining() < 16 {
                    return Err(Error::ErrPacketTooShort);
                }
                let sender_ssrc = body.get_u32();
                let _media_ssrc = body.get_u32();
                let mut identifier = [0u8; 4];
                body.copy_to_slice(&mut identifier);
                if &identifier != b"REMB" {
                    return Err(Error::ErrMissingRembIdentifier);
                }
                let ssrc_count = usize::from(body.get_u8());
                let b = body.get_u8();
                let exponent = b >> 2;
                let mantissa = (u64::from(b & 0x03) << 16) | u64::from(body.get_u16());
                let mut remb = ReceiverEstimatedMaximumBitrate {
                    sender_ssrc,
                    bitrate: mantissa << exponent,
                    ssrcs: vec![],
                };
                for _ in 0..ssrc_count {
                    if body.remaining() < 4 {
                        return Err(Error::ErrPacketTooShort);
                    }
                    remb.ssrcs.push(body.get_u32());
                }
                Ok(Some(RtcpPacket::ReceiverEstimatedMaximumBitrate(remb)))
            }
            _ => Ok(None),
        }
    }
}

/// Parses a compound RTCP datagram; unrecognized packet types are skipped.
pub fn unmarshal_compound(raw: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = vec![];
    let mut buf = Bytes::copy_from_slice(raw);
    while buf.remaining() >= 4 {
        let b0 = buf.get_u8();
        if b0 >> 6 != 2 {
            return Err(Error::ErrBadVersion);
        }
        let count = b0 & 0x1F;
        let packet_type = buf.get_u8();
        let body_len = usize::from(buf.get_u16()) * 4;
        if buf.remaining() < body_len {
            return Err(Error::ErrPacketTooShort);
        }
        let body = buf.copy_to_bytes(body_len);
        if let Some(packet) = RtcpPacket::decode(packet_type, count, body)? {
            packets.push(packet);
        }
    }
    Ok(packets)
}

/// Concatenates packets into one compound datagram.
pub fn marshal_compound(packets: &[RtcpPacket]) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    for packet in packets {
        buf.extend_from_slice(&packet.marshal()?);
    }
    Ok(buf)
}

pub fn is_rtcp(raw: &[u8]) -> bool {
    // RTCP packet types 192..=223 occupy the payload-type byte
    raw.len() >= 2 && (192..=223).contains(&raw[1])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sender_report_round_trip() {
        let sr = RtcpPacket::SenderReport(SenderReport {
            ssrc: 0x1111,
            ntp_time: 0x0001_0002_0003_0004,
            rtp_time: 960,
            packet_count: 17,
            octet_count: 4080,
            reports: vec![ReceptionReport {
                ssrc: 0x2222,
                fraction_lost: 12,
                total_lost: 5,
                last_sequence_number: 0x0001_0042,
                jitter: 3,
                last_sender_report: 0x10,
                delay: 0x20,
            }],
        });
        let raw = sr.marshal().unwrap();
        assert_eq!(raw.len() % 4, 0);
        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![sr]);
    }

    #[test]
    fn test_sdes_and_goodbye_round_trip() {
        let packets = vec![
            RtcpPacket::SourceDescription(SourceDescription {
                chunks: vec![SdesChunk {
                    ssrc: 7,
                    cname: "stream@host".to_string(),
                }],
            }),
            RtcpPacket::Goodbye(Goodbye {
                sources: vec![7],
                reason: "shutdown".to_string(),
            }),
        ];
        let raw = marshal_compound(&packets).unwrap();
        assert_eq!(raw.len() % 4, 0);
        assert_eq!(unmarshal_compound(&raw).unwrap(), packets);
    }

    #[test]
    fn test_nack_pair_expansion() {
        let pair = NackPair {
            packet_id: 100,
            lost_packets: 0b1000_0001,
        };
        assert_eq!(pair.packet_list(), vec![100, 101, 108]);

        let pairs = nack_pairs_from_sequence_numbers(&[100, 101, 108, 200]);
        assert_eq!(
            pairs,
            vec![
                NackPair {
                    packet_id: 100,
                    lost_packets: 0b1000_0001
                },
                NackPair {
                    packet_id: 200,
                    lost_packets: 0
                }
            ]
        );
    }

    #[test]
    fn test_nack_round_trip() {
        let nack = RtcpPacket::TransportLayerNack(TransportLayerNack {
            sender_ssrc: 1,
            media_ssrc: 2,
            nacks: vec![NackPair {
                packet_id: 42,
                lost_packets: 0x0003,
            }],
        });
        let raw = nack.marshal().unwrap();
        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![nack]);
    }

    #[test]
    fn test_remb_round_trip() {
        let remb = RtcpPacket::ReceiverEstimatedMaximumBitrate(ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 1,
            bitrate: 8_927_168,
            ssrcs: vec![0x1234_5678],
        });
        let raw = remb.marshal().unwrap();
        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![remb]);
    }

    #[test]
    fn test_unknown_packet_type_is_skipped() {
        // an APP packet (204) followed by a receiver report
        let mut raw = BytesMut::new();
        raw.put_slice(&[0x80, 204, 0x00, 0x02]);
        raw.put_slice(&[0u8; 8]);
        let rr = RtcpPacket::ReceiverReport(ReceiverReport {
            ssrc: 99,
            reports: vec![],
        });
        raw.extend_from_slice(&rr.marshal().unwrap());

        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![rr]);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let rr = RtcpPacket::ReceiverReport(ReceiverReport {
            ssrc: 99,
            reports: vec![],
        });
        let raw = rr.marshal().unwrap();
        assert!(unmarshal_compound(&raw[..raw.len() - 1]).is_err());
    }
}
