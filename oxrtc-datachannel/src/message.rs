use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;

use sctp::ReliabilityPolicy;
use shared::error::{Error, Result};

const MESSAGE_TYPE_ACK: u8 = 0x02;
const MESSAGE_TYPE_OPEN: u8 = 0x03;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const CHANNEL_TYPE_UNORDERED_FLAG: u8 = 0x80;

/// RFC 8832 channel type byte, split into reliability and ordering.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelType {
    pub ordered: bool,
    pub policy_kind: u8,
}

impl ChannelType {
    pub fn new(ordered: bool, policy: ReliabilityPolicy) -> Self {
        let policy_kind = match policy {
            ReliabilityPolicy::Reliable => CHANNEL_TYPE_RELIABLE,
            ReliabilityPolicy::MaxRetransmits(_) => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            ReliabilityPolicy::MaxLifetime(_) => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
        };
        Self {
            ordered,
            policy_kind,
        }
    }

    pub fn raw(&self) -> u8 {
        if self.ordered {
            self.policy_kind
        } else {
            self.policy_kind | CHANNEL_TYPE_UNORDERED_FLAG
        }
    }

    pub fn parse(raw: u8) -> Result<Self> {
        let policy_kind = raw & !CHANNEL_TYPE_UNORDERED_FLAG;
        if policy_kind > CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED {
            return Err(Error::InvalidChannelType(raw));
        }
        Ok(Self {
            ordered: raw & CHANNEL_TYPE_UNORDERED_FLAG == 0,
            policy_kind,
        })
    }

    /// Recombines the type byte with the reliability parameter field.
    pub fn reliability_policy(&self, parameter: u32) -> ReliabilityPolicy {
        match self.policy_kind {
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => ReliabilityPolicy::MaxRetransmits(parameter),
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => {
                ReliabilityPolicy::MaxLifetime(Duration::from_millis(u64::from(parameter)))
            }
            _ => ReliabilityPolicy::Reliable,
        }
    }
}

pub fn reliability_parameter(policy: ReliabilityPolicy) -> u32 {
    match policy {
        ReliabilityPolicy::Reliable => 0,
        ReliabilityPolicy::MaxRetransmits(n) => n,
        ReliabilityPolicy::MaxLifetime(d) => d.as_millis() as u32,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelMessage {
    Open(DataChannelOpen),
    Ack,
}

impl DataChannelMessage {
    pub fn marshal(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        match self {
            DataChannelMessage::Ack => buf.put_u8(MESSAGE_TYPE_ACK),
            DataChannelMessage::Open(open) => {
                if open.label.len() > u16::MAX as usize || open.protocol.len() > u16::MAX as usize {
                    return Err(Error::ErrStringSizeLimit);
                }
                buf.put_u8(MESSAGE_TYPE_OPEN);
                buf.put_u8(open.channel_type.raw());
                buf.put_u16(open.priority);
                buf.put_u32(open.reliability_parameter);
                buf.put_u16(open.label.len() as u16);
                buf.put_u16(open.protocol.len() as u16);
                buf.put_slice(open.label.as_bytes());
                buf.put_slice(open.protocol.as_bytes());
            }
        }
        Ok(buf)
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self> {
        let mut buf = raw;
        if buf.remaining() < 1 {
            return Err(Error::ErrShortPacket);
        }
        match buf.get_u8() {
            MESSAGE_TYPE_ACK => Ok(DataChannelMessage::Ack),
            MESSAGE_TYPE_OPEN => {
                if buf.remaining() < 11 {
                    return Err(Error::ErrShortPacket);
                }
                let channel_type = ChannelType::parse(buf.get_u8())?;
                let priority = buf.get_u16();
                let reliability_parameter = buf.get_u32();
                let label_len = usize::from(buf.get_u16());
                let protocol_len = usize::from(buf.get_u16());
                if buf.remaining() < label_len + protocol_len {
                    return Err(Error::ErrShortPacket);
                }
                let label = String::from_utf8_lossy(&buf[..label_len]).into_owned();
                buf.advance(label_len);
                let protocol = String::from_utf8_lossy(&buf[..protocol_len]).into_owned();
                Ok(DataChannelMessage::Open(DataChannelOpen {
                    channel_type,
                    priority,
                    reliability_parameter,
                    label,
                    protocol,
                }))
            }
            other => Err(Error::InvalidMessageType(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_open_round_trip() {
        let open = DataChannelMessage::Open(DataChannelOpen {
            channel_type: ChannelType::new(true, ReliabilityPolicy::Reliable),
            priority: 256,
            reliability_parameter: 0,
            label: "chat".to_string(),
            protocol: "".to_string(),
        });
        let raw = open.marshal().unwrap();
        assert_eq!(raw[0], MESSAGE_TYPE_OPEN);
        assert_eq!(raw[1], CHANNEL_TYPE_RELIABLE);
        assert_eq!(DataChannelMessage::unmarshal(&raw).unwrap(), open);
    }

    #[test]
    fn test_ack_round_trip() {
        let raw = DataChannelMessage::Ack.marshal().unwrap();
        assert_eq!(&raw[..], &[MESSAGE_TYPE_ACK]);
        assert_eq!(
            DataChannelMessage::unmarshal(&raw).unwrap(),
            DataChannelMessage::Ack
        );
    }

    #[test]
    fn test_channel_type_mapping() {
        let ct = ChannelType::new(false, ReliabilityPolicy::MaxRetransmits(3));
        assert_eq!(ct.raw(), 0x81);
        let parsed = ChannelType::parse(0x81).unwrap();
        assert!(!parsed.ordered);
        assert_eq!(
            parsed.reliability_policy(3),
            ReliabilityPolicy::MaxRetransmits(3)
        );

        let timed = ChannelType::parse(0x02).unwrap();
        assert!(timed.ordered);
        assert_eq!(
            timed.reliability_policy(1500),
            ReliabilityPolicy::MaxLifetime(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_unknown_channel_type_rejected() {
        assert!(ChannelType::parse(0x7F).is_err());
    }

    #[test]
    fn test_truncated_open_rejected() {
        let open = DataChannelMessage::Open(DataChannelOpen {
            channel_type: ChannelType::new(true, ReliabilityPolicy::Reliable),
            priority: 0,
            reliability_parameter: 0,
            label: "verylonglabel".to_string(),
            protocol: "".to_string(),
        });
        let raw = open.marshal().unwrap();
        assert!(DataChannelMessage::unmarshal(&raw[..raw.len() - 4]).is_err());
    }
}
