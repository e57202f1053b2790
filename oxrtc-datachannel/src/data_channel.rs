use bytes::Bytes;
use log::debug;

use sctp::ReliabilityPolicy;
use shared::error::{Error, Result};

use crate::message::{
    reliability_parameter, ChannelType, DataChannelMessage, DataChannelOpen,
};

/// SCTP payload protocol identifiers for data channel traffic.
pub const PPID_DCEP: u32 = 50;
pub const PPID_STRING: u32 = 51;
pub const PPID_BINARY: u32 = 53;
pub const PPID_STRING_EMPTY: u32 = 56;
pub const PPID_BINARY_EMPTY: u32 = 57;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelPayload {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub label: String,
    pub protocol: String,
    pub ordered: bool,
    pub reliability: ReliabilityPolicy,
    pub priority: u16,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            protocol: String::new(),
            ordered: true,
            reliability: ReliabilityPolicy::Reliable,
            priority: 256,
        }
    }
}

/// One data channel mapped onto one SCTP stream. The channel owns the
/// DCEP handshake and payload framing; moving bytes through the
/// association is the caller's job.
#[derive(Debug, Clone)]
pub struct DataChannel {
    stream_id: u16,
    config: DataChannelConfig,
    state: ReadyState,
}

impl DataChannel {
    /// Opens a channel locally; the returned message must be sent on the
    /// channel's stream with [`PPID_DCEP`].
    pub fn dial(config: DataChannelConfig, stream_id: u16) -> (Self, DataChannelMessage) {
        let open = DataChannelMessage::Open(DataChannelOpen {
            channel_type: ChannelType::new(config.ordered, config.reliability),
            priority: config.priority,
            reliability_parameter: reliability_parameter(config.reliability),
            label: config.label.clone(),
            protocol: config.protocol.clone(),
        });
        debug!("dialing data channel {:?} on stream {stream_id}", config.label);
        (
            Self {
                stream_id,
                config,
                state: ReadyState::Connecting,
            },
            open,
        )
    }

    /// Accepts a remote DATA_CHANNEL_OPEN; the ack goes back on the same
    /// stream and the channel is immediately usable.
    pub fn accept(open: DataChannelOpen, stream_id: u16) -> (Self, DataChannelMessage) {
        let config = DataChannelConfig {
            label: open.label,
            protocol: open.protocol,
            ordered: open.channel_type.ordered,
            reliability: open
                .channel_type
                .reliability_policy(open.reliability_parameter),
            priority: open.priority,
        };
        debug!(
            "accepted data channel {:?} on stream {stream_id}",
            config.label
        );
        (
            Self {
                stream_id,
                config,
                state: ReadyState::Open,
            },
            DataChannelMessage::Ack,
        )
    }

    pub fn handle_ack(&mut self) -> Result<()> {
        if self.state != ReadyState::Connecting {
            return Err(Error::ErrDataChannelClosed);
        }
        self.state = ReadyState::Open;
        Ok(())
    }

    /// Frames user data for the association: picks the PPID and maps the
    /// empty-message convention (a single zero byte on an empty PPID).
    pub fn frame_outbound(&self, payload: &DataChannelPayload) -> Result<(u32, Bytes)> {
        if self.state != ReadyState::Open {
            return Err(Error::ErrDataChannelClosed);
        }
        Ok(match payload {
            DataChannelPayload::Text(text) if text.is_empty() => {
                (PPID_STRING_EMPTY, Bytes::from_static(&[0]))
            }
            DataChannelPayload::Text(text) => {
                (PPID_STRING, Bytes::copy_from_slice(text.as_bytes()))
            }
            DataChannelPayload::Binary(data) if data.is_empty() => {
                (PPID_BINARY_EMPTY, Bytes::from_static(&[0]))
            }
            DataChannelPayload::Binary(data) => (PPID_BINARY, data.clone()),
        })
    }

    /// Maps inbound user data back to a payload; `None` for PPIDs this
    /// channel does not understand.
    pub fn parse_inbound(&self, ppid: u32, data: Bytes) -> Option<DataChannelPayload> {
        match ppid {
            PPID_STRING => Some(DataChannelPayload::Text(
                String::from_utf8_lossy(&data).into_owned(),
            )),
            PPID_STRING_EMPTY => Some(DataChannelPayload::Text(String::new())),
            PPID_BINARY => Some(DataChannelPayload::Binary(data)),
            PPID_BINARY_EMPTY => Some(DataChannelPayload::Binary(Bytes::new())),
            _ => None,
        }
    }

    pub fn close(&mut self) {
        if self.state != ReadyState::Closed {
            self.state = ReadyState::Closing;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = ReadyState::Closed;
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn protocol(&self) -> &str {
        &self.config.protocol
    }

    pub fn ordered(&self) -> bool {
        self.config.ordered
    }

    pub fn reliability(&self) -> ReliabilityPolicy {
        self.config.reliability
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chat_config() -> DataChannelConfig {
        DataChannelConfig {
            label: "chat".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dial_accept_handshake() {
        let (mut local, open_msg) = DataChannel::dial(chat_config(), 0);
        assert_eq!(local.ready_state(), ReadyState::Connecting);

        let DataChannelMessage::Open(open) =
            DataChannelMessage::unmarshal(&open_msg.marshal().unwrap()).unwrap()
        else {
            panic!("expected open message");
        };
        let (remote, ack) = DataChannel::accept(open, 0);
        assert_eq!(remote.ready_state(), ReadyState::Open);
        assert_eq!(remote.label(), "chat");
        assert!(remote.ordered());
        assert_eq!(remote.reliability(), ReliabilityPolicy::Reliable);
        assert_eq!(ack, DataChannelMessage::Ack);

        local.handle_ack().unwrap();
        assert_eq!(local.ready_state(), ReadyState::Open);
    }

    #[test]
    fn test_partial_reliability_carried_through_open() {
        let config = DataChannelConfig {
            label: "telemetry".to_string(),
            ordered: false,
            reliability: ReliabilityPolicy::MaxRetransmits(2),
            ..Default::default()
        };
        let (_, open_msg) = DataChannel::dial(config, 2);
        let DataChannelMessage::Open(open) =
            DataChannelMessage::unmarshal(&open_msg.marshal().unwrap()).unwrap()
        else {
            panic!("expected open message");
        };
        let (remote, _) = DataChannel::accept(open, 2);
        assert!(!remote.ordered());
        assert_eq!(remote.reliability(), ReliabilityPolicy::MaxRetransmits(2));
    }

    #[test]
    fn test_payload_framing() {
        let (mut channel, _) = DataChannel::dial(chat_config(), 0);
        channel.handle_ack().unwrap();

        let (ppid, data) = channel
            .frame_outbound(&DataChannelPayload::Text("ping".to_string()))
            .unwrap();
        assert_eq!(ppid, PPID_STRING);
        assert_eq!(
            channel.parse_inbound(ppid, data),
            Some(DataChannelPayload::Text("ping".to_string()))
        );

        let (ppid, data) = channel
            .frame_outbound(&DataChannelPayload::Binary(Bytes::new()))
            .unwrap();
        assert_eq!(ppid, PPID_BINARY_EMPTY);
        assert_eq!(&data[..], &[0]);
        assert_eq!(
            channel.parse_inbound(ppid, data),
            Some(DataChannelPayload::Binary(Bytes::new()))
        );

        assert_eq!(channel.parse_inbound(PPID_DCEP, Bytes::new()), None);
    }

    #[test]
    fn test_write_requires_open() {
        let (channel, _) = DataChannel::dial(chat_config(), 0);
        let result = channel.frame_outbound(&DataChannelPayload::Text("early".to_string()));
        assert_eq!(result.unwrap_err(), Error::ErrDataChannelClosed);
    }
}
