use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use datachannel::data_channel::PPID_DCEP;
use datachannel::{DataChannel, DataChannelConfig, DataChannelMessage, DataChannelPayload};
use dtls::{Certificate, DtlsConfig, DtlsEndpoint, DtlsEvent, DtlsRole};
use ice::{Agent, AgentConfig, Candidate, ConnectionState, IceEvent};
use rtp::packet::Packet as RtpPacket;
use rtp::rtcp;
use rtp::{RtpSession, SessionConfig, SessionEvent};
use sctp::{Association, AssociationConfig, AssociationEvent};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, Unmarshal};
use shared::TaggedBytesMut;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BundleKind {
    Media,
    Data,
}

/// Events a bundle surfaces to the peer connection.
#[derive(Debug)]
pub(crate) enum BundleEvent {
    IceConnectionStateChange(ConnectionState),
    DtlsConnected,
    RtpReceived(RtpPacket),
    BandwidthEstimate(u64),
    DataChannelOpened { stream_id: u16, label: String },
    DataChannelMessage { label: String, payload: DataChannelPayload },
    TransportFailed(String),
}

/// One media section's transport stack: an ICE agent feeding a DTLS
/// endpoint which keys SRTP (media) or carries SCTP (data). The bundle
/// demultiplexes inbound datagrams by their leading byte, the single
/// dispatch point the whole stack shares.
pub(crate) struct TransportBundle {
    pub(crate) kind: BundleKind,
    pub(crate) mid: String,
    pub(crate) local_addr: SocketAddr,
    pub(crate) agent: Agent,

    certificate: Certificate,
    remote_fingerprint: Option<String>,
    dtls: Option<DtlsEndpoint>,
    dtls_role: Option<DtlsRole>,
    handshake_started: bool,

    srtp_write: Option<srtp::Context>,
    srtp_read: Option<srtp::Context>,
    pub(crate) rtp_session: Option<RtpSession>,
    pub(crate) media_ssrc: Option<u32>,
    /// Packets dropped for failed SRTP authentication, absorbed locally.
    auth_failures: u64,

    sctp: Option<Association>,
    channels: Vec<DataChannel>,
    pending_channels: Vec<DataChannelConfig>,
    next_stream_id: u16,

    /// Set when the peer declined this section with a zero port.
    pub(crate) rejected: bool,

    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<BundleEvent>,
}

impl TransportBundle {
    pub(crate) fn new_media(
        mid: String,
        local_addr: SocketAddr,
        is_controlling: bool,
        certificate: Certificate,
        payload_type: u8,
        clock_rate: u32,
        cname: String,
    ) -> Result<Self> {
        let mut bundle = Self::new(BundleKind::Media, mid, local_addr, is_controlling, certificate)?;
        let mut session = RtpSession::new(SessionConfig {
            cname,
            clock_rate,
            ..Default::default()
        });
        bundle.media_ssrc = Some(session.add_sender(payload_type));
        bundle.rtp_session = Some(session);
        Ok(bundle)
    }

    pub(crate) fn new_data(
        mid: String,
        local_addr: SocketAddr,
        is_controlling: bool,
        certificate: Certificate,
    ) -> Result<Self> {
        Self::new(BundleKind::Data, mid, local_addr, is_controlling, certificate)
    }

    fn new(
        kind: BundleKind,
        mid: String,
        local_addr: SocketAddr,
        is_controlling: bool,
        certificate: Certificate,
    ) -> Result<Self> {
        let mut agent = Agent::new(AgentConfig {
            is_controlling,
            ..Default::default()
        })?;
        agent.add_local_candidate(Candidate::host(local_addr, 1))?;
        agent.end_of_candidates();
        Ok(Self {
            kind,
            mid,
            local_addr,
            agent,
            certificate,
            remote_fingerprint: None,
            dtls: None,
            dtls_role: None,
            handshake_started: false,
            srtp_write: None,
            srtp_read: None,
            rtp_session: None,
            media_ssrc: None,
            auth_failures: 0,
            sctp: None,
            channels: Vec::new(),
            pending_channels: Vec::new(),
            next_stream_id: 0,
            rejected: false,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub(crate) fn local_fingerprint(&self) -> &str {
        &self.certificate.fingerprint
    }

    /// Applies the remote half of the negotiation: ICE credentials and
    /// candidates, the DTLS peer fingerprint and our resolved role.
    pub(crate) fn set_remote(
        &mut self,
        remote_ufrag: String,
        remote_pwd: String,
        remote_fingerprint: String,
        role: DtlsRole,
        candidates: Vec<Candidate>,
    ) -> Result<()> {
        self.agent.set_remote_credentials(remote_ufrag, remote_pwd)?;
        for candidate in candidates {
            self.agent.add_remote_candidate(candidate)?;
        }
        self.dtls_role = Some(role);
        // stream ids split by DTLS role, RFC 8832: client even, server odd
        self.next_stream_id = match role {
            DtlsRole::Client => 0,
            DtlsRole::Server => 1,
        };
        self.dtls = Some(DtlsEndpoint::new(DtlsConfig::new(
            self.certificate.clone(),
            remote_fingerprint.clone(),
            role,
        )));
        self.remote_fingerprint = Some(remote_fingerprint);
        Ok(())
    }

    /// Begins connectivity checks; call once both descriptions are set.
    pub(crate) fn start(&mut self, now: Instant) -> Result<()> {
        if self.rejected {
            return Ok(());
        }
        self.agent.start_connectivity_checks(now)?;
        self.process(now);
        Ok(())
    }

    pub(crate) fn queue_channel(&mut self, config: DataChannelConfig) {
        self.pending_channels.push(config);
    }

    /// Routes one inbound datagram by its first byte: STUN, DTLS or
    /// SRTP/SRTCP share the 5-tuple.
    pub(crate) fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        let now = msg.now;
        let first = match msg.message.first() {
            Some(b) => *b,
            None => return Ok(()),
        };
        match first {
            0..=3 => {
                if let Err(e) = self.agent.handle_read(msg) {
                    trace!("discarded stun message: {e}");
                }
            }
            20..=63 => {
                if let Some(dtls) = &mut self.dtls {
                    match dtls.handle_read(msg) {
                        Ok(()) => {}
                        Err(Error::ErrCertificateFingerprintMismatch) => {
                            self.events.push_back(BundleEvent::TransportFailed(
                                Error::ErrCertificateFingerprintMismatch.to_string(),
                            ));
                        }
                        Err(e) => trace!("discarded dtls record: {e}"),
                    }
                }
            }
            128..=191 => self.handle_srtp_read(msg),
            other => trace!("dropping datagram with unroutable first byte {other}"),
        }
        self.process(now);
        Ok(())
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        self.agent.handle_timeout(now);
        if let Some(dtls) = &mut self.dtls {
            if let Err(e) = dtls.handle_timeout(now) {
                self.events
                    .push_back(BundleEvent::TransportFailed(e.to_string()));
            }
        }
        if let Some(sctp) = &mut self.sctp {
            sctp.handle_timeout(now);
        }
        if let Some(session) = &mut self.rtp_session {
            session.handle_timeout(now);
        }
        self.process(now);
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = self.agent.poll_timeout();
        let mut merge = |other: Option<Instant>| {
            deadline = match (deadline, other) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) | (None, a) => a,
            };
        };
        merge(self.dtls.as_ref().and_then(|d| d.poll_timeout()));
        merge(self.sctp.as_ref().and_then(|s| s.poll_timeout()));
        merge(self.rtp_session.as_ref().and_then(|r| r.poll_timeout()));
        deadline
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    pub(crate) fn poll_event(&mut self) -> Option<BundleEvent> {
        self.events.pop_front()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.dtls
            .as_ref()
            .map_or(false, |d| d.is_handshake_complete())
    }

    /// Packetizes and protects one media frame onto the wire.
    pub(crate) fn write_rtp(
        &mut self,
        timestamp: u32,
        marker: bool,
        payload: Bytes,
        now: Instant,
    ) -> Result<()> {
        let ssrc = self.media_ssrc.ok_or(Error::ErrStreamNotExisted)?;
        let session = self
            .rtp_session
            .as_mut()
            .ok_or(Error::ErrStreamNotExisted)?;
        let packet = session.packetize(ssrc, timestamp, marker, payload, now)?;
        self.send_rtp_packet(&packet, now)?;
        self.process(now);
        Ok(())
    }

    /// Sends one user message on an open data channel.
    pub(crate) fn channel_send(
        &mut self,
        label: &str,
        payload: &DataChannelPayload,
        now: Instant,
    ) -> Result<()> {
        let channel = self
            .channels
            .iter()
            .find(|c| c.label() == label)
            .ok_or(Error::ErrStreamNotExisted)?;
        let (ppid, data) = channel.frame_outbound(payload)?;
        let (stream_id, ordered, policy) =
            (channel.stream_id(), channel.ordered(), channel.reliability());
        let sctp = self
            .sctp
            .as_mut()
            .ok_or(Error::ErrAssociationNotEstablished)?;
        sctp.write(stream_id, ppid, &data, ordered, policy, now)?;
        self.process(now);
        Ok(())
    }

    pub(crate) fn close(&mut self, now: Instant) {
        if let Some(session) = &mut self.rtp_session {
            let _ = session.goodbye("teardown");
        }
        if let Some(sctp) = &mut self.sctp {
            let _ = sctp.shutdown(now);
        }
        for channel in &mut self.channels {
            channel.mark_closed();
        }
        self.process(now);
        if let Some(dtls) = &mut self.dtls {
            dtls.close(now);
        }
        self.drain_dtls();
        self.agent.close();
    }

    /// Moves every component's pending output and events forward. The
    /// single pass ordering matters: agent state can start DTLS, DTLS
    /// completion keys SRTP or SCTP, and SCTP output rides DTLS records.
    fn process(&mut self, now: Instant) {
        self.pump_agent(now);
        self.pump_dtls(now);
        self.pump_sctp(now);
        self.pump_rtp(now);
        self.drain_dtls();
    }

    fn pump_agent(&mut self, now: Instant) {
        while let Some(event) = self.agent.poll_event() {
            match event {
                IceEvent::ConnectionStateChange(state) => {
                    self.events
                        .push_back(BundleEvent::IceConnectionStateChange(state));
                    if matches!(state, ConnectionState::Connected | ConnectionState::Completed) {
                        self.maybe_start_dtls(now);
                    }
                    if state == ConnectionState::Failed {
                        self.events.push_back(BundleEvent::TransportFailed(
                            "ice connectivity failed".to_string(),
                        ));
                    }
                }
                IceEvent::SelectedPairChange(local, remote) => {
                    debug!("{}: selected pair {local} -> {remote}", self.mid);
                    self.maybe_start_dtls(now);
                }
                IceEvent::GatheringStateChange(_) => {}
            }
        }
        while let Some(transmit) = self.agent.poll_transmit() {
            self.transmits.push_back(transmit);
        }
    }

    fn maybe_start_dtls(&mut self, now: Instant) {
        if self.handshake_started {
            return;
        }
        let Some(transport) = self.agent.selected_transport() else {
            return;
        };
        let Some(dtls) = &mut self.dtls else {
            return;
        };
        debug!("{}: starting dtls handshake as {:?}", self.mid, self.dtls_role);
        if dtls.start_handshake(transport, now).is_ok() {
            self.handshake_started = true;
        }
    }

    fn pump_dtls(&mut self, now: Instant) {
        let Some(dtls) = &mut self.dtls else {
            return;
        };
        let mut connected = false;
        let mut inbound: Vec<BytesMut> = vec![];
        while let Some(event) = dtls.poll_event() {
            match event {
                DtlsEvent::HandshakeComplete => connected = true,
                DtlsEvent::ApplicationData(data) => inbound.push(data),
            }
        }
        if connected {
            if let Err(e) = self.on_dtls_connected(now) {
                self.events
                    .push_back(BundleEvent::TransportFailed(e.to_string()));
            }
        }
        for data in inbound {
            if let Some(sctp) = &mut self.sctp {
                if let Err(e) = sctp.handle_read(&data, now) {
                    trace!("discarded sctp packet: {e}");
                }
            }
        }
    }

    fn on_dtls_connected(&mut self, now: Instant) -> Result<()> {
        self.events.push_back(BundleEvent::DtlsConnected);
        let dtls = self.dtls.as_ref().ok_or(Error::ErrHandshakeInProgress)?;
        let role = self.dtls_role.ok_or(Error::ErrHandshakeInProgress)?;
        match self.kind {
            BundleKind::Media => {
                let keys = dtls.export_srtp_keying_material()?;
                // the DTLS client writes with the client keys
                let (write_key, write_salt, read_key, read_salt) = match role {
                    DtlsRole::Client => (
                        &keys.client_key,
                        &keys.client_salt,
                        &keys.server_key,
                        &keys.server_salt,
                    ),
                    DtlsRole::Server => (
                        &keys.server_key,
                        &keys.server_salt,
                        &keys.client_key,
                        &keys.client_salt,
                    ),
                };
                self.srtp_write = Some(srtp::Context::new(write_key, write_salt)?);
                self.srtp_read = Some(srtp::Context::new(read_key, read_salt)?);
                debug!("{}: srtp contexts installed", self.mid);
            }
            BundleKind::Data => {
                let mut association = Association::new(AssociationConfig {
                    is_client: role == DtlsRole::Client,
                    ..Default::default()
                });
                if role == DtlsRole::Client {
                    association.connect(now)?;
                }
                self.sctp = Some(association);
            }
        }
        Ok(())
    }

    fn pump_sctp(&mut self, now: Instant) {
        let Some(sctp) = &mut self.sctp else {
            return;
        };
        let mut established = false;
        let mut received: Vec<(u16, u32, Bytes)> = vec![];
        while let Some(event) = sctp.poll_event() {
            match event {
                AssociationEvent::Connected => established = true,
                AssociationEvent::DataReceived {
                    stream_id,
                    ppid,
                    data,
                    ..
                } => received.push((stream_id, ppid, data)),
                AssociationEvent::Aborted(reason) => {
                    for channel in &mut self.channels {
                        channel.mark_closed();
                    }
                    self.events.push_back(BundleEvent::TransportFailed(
                        Error::ErrAssociationAborted(reason).to_string(),
                    ));
                }
                AssociationEvent::Closed => {
                    for channel in &mut self.channels {
                        channel.mark_closed();
                    }
                }
            }
        }
        if established {
            self.open_pending_channels(now);
        }
        for (stream_id, ppid, data) in received {
            self.handle_sctp_data(stream_id, ppid, data, now);
        }
        if let (Some(sctp), Some(dtls)) = (&mut self.sctp, &mut self.dtls) {
            while let Some(datagram) = sctp.poll_transmit() {
                if let Err(e) = dtls.write(&datagram, now) {
                    trace!("dropping sctp datagram, dtls not writable: {e}");
                }
            }
        }
    }

    fn open_pending_channels(&mut self, now: Instant) {
        let pending = std::mem::take(&mut self.pending_channels);
        for config in pending {
            let stream_id = self.next_stream_id;
            self.next_stream_id += 2;
            let (channel, open) = DataChannel::dial(config, stream_id);
            if let Err(e) = self.send_dcep(stream_id, &open, now) {
                warn!("failed to open data channel: {e}");
                continue;
            }
            self.channels.push(channel);
        }
    }

    fn handle_sctp_data(&mut self, stream_id: u16, ppid: u32, data: Bytes, now: Instant) {
        if ppid == PPID_DCEP {
            match DataChannelMessage::unmarshal(&data) {
                Ok(DataChannelMessage::Open(open)) => {
                    let (channel, ack) = DataChannel::accept(open, stream_id);
                    let label = channel.label().to_string();
                    if self.send_dcep(stream_id, &ack, now).is_ok() {
                        self.channels.push(channel);
                        self.events
                            .push_back(BundleEvent::DataChannelOpened { stream_id, label });
                    }
                }
                Ok(DataChannelMessage::Ack) => {
                    if let Some(channel) = self
                        .channels
                        .iter_mut()
                        .find(|c| c.stream_id() == stream_id)
                    {
                        if channel.handle_ack().is_ok() {
                            self.events.push_back(BundleEvent::DataChannelOpened {
                                stream_id,
                                label: channel.label().to_string(),
                            });
                        }
                    }
                }
                Err(e) => trace!("discarded malformed dcep message: {e}"),
            }
            return;
        }
        let Some(channel) = self.channels.iter().find(|c| c.stream_id() == stream_id) else {
            trace!("data on unknown stream {stream_id}");
            return;
        };
        if let Some(payload) = channel.parse_inbound(ppid, data) {
            self.events.push_back(BundleEvent::DataChannelMessage {
                label: channel.label().to_string(),
                payload,
            });
        }
    }

    fn send_dcep(&mut self, stream_id: u16, message: &DataChannelMessage, now: Instant) -> Result<()> {
        let sctp = self
            .sctp
            .as_mut()
            .ok_or(Error::ErrAssociationNotEstablished)?;
        let raw = message.marshal()?;
        sctp.write(
            stream_id,
            PPID_DCEP,
            &raw,
            true,
            sctp::ReliabilityPolicy::Reliable,
            now,
        )
    }

    fn handle_srtp_read(&mut self, msg: TaggedBytesMut) {
        let now = msg.now;
        let Some(srtp_read) = &mut self.srtp_read else {
            trace!("srtp packet before keys, dropped");
            return;
        };
        let Some(session) = &mut self.rtp_session else {
            return;
        };
        if rtcp::is_rtcp(&msg.message) {
            match srtp_read.unprotect_rtcp(&msg.message) {
                Ok(plain) => {
                    if let Err(e) = session.handle_rtcp(&plain, now) {
                        trace!("discarded malformed rtcp: {e}");
                    }
                }
                Err(_) => self.auth_failures += 1,
            }
        } else {
            match srtp_read.unprotect_rtp(&msg.message) {
                Ok(plain) => {
                    let mut buf = &plain[..];
                    match RtpPacket::unmarshal(&mut buf) {
                        Ok(packet) => session.handle_rtp(packet, now),
                        Err(e) => trace!("discarded malformed rtp: {e}"),
                    }
                }
                Err(_) => self.auth_failures += 1,
            }
        }
    }

    fn pump_rtp(&mut self, now: Instant) {
        if self.rtp_session.is_none() {
            return;
        }
        let mut retransmits = vec![];
        let mut reports = vec![];
        let mut events = vec![];
        if let Some(session) = &mut self.rtp_session {
            while let Some(packet) = session.poll_transmit() {
                retransmits.push(packet);
            }
            while let Some(report) = session.poll_rtcp_transmit() {
                reports.push(report);
            }
            while let Some(event) = session.poll_event() {
                events.push(event);
            }
        }
        for packet in retransmits {
            let _ = self.send_rtp_packet(&packet, now);
        }
        for report in reports {
            let _ = self.send_rtcp(&report, now);
        }
        for event in events {
            match event {
                SessionEvent::PacketReceived(packet) => {
                    self.events.push_back(BundleEvent::RtpReceived(packet));
                }
                SessionEvent::BandwidthEstimate(bitrate) => {
                    self.events
                        .push_back(BundleEvent::BandwidthEstimate(bitrate));
                }
                SessionEvent::SsrcConflict { new_ssrc, old_ssrc } => {
                    debug!("{}: ssrc conflict, {old_ssrc:08x} -> {new_ssrc:08x}", self.mid);
                    if self.media_ssrc == Some(old_ssrc) {
                        self.media_ssrc = Some(new_ssrc);
                    }
                }
            }
        }
    }

    fn send_rtp_packet(&mut self, packet: &RtpPacket, now: Instant) -> Result<()> {
        let srtp_write = self
            .srtp_write
            .as_mut()
            .ok_or(Error::ErrHandshakeInProgress)?;
        let raw = packet.marshal()?;
        let protected = srtp_write.protect_rtp(&raw)?;
        self.queue_datagram(BytesMut::from(&protected[..]), now);
        Ok(())
    }

    fn send_rtcp(&mut self, report: &[u8], now: Instant) -> Result<()> {
        let srtp_write = self
            .srtp_write
            .as_mut()
            .ok_or(Error::ErrHandshakeInProgress)?;
        let protected = srtp_write.protect_rtcp(report)?;
        self.queue_datagram(BytesMut::from(&protected[..]), now);
        Ok(())
    }

    fn drain_dtls(&mut self) {
        if let Some(dtls) = &mut self.dtls {
            while let Some(transmit) = dtls.poll_transmit() {
                self.transmits.push_back(transmit);
            }
        }
    }

    fn queue_datagram(&mut self, message: BytesMut, now: Instant) {
        let Some(transport) = self.agent.selected_transport() else {
            trace!("{}: no selected pair, datagram dropped", self.mid);
            return;
        };
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport,
            message,
        });
    }
}
