use bytes::Bytes;
use log::{debug, trace};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use datachannel::{DataChannelConfig, DataChannelPayload};
use dtls::{Certificate, DtlsRole};
use ice::{Candidate, CandidateType, ConnectionState, GatheringState};
use sdp::attribute::{
    Attribute, CandidateAttribute, CandidateKind, Direction, SetupRole,
};
use sdp::description::{MediaDescription, MediaKind, SessionDescription};
use shared::error::{Error, Result};
use shared::TaggedBytesMut;

use crate::bundle::{BundleEvent, BundleKind, TransportBundle};
use crate::signaling::{
    check_next_signaling_state, RTCSessionDescription, SdpType, SignalingState, StateChangeOp,
};

/// SCTP port advertised in `a=sctpmap`; the association is tunneled over
/// DTLS so the value is nominal.
const SCTP_PORT: u16 = 5000;
const DATA_CHANNEL_APP: &str = "webrtc-datachannel";

#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    /// DTLS identity; generated when not supplied.
    pub certificate: Option<Certificate>,
    /// Base transport address. Each negotiated media section binds the
    /// next consecutive port so inbound datagrams route by local port.
    pub local_addr: SocketAddr,
}

#[derive(Debug)]
pub enum PeerConnectionEvent {
    SignalingStateChange(SignalingState),
    IceConnectionStateChange(ConnectionState),
    Connected,
    RtpReceived(rtp::Packet),
    BandwidthEstimate(u64),
    DataChannelOpened(String),
    DataChannelMessage {
        label: String,
        payload: DataChannelPayload,
    },
    TransportFailed(String),
}

enum SectionPlan {
    Media {
        kind: MediaKind,
        payload_type: u8,
        encoding: String,
        clock_rate: u32,
    },
    Data,
}

/// The negotiation orchestrator: owns one transport bundle per media
/// section, drives offer/answer through the RFC 8829 signaling state
/// machine and multiplexes events from every layer underneath.
pub struct PeerConnection {
    config: PeerConnectionConfig,
    certificate: Certificate,
    cname: String,

    signaling_state: SignalingState,
    ice_connection_state: ConnectionState,
    local_description: Option<RTCSessionDescription>,
    remote_description: Option<RTCSessionDescription>,

    plans: Vec<SectionPlan>,
    pending_channels: Vec<DataChannelConfig>,
    bundles: Vec<TransportBundle>,
    checks_started: bool,
    announced_connected: bool,
    closed: bool,

    events: VecDeque<PeerConnectionEvent>,
}

impl PeerConnection {
    pub fn new(config: PeerConnectionConfig) -> Result<Self> {
        let certificate = match &config.certificate {
            Some(certificate) => certificate.clone(),
            None => Certificate::generate()?,
        };
        Ok(Self {
            config,
            certificate,
            cname: format!("oxrtc-{:08x}", rand::random::<u32>()),
            signaling_state: SignalingState::Stable,
            ice_connection_state: ConnectionState::New,
            local_description: None,
            remote_description: None,
            plans: Vec::new(),
            pending_channels: Vec::new(),
            bundles: Vec::new(),
            checks_started: false,
            announced_connected: false,
            closed: false,
            events: VecDeque::new(),
        })
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn ice_connection_state(&self) -> ConnectionState {
        self.ice_connection_state
    }

    pub fn ice_gathering_state(&self) -> GatheringState {
        if self.bundles.is_empty() {
            return GatheringState::New;
        }
        if self
            .bundles
            .iter()
            .all(|b| b.agent.gathering_state() == GatheringState::Complete)
        {
            GatheringState::Complete
        } else {
            GatheringState::Gathering
        }
    }

    /// True once every live section's DTLS handshake has completed.
    pub fn is_connected(&self) -> bool {
        let mut any = false;
        for bundle in self.bundles.iter().filter(|b| !b.rejected) {
            if !bundle.is_connected() {
                return false;
            }
            any = true;
        }
        any
    }

    pub fn local_description(&self) -> Option<&RTCSessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&RTCSessionDescription> {
        self.remote_description.as_ref()
    }

    /// Declares an audio or video section for the next offer.
    pub fn add_media_section(
        &mut self,
        kind: MediaKind,
        payload_type: u8,
        encoding: &str,
        clock_rate: u32,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if kind == MediaKind::Application {
            return Err(Error::Other("use create_data_channel for data".to_string()));
        }
        self.plans.push(SectionPlan::Media {
            kind,
            payload_type,
            encoding: encoding.to_string(),
            clock_rate,
        });
        Ok(())
    }

    /// Declares a data channel. All channels share one application
    /// section; the channel itself opens once the association is up.
    pub fn create_data_channel(&mut self, config: DataChannelConfig) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if !self.plans.iter().any(|p| matches!(p, SectionPlan::Data)) {
            self.plans.push(SectionPlan::Data);
        }
        if let Some(bundle) = self
            .bundles
            .iter_mut()
            .find(|b| b.kind == BundleKind::Data)
        {
            bundle.queue_channel(config);
        } else {
            self.pending_channels.push(config);
        }
        Ok(())
    }

    pub fn create_offer(&mut self) -> Result<RTCSessionDescription> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if self.plans.is_empty() {
            return Err(Error::ErrNothingToNegotiate);
        }
        self.ensure_bundles_from_plans(true)?;
        let sdp = self.build_description(SetupRole::Actpass).to_string();
        Ok(RTCSessionDescription::offer(sdp))
    }

    pub fn create_answer(&mut self) -> Result<RTCSessionDescription> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if self.remote_description.is_none() {
            return Err(Error::ErrNoRemoteDescription);
        }
        if self.bundles.is_empty() {
            return Err(Error::ErrNothingToNegotiate);
        }
        let sdp = self.build_description(SetupRole::Active).to_string();
        Ok(RTCSessionDescription::answer(sdp))
    }

    pub fn set_local_description(
        &mut self,
        description: RTCSessionDescription,
        now: Instant,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let next = check_next_signaling_state(
            self.signaling_state,
            StateChangeOp::SetLocal,
            description.sdp_type,
        )?;
        if description.sdp_type == SdpType::Rollback {
            self.local_description = None;
        } else {
            self.local_description = Some(description);
        }
        self.transition_signaling(next);
        self.maybe_start_transports(now)?;
        Ok(())
    }

    pub fn set_remote_description(
        &mut self,
        description: RTCSessionDescription,
        now: Instant,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let next = check_next_signaling_state(
            self.signaling_state,
            StateChangeOp::SetRemote,
            description.sdp_type,
        )?;
        if description.sdp_type == SdpType::Rollback {
            self.remote_description = None;
            self.transition_signaling(next);
            return Ok(());
        }
        let parsed = description.parsed()?;
        match description.sdp_type {
            SdpType::Offer => self.apply_remote_offer(&parsed, now)?,
            SdpType::Answer | SdpType::Pranswer => self.apply_remote_answer(&parsed, now)?,
            SdpType::Rollback => unreachable!(),
        }
        self.remote_description = Some(description);
        self.transition_signaling(next);
        self.maybe_start_transports(now)?;
        Ok(())
    }

    /// Sends one media frame on the section identified by its mid.
    pub fn write_rtp(
        &mut self,
        mid: &str,
        timestamp: u32,
        marker: bool,
        payload: Bytes,
        now: Instant,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let bundle = self
            .bundles
            .iter_mut()
            .find(|b| b.mid == mid && b.kind == BundleKind::Media)
            .ok_or(Error::ErrStreamNotExisted)?;
        bundle.write_rtp(timestamp, marker, payload, now)
    }

    /// Sends one message on the data channel with the given label.
    pub fn send(&mut self, label: &str, payload: DataChannelPayload, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let bundle = self
            .bundles
            .iter_mut()
            .find(|b| b.kind == BundleKind::Data)
            .ok_or(Error::ErrStreamNotExisted)?;
        bundle.channel_send(label, &payload, now)
    }

    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let local = msg.transport.local_addr;
        let Some(bundle) = self.bundles.iter_mut().find(|b| b.local_addr == local) else {
            trace!("datagram for unknown local address {local}");
            return Ok(());
        };
        bundle.handle_read(msg)?;
        self.collect();
        Ok(())
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        for bundle in &mut self.bundles {
            bundle.handle_timeout(now);
        }
        self.collect();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.bundles
            .iter()
            .filter_map(|b| b.poll_timeout())
            .min()
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        for bundle in &mut self.bundles {
            if let Some(transmit) = bundle.poll_transmit() {
                return Some(transmit);
            }
        }
        None
    }

    pub fn poll_event(&mut self) -> Option<PeerConnectionEvent> {
        self.events.pop_front()
    }

    pub fn close(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        for bundle in &mut self.bundles {
            bundle.close(now);
        }
        self.closed = true;
        self.transition_signaling(SignalingState::Closed);
    }

    fn transition_signaling(&mut self, next: SignalingState) {
        if self.signaling_state != next {
            self.signaling_state = next;
            self.events
                .push_back(PeerConnectionEvent::SignalingStateChange(next));
        }
    }

    /// Address of the section's transport. The index offset is bounded
    /// by the port range; offers with too many sections for the base
    /// port are rejected rather than wrapped onto colliding ports.
    fn section_addr(&self, index: usize) -> Result<SocketAddr> {
        let port = u16::try_from(index)
            .ok()
            .and_then(|offset| self.config.local_addr.port().checked_add(offset))
            .ok_or_else(|| {
                Error::Other(format!(
                    "media section {index} does not fit the local port range starting at {}",
                    self.config.local_addr.port()
                ))
            })?;
        Ok(SocketAddr::new(self.config.local_addr.ip(), port))
    }

    fn ensure_bundles_from_plans(&mut self, is_controlling: bool) -> Result<()> {
        if !self.bundles.is_empty() {
            return Ok(());
        }
        for (index, plan) in self.plans.iter().enumerate() {
            let mid = index.to_string();
            let addr = self.section_addr(index)?;
            let bundle = match plan {
                SectionPlan::Media {
                    kind,
                    payload_type,
                    clock_rate,
                    ..
                } => {
                    let bundle = TransportBundle::new_media(
                        mid,
                        addr,
                        is_controlling,
                        self.certificate.clone(),
                        *payload_type,
                        *clock_rate,
                        self.cname.clone(),
                    )?;
                    debug!("media section {kind} ssrc {:?}", bundle.media_ssrc);
                    bundle
                }
                SectionPlan::Data => {
                    let mut bundle = TransportBundle::new_data(
                        mid,
                        addr,
                        is_controlling,
                        self.certificate.clone(),
                    )?;
                    for config in self.pending_channels.drain(..) {
                        bundle.queue_channel(config);
                    }
                    bundle
                }
            };
            self.bundles.push(bundle);
        }
        Ok(())
    }

    /// Builds the answerer's bundles directly from the offered sections,
    /// then applies the remote half to each.
    fn apply_remote_offer(&mut self, parsed: &SessionDescription, now: Instant) -> Result<()> {
        if self.bundles.is_empty() {
            // sections mirror the offer, local declarations notwithstanding
            self.plans.clear();
            for (index, media) in parsed.media.iter().enumerate() {
                let mid = index.to_string();
                let addr = self.section_addr(index)?;
                let bundle = match media.kind {
                    MediaKind::Audio | MediaKind::Video => {
                        let rtpmap = media.rtpmaps().next().map(|(pt, enc)| (pt, enc.to_string()));
                        let (payload_type, encoding) = match rtpmap {
                            Some(map) => map,
                            // rejected sections keep their slot, codec is moot
                            None if media.is_rejected() => (0, "PCMU/8000".to_string()),
                            None => {
                                return Err(Error::Other(
                                    "offer media section without rtpmap".to_string(),
                                ))
                            }
                        };
                        let clock_rate = parse_clock_rate(&encoding)?;
                        self.plans.push(SectionPlan::Media {
                            kind: media.kind,
                            payload_type,
                            encoding: encoding.clone(),
                            clock_rate,
                        });
                        TransportBundle::new_media(
                            mid,
                            addr,
                            false,
                            self.certificate.clone(),
                            payload_type,
                            clock_rate,
                            self.cname.clone(),
                        )?
                    }
                    MediaKind::Application => {
                        self.plans.push(SectionPlan::Data);
                        let mut bundle = TransportBundle::new_data(
                            mid,
                            addr,
                            false,
                            self.certificate.clone(),
                        )?;
                        for config in self.pending_channels.drain(..) {
                            bundle.queue_channel(config);
                        }
                        bundle
                    }
                };
                self.bundles.push(bundle);
            }
        }
        self.apply_remote_sections(parsed, true, now)
    }

    fn apply_remote_answer(&mut self, parsed: &SessionDescription, now: Instant) -> Result<()> {
        self.apply_remote_sections(parsed, false, now)
    }

    fn apply_remote_sections(
        &mut self,
        parsed: &SessionDescription,
        remote_is_offer: bool,
        now: Instant,
    ) -> Result<()> {
        if parsed.media.len() != self.bundles.len() {
            return Err(Error::Other(format!(
                "session description has {} media sections, expected {}",
                parsed.media.len(),
                self.bundles.len()
            )));
        }
        for (bundle, media) in self.bundles.iter_mut().zip(parsed.media.iter()) {
            if media.is_rejected() || bundle.rejected {
                if !bundle.rejected {
                    bundle.rejected = true;
                    bundle.close(now);
                }
                continue;
            }
            let ufrag = media
                .ice_ufrag()
                .ok_or(Error::ErrSessionDescriptionMissingIceUfrag)?
                .to_string();
            let pwd = media
                .ice_pwd()
                .ok_or(Error::ErrSessionDescriptionMissingIcePwd)?
                .to_string();
            let (_, fingerprint) = parsed
                .fingerprint_for(media)
                .ok_or(Error::ErrSessionDescriptionNoFingerprint)?;
            let fingerprint = fingerprint.to_string();
            let role = local_dtls_role(media.setup(), remote_is_offer)?;
            let candidates = media
                .candidates()
                .filter_map(candidate_from_attribute)
                .collect();
            bundle.set_remote(ufrag, pwd, fingerprint, role, candidates)?;
        }
        Ok(())
    }

    /// Connectivity checks begin once both descriptions are applied and
    /// negotiation has returned to stable.
    fn maybe_start_transports(&mut self, now: Instant) -> Result<()> {
        if self.checks_started
            || self.signaling_state != SignalingState::Stable
            || self.local_description.is_none()
            || self.remote_description.is_none()
        {
            return Ok(());
        }
        self.checks_started = true;
        for bundle in &mut self.bundles {
            bundle.start(now)?;
        }
        self.collect();
        Ok(())
    }

    fn collect(&mut self) {
        for i in 0..self.bundles.len() {
            while let Some(event) = self.bundles[i].poll_event() {
                match event {
                    BundleEvent::IceConnectionStateChange(_) => {}
                    BundleEvent::DtlsConnected => {}
                    BundleEvent::RtpReceived(packet) => {
                        self.events.push_back(PeerConnectionEvent::RtpReceived(packet));
                    }
                    BundleEvent::BandwidthEstimate(bitrate) => {
                        self.events
                            .push_back(PeerConnectionEvent::BandwidthEstimate(bitrate));
                    }
                    BundleEvent::DataChannelOpened { label, .. } => {
                        self.events
                            .push_back(PeerConnectionEvent::DataChannelOpened(label));
                    }
                    BundleEvent::DataChannelMessage { label, payload } => {
                        self.events
                            .push_back(PeerConnectionEvent::DataChannelMessage { label, payload });
                    }
                    BundleEvent::TransportFailed(reason) => {
                        self.events
                            .push_back(PeerConnectionEvent::TransportFailed(reason));
                    }
                }
            }
        }
        let rollup = self.rollup_ice_state();
        if rollup != self.ice_connection_state {
            self.ice_connection_state = rollup;
            self.events
                .push_back(PeerConnectionEvent::IceConnectionStateChange(rollup));
        }
        if !self.announced_connected && self.is_connected() {
            self.announced_connected = true;
            self.events.push_back(PeerConnectionEvent::Connected);
        }
    }

    /// Worst-of aggregation across sections: any failure wins, then any
    /// disconnect, then the least progressed in-flight state.
    fn rollup_ice_state(&self) -> ConnectionState {
        if self.bundles.is_empty() {
            return ConnectionState::New;
        }
        let states: Vec<ConnectionState> = self
            .bundles
            .iter()
            .filter(|b| !b.rejected)
            .map(|b| b.agent.connection_state())
            .collect();
        if states.is_empty() {
            return ConnectionState::New;
        }
        if states.iter().any(|s| *s == ConnectionState::Failed) {
            ConnectionState::Failed
        } else if states.iter().any(|s| *s == ConnectionState::Disconnected) {
            ConnectionState::Disconnected
        } else if states.iter().any(|s| *s == ConnectionState::Checking) {
            ConnectionState::Checking
        } else if states.iter().all(|s| *s == ConnectionState::Completed) {
            ConnectionState::Completed
        } else if states
            .iter()
            .all(|s| matches!(s, ConnectionState::Connected | ConnectionState::Completed))
        {
            ConnectionState::Connected
        } else if states.iter().any(|s| *s == ConnectionState::Closed) {
            ConnectionState::Closed
        } else {
            ConnectionState::New
        }
    }

    fn build_description(&self, setup: SetupRole) -> SessionDescription {
        let mut session = SessionDescription::default();
        for (index, bundle) in self.bundles.iter().enumerate() {
            if bundle.rejected {
                let mut media = match self.plans.get(index) {
                    Some(SectionPlan::Media {
                        kind, payload_type, ..
                    }) => MediaDescription::new(
                        *kind,
                        0,
                        "UDP/TLS/RTP/SAVPF",
                        vec![payload_type.to_string()],
                    ),
                    _ => MediaDescription::new(
                        MediaKind::Application,
                        0,
                        "UDP/DTLS/SCTP",
                        vec![DATA_CHANNEL_APP.to_string()],
                    ),
                };
                media.connection = Some("IN IP4 0.0.0.0".to_string());
                media.attributes.push(Attribute::Mid(bundle.mid.clone()));
                session.media.push(media);
                continue;
            }
            let (ufrag, pwd) = bundle.agent.local_credentials();
            let mut media = match bundle.kind {
                BundleKind::Media => {
                    let Some(SectionPlan::Media {
                        kind,
                        payload_type,
                        encoding,
                        ..
                    }) = self.plans.get(index)
                    else {
                        continue;
                    };
                    let (kind, payload_type, encoding) = (*kind, *payload_type, encoding.clone());
                    let mut media = MediaDescription::new(
                        kind,
                        9,
                        "UDP/TLS/RTP/SAVPF",
                        vec![payload_type.to_string()],
                    );
                    media.attributes.push(Attribute::Rtpmap {
                        payload_type,
                        encoding,
                    });
                    media.attributes.push(Attribute::RtcpMux);
                    media
                        .attributes
                        .push(Attribute::Direction(Direction::Sendrecv));
                    if let Some(ssrc) = bundle.media_ssrc {
                        media.attributes.push(Attribute::Ssrc {
                            ssrc,
                            attribute: format!("cname:{}", self.cname),
                        });
                    }
                    media
                }
                BundleKind::Data => {
                    let mut media = MediaDescription::new(
                        MediaKind::Application,
                        9,
                        "UDP/DTLS/SCTP",
                        vec![DATA_CHANNEL_APP.to_string()],
                    );
                    media.attributes.push(Attribute::Sctpmap {
                        port: SCTP_PORT,
                        app: DATA_CHANNEL_APP.to_string(),
                    });
                    media
                }
            };
            media.connection = Some("IN IP4 0.0.0.0".to_string());
            media.attributes.push(Attribute::Mid(bundle.mid.clone()));
            media.attributes.push(Attribute::IceUfrag(ufrag.to_string()));
            media.attributes.push(Attribute::IcePwd(pwd.to_string()));
            media.attributes.push(Attribute::Fingerprint {
                algorithm: "sha-256".to_string(),
                value: bundle.local_fingerprint().to_string(),
            });
            media.attributes.push(Attribute::Setup(setup));
            for candidate in bundle.agent.local_candidates() {
                media
                    .attributes
                    .push(Attribute::Candidate(attribute_from_candidate(candidate)));
            }
            media.attributes.push(Attribute::EndOfCandidates);
            session.media.push(media);
        }
        session
    }
}

fn parse_clock_rate(encoding: &str) -> Result<u32> {
    encoding
        .split('/')
        .nth(1)
        .and_then(|rate| rate.parse().ok())
        .ok_or_else(|| Error::Other(format!("rtpmap encoding {encoding} has no clock rate")))
}

/// Maps the remote `a=setup` value to our DTLS role.
fn local_dtls_role(remote_setup: Option<SetupRole>, remote_is_offer: bool) -> Result<DtlsRole> {
    match (remote_setup, remote_is_offer) {
        // we answer an actpass offer with setup:active
        (Some(SetupRole::Actpass), true) | (None, true) => Ok(DtlsRole::Client),
        (Some(SetupRole::Active), _) => Ok(DtlsRole::Server),
        (Some(SetupRole::Passive), _) => Ok(DtlsRole::Client),
        (Some(SetupRole::Actpass), false) => Err(Error::Other(
            "answer must not use setup:actpass".to_string(),
        )),
        (None, false) => Err(Error::Other("answer is missing a=setup".to_string())),
    }
}

fn candidate_from_attribute(attr: &CandidateAttribute) -> Option<Candidate> {
    let address: SocketAddr = format!("{}:{}", attr.address, attr.port).parse().ok()?;
    let candidate_type = match attr.kind {
        CandidateKind::Host => CandidateType::Host,
        CandidateKind::ServerReflexive => CandidateType::ServerReflexive,
        CandidateKind::PeerReflexive => CandidateType::PeerReflexive,
        CandidateKind::Relay => CandidateType::Relay,
    };
    Some(Candidate {
        foundation: attr.foundation.clone(),
        component: attr.component,
        transport: attr.transport.to_lowercase(),
        priority: attr.priority,
        address,
        candidate_type,
        related_address: None,
    })
}

fn attribute_from_candidate(candidate: &Candidate) -> CandidateAttribute {
    let kind = match candidate.candidate_type {
        CandidateType::Host => CandidateKind::Host,
        CandidateType::ServerReflexive => CandidateKind::ServerReflexive,
        CandidateType::PeerReflexive => CandidateKind::PeerReflexive,
        CandidateType::Relay => CandidateKind::Relay,
    };
    CandidateAttribute {
        foundation: candidate.foundation.clone(),
        component: candidate.component,
        transport: candidate.transport.clone(),
        priority: candidate.priority,
        address: candidate.address.ip().to_string(),
        port: candidate.address.port(),
        kind,
        related_address: candidate.related_address.map(|a| a.ip().to_string()),
        related_port: candidate.related_address.map(|a| a.port()),
        extensions: Vec::new(),
    }
}
