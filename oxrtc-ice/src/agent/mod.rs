use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext};
use stun::message::{Message, MessageClass, TransactionId};

use crate::candidate::candidate_pair::{CandidatePair, CandidatePairState};
use crate::candidate::{Candidate, CandidateType};
use crate::state::{ConnectionState, GatheringState};
use crate::{generate_pwd, generate_ufrag};

const ERROR_ROLE_CONFLICT: u16 = 487;

/// An outbound Binding request awaiting its response.
#[derive(Debug, Clone)]
pub(crate) struct BindingRequest {
    pub(crate) timestamp: Instant,
    pub(crate) transaction_id: TransactionId,
    pub(crate) destination: SocketAddr,
    pub(crate) is_use_candidate: bool,
    /// (local, remote) candidate indices of the pair being checked.
    pub(crate) pair: (usize, usize),
}

#[derive(Default, Debug, Clone)]
pub(crate) struct UfragPwd {
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,
}

/// Collects the tunable parameters of an [Agent].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub local_ufrag: String,
    pub local_pwd: String,
    pub is_controlling: bool,

    /// How long connectivity checks can fail before the agent goes to
    /// [ConnectionState::Disconnected].
    pub disconnected_timeout: Duration,
    /// How long connectivity checks can fail before the agent goes to
    /// [ConnectionState::Failed].
    pub failed_timeout: Duration,
    /// How often keepalives are sent on the selected pair. Zero disables
    /// keepalives.
    pub keepalive_interval: Duration,
    /// Pacing interval for the check list.
    pub check_interval: Duration,
    /// Initial retransmission timeout for a Binding request; doubles on
    /// each retransmission.
    pub initial_rto: Duration,
    /// How often a Binding request is sent for one pair before the pair
    /// is marked failed.
    pub max_binding_requests: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_ufrag: generate_ufrag(),
            local_pwd: generate_pwd(),
            is_controlling: false,
            disconnected_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(2),
            check_interval: Duration::from_millis(200),
            initial_rto: Duration::from_millis(500),
            max_binding_requests: 7,
        }
    }
}

/// State transitions and path changes surfaced to the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    ConnectionStateChange(ConnectionState),
    GatheringStateChange(GatheringState),
    /// A nominated pair became the selected path; carries the pair's
    /// local and remote transport addresses.
    SelectedPairChange(SocketAddr, SocketAddr),
}

/// Sans-I/O ICE agent. All methods that depend on time take an explicit
/// `Instant`; nothing here reads the clock or touches a socket.
pub struct Agent {
    pub(crate) tie_breaker: u64,
    pub(crate) is_controlling: bool,

    pub(crate) connection_state: ConnectionState,
    pub(crate) gathering_state: GatheringState,

    pub(crate) ufrag_pwd: UfragPwd,

    pub(crate) local_candidates: Vec<Candidate>,
    pub(crate) remote_candidates: Vec<Candidate>,
    pub(crate) candidate_pairs: Vec<CandidatePair>,
    pub(crate) selected_pair: Option<usize>,

    pub(crate) pending_binding_requests: Vec<BindingRequest>,

    pub(crate) checks_started: bool,
    pub(crate) last_checked: Option<Instant>,
    /// Last inbound authenticated STUN on any pair.
    pub(crate) last_received: Option<Instant>,
    /// Last keepalive or check sent on the selected pair.
    pub(crate) last_sent: Option<Instant>,

    pub(crate) disconnected_timeout: Duration,
    pub(crate) failed_timeout: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) check_interval: Duration,
    pub(crate) initial_rto: Duration,
    pub(crate) max_binding_requests: u16,

    pub(crate) transmits: VecDeque<TaggedBytesMut>,
    pub(crate) events: VecDeque<IceEvent>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        // RFC 8445 section 5.3: at least 24 bits in the ufrag, 128 in the pwd
        if config.local_ufrag.len() * 8 < 24 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if config.local_pwd.len() * 8 < 128 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }

        Ok(Self {
            tie_breaker: rand::random::<u64>(),
            is_controlling: config.is_controlling,

            connection_state: ConnectionState::New,
            gathering_state: GatheringState::New,

            ufrag_pwd: UfragPwd {
                local_ufrag: config.local_ufrag,
                local_pwd: config.local_pwd,
                remote_ufrag: String::new(),
                remote_pwd: String::new(),
            },

            local_candidates: vec![],
            remote_candidates: vec![],
            candidate_pairs: vec![],
            selected_pair: None,

            pending_binding_requests: vec![],

            checks_started: false,
            last_checked: None,
            last_received: None,
            last_sent: None,

            disconnected_timeout: config.disconnected_timeout,
            failed_timeout: config.failed_timeout,
            keepalive_interval: config.keepalive_interval,
            check_interval: config.check_interval,
            initial_rto: config.initial_rto,
            max_binding_requests: config.max_binding_requests,

            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn local_credentials(&self) -> (&str, &str) {
        (&self.ufrag_pwd.local_ufrag, &self.ufrag_pwd.local_pwd)
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.gathering_state
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    /// The (local, remote) candidates of the selected pair, once one has
    /// been nominated.
    pub fn selected_candidate_pair(&self) -> Option<(&Candidate, &Candidate)> {
        let index = self.selected_pair?;
        let pair = &self.candidate_pairs[index];
        Some((
            &self.local_candidates[pair.local_index],
            &self.remote_candidates[pair.remote_index],
        ))
    }

    /// Transport context of the selected pair, for tagging non-STUN sends.
    pub fn selected_transport(&self) -> Option<TransportContext> {
        self.selected_candidate_pair()
            .map(|(local, remote)| TransportContext {
                local_addr: local.address,
                peer_addr: remote.address,
                transport_protocol: shared::TransportProtocol::UDP,
            })
    }

    pub fn set_remote_credentials(&mut self, remote_ufrag: String, remote_pwd: String) -> Result<()> {
        if remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }
        if remote_pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }
        self.ufrag_pwd.remote_ufrag = remote_ufrag;
        self.ufrag_pwd.remote_pwd = remote_pwd;
        Ok(())
    }

    /// Registers a local candidate. Redundant candidates are dropped.
    pub fn add_local_candidate(&mut self, candidate: Candidate) -> Result<()> {
        if self.connection_state == ConnectionState::Closed {
            return Err(Error::ErrAgentClosed);
        }
        if self
            .local_candidates
            .iter()
            .any(|c| c.equal(&candidate))
        {
            return Ok(());
        }
        if self.gathering_state == GatheringState::New {
            self.set_gathering_state(GatheringState::Gathering);
        }
        debug!("add local candidate {candidate}");
        self.local_candidates.push(candidate);
        let local_index = self.local_candidates.len() - 1;
        for remote_index in 0..self.remote_candidates.len() {
            self.add_pair(local_index, remote_index);
        }
        self.sort_candidate_pairs();
        Ok(())
    }

    /// Marks local gathering as complete.
    pub fn end_of_candidates(&mut self) {
        if self.gathering_state != GatheringState::Complete {
            self.set_gathering_state(GatheringState::Complete);
        }
    }

    /// Registers a candidate learned from the remote description or from
    /// trickle signaling.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) -> Result<()> {
        if self.connection_state == ConnectionState::Closed {
            return Err(Error::ErrAgentClosed);
        }
        if self
            .remote_candidates
            .iter()
            .any(|c| c.equal(&candidate))
        {
            return Ok(());
        }
        debug!("add remote candidate {candidate}");
        self.remote_candidates.push(candidate);
        let remote_index = self.remote_candidates.len() - 1;
        for local_index in 0..self.local_candidates.len() {
            self.add_pair(local_index, remote_index);
        }
        self.sort_candidate_pairs();
        Ok(())
    }

    /// Starts the check list. Requires remote credentials and at least one
    /// pair to do anything useful; more pairs can still trickle in later.
    pub fn start_connectivity_checks(&mut self, now: Instant) -> Result<()> {
        if self.connection_state == ConnectionState::Closed {
            return Err(Error::ErrAgentClosed);
        }
        if self.ufrag_pwd.remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }
        if self.ufrag_pwd.remote_pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }
        self.checks_started = true;
        self.set_connection_state(ConnectionState::Checking);
        self.contact(now);
        Ok(())
    }

    /// Handles an inbound datagram that demuxed as STUN.
    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.connection_state == ConnectionState::Closed {
            return Err(Error::ErrAgentClosed);
        }
        let stun_msg = Message::decode(&msg.message)?;
        let local_addr = msg.transport.local_addr;
        let remote_addr = msg.transport.peer_addr;

        match stun_msg.typ.class {
            MessageClass::Request => {
                self.handle_binding_request(stun_msg, local_addr, remote_addr, msg.now)
            }
            MessageClass::SuccessResponse => {
                self.handle_binding_success(stun_msg, remote_addr, msg.now)
            }
            MessageClass::ErrorResponse => {
                self.handle_binding_error(stun_msg, remote_addr);
                Ok(())
            }
            MessageClass::Indication => {
                // keepalive from the peer
                self.last_received = Some(msg.now);
                Ok(())
            }
        }
    }

    /// Drives retransmissions, pacing, keepalives and liveness timeouts.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.connection_state == ConnectionState::Closed || !self.checks_started {
            return;
        }
        self.contact(now);
    }

    /// Next instant at which [Agent::handle_timeout] wants to run.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.connection_state == ConnectionState::Closed || !self.checks_started {
            return None;
        }
        let mut earliest: Option<Instant> = None;
        let mut consider = |t: Instant| {
            earliest = Some(match earliest {
                Some(e) if e <= t => e,
                _ => t,
            });
        };

        if let Some(last) = self.last_checked {
            consider(last + self.check_interval);
        }
        for request in &self.pending_binding_requests {
            let attempt = self.candidate_pairs
                .iter()
                .find(|p| (p.local_index, p.remote_index) == request.pair)
                .map(|p| p.binding_request_count.saturating_sub(1))
                .unwrap_or(0);
            consider(request.timestamp + self.rto(attempt));
        }
        if self.selected_pair.is_some() && !self.keepalive_interval.is_zero() {
            if let Some(last) = self.last_sent {
                consider(last + self.keepalive_interval);
            }
        }
        if let Some(last) = self.last_received {
            consider(last + self.disconnected_timeout);
            consider(last + self.failed_timeout);
        }
        earliest
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    pub fn close(&mut self) {
        if self.connection_state != ConnectionState::Closed {
            self.set_connection_state(ConnectionState::Closed);
        }
        self.transmits.clear();
        self.pending_binding_requests.clear();
        self.selected_pair = None;
    }

    fn add_pair(&mut self, local_index: usize, remote_index: usize) {
        let local = &self.local_candidates[local_index];
        let remote = &self.remote_candidates[remote_index];
        if local.address.is_ipv4() != remote.address.is_ipv4() {
            return;
        }
        self.candidate_pairs.push(CandidatePair::new(
            local_index,
            remote_index,
            local.priority,
            remote.priority,
            self.is_controlling,
        ));
    }

    fn sort_candidate_pairs(&mut self) {
        let selected = self
            .selected_pair
            .map(|i| self.candidate_pairs[i]);
        self.candidate_pairs
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
        if let Some(selected) = selected {
            self.selected_pair = self.candidate_pairs.iter().position(|p| *p == selected);
        }
    }

    fn rto(&self, attempt: u16) -> Duration {
        self.initial_rto * 2u32.saturating_pow(u32::from(attempt.min(6)))
    }

    /// One pass over the check list, the sans-IO analogue of a ticker.
    fn contact(&mut self, now: Instant) {
        self.last_checked = Some(now);

        self.expire_pending_requests(now);

        // new checks, highest pair priority first
        for index in 0..self.candidate_pairs.len() {
            if self.candidate_pairs[index].state == CandidatePairState::Waiting {
                self.send_binding_request(index, now);
            }
        }

        self.update_selected_pair();
        self.update_connection_state(now);
        self.send_keepalive(now);
    }

    fn expire_pending_requests(&mut self, now: Instant) {
        let mut expired = vec![];
        let mut pending = std::mem::take(&mut self.pending_binding_requests);
        pending.retain(|request| {
            let attempt = self
                .candidate_pairs
                .iter()
                .find(|p| (p.local_index, p.remote_index) == request.pair)
                .map(|p| p.binding_request_count.saturating_sub(1))
                .unwrap_or(0);
            if now >= request.timestamp + self.initial_rto * 2u32.saturating_pow(u32::from(attempt.min(6))) {
                expired.push(request.pair);
                false
            } else {
                true
            }
        });
        self.pending_binding_requests = pending;

        for pair_key in expired {
            let Some(index) = self
                .candidate_pairs
                .iter()
                .position(|p| (p.local_index, p.remote_index) == pair_key)
            else {
                continue;
            };
            if self.candidate_pairs[index].state != CandidatePairState::InProgress {
                continue;
            }
            if self.candidate_pairs[index].binding_request_count >= self.max_binding_requests {
                debug!("pair {:?} failed after max binding requests", self.candidate_pairs[index]);
                self.candidate_pairs[index].state = CandidatePairState::Failed;
            } else {
                self.send_binding_request(index, now);
            }
        }
    }

    /// Sends a connectivity check on a pair. In aggressive nomination every
    /// check from the controlling agent carries USE-CANDIDATE.
    fn send_binding_request(&mut self, pair_index: usize, now: Instant) {
        let use_candidate = self.is_controlling;
        let (local_index, remote_index) = {
            let pair = &self.candidate_pairs[pair_index];
            (pair.local_index, pair.remote_index)
        };
        let local = self.local_candidates[local_index].clone();
        let remote = self.remote_candidates[remote_index].clone();

        let username = format!(
            "{}:{}",
            self.ufrag_pwd.remote_ufrag, self.ufrag_pwd.local_ufrag
        );
        let mut request = Message::binding_request();
        request.add_username(&username);
        if self.is_controlling {
            request.add_ice_controlling(self.tie_breaker);
            if use_candidate {
                request.add_use_candidate();
            }
        } else {
            request.add_ice_controlled(self.tie_breaker);
        }
        request.add_priority(crate::candidate::compute_priority(
            CandidateType::PeerReflexive,
            65535,
            local.component,
        ));
        request.add_message_integrity(self.ufrag_pwd.remote_pwd.as_bytes());
        request.add_fingerprint();

        trace!("ping {} -> {}", local.address, remote.address);
        self.pending_binding_requests.push(BindingRequest {
            timestamp: now,
            transaction_id: request.transaction_id,
            destination: remote.address,
            is_use_candidate: use_candidate,
            pair: (local_index, remote_index),
        });
        let pair = &mut self.candidate_pairs[pair_index];
        pair.binding_request_count += 1;
        if pair.state == CandidatePairState::Waiting {
            pair.state = CandidatePairState::InProgress;
        }

        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: local.address,
                peer_addr: remote.address,
                transport_protocol: shared::TransportProtocol::UDP,
            },
            message: request.encode(),
        });
        self.last_sent = Some(now);
    }

    fn handle_binding_request(
        &mut self,
        request: Message,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        if self.ufrag_pwd.remote_ufrag.is_empty() {
            trace!("dropping early binding request from {remote_addr}, no remote credentials yet");
            return Ok(());
        }

        let expected_username = format!(
            "{}:{}",
            self.ufrag_pwd.local_ufrag, self.ufrag_pwd.remote_ufrag
        );
        match request.username() {
            Some(u) if u == expected_username => {}
            _ => return Err(Error::ErrMismatchUsername),
        }
        request.verify_integrity(self.ufrag_pwd.local_pwd.as_bytes())?;

        // RFC 8445 section 7.3.1.1 role conflict resolution
        if self.is_controlling {
            if let Some(their_tie_breaker) = request.ice_controlling() {
                if self.tie_breaker >= their_tie_breaker {
                    let mut response = Message::binding_error(request.transaction_id);
                    response.add_error_code(ERROR_ROLE_CONFLICT, "Role Conflict");
                    response.add_message_integrity(self.ufrag_pwd.local_pwd.as_bytes());
                    response.add_fingerprint();
                    self.transmits.push_back(TaggedBytesMut {
                        now,
                        transport: TransportContext {
                            local_addr,
                            peer_addr: remote_addr,
                            transport_protocol: shared::TransportProtocol::UDP,
                        },
                        message: response.encode(),
                    });
                    return Ok(());
                }
                warn!("role conflict, switching to controlled");
                self.switch_role(false);
            }
        } else if request.ice_controlled().is_some() {
            warn!("role conflict, switching to controlling");
            self.switch_role(true);
        }

        self.last_received = Some(now);

        let remote_index = match self
            .remote_candidates
            .iter()
            .position(|c| c.address == remote_addr)
        {
            Some(index) => index,
            None => {
                // RFC 8445 section 7.3.1.3, learn a peer-reflexive candidate
                let priority = request.priority().unwrap_or(0);
                let component = self
                    .local_candidates
                    .iter()
                    .find(|c| c.address == local_addr)
                    .map(|c| c.component)
                    .unwrap_or(1);
                debug!("learned prflx candidate {remote_addr}");
                self.add_remote_candidate(Candidate::peer_reflexive(
                    remote_addr,
                    component,
                    priority,
                ))?;
                self.remote_candidates
                    .iter()
                    .position(|c| c.address == remote_addr)
                    .ok_or(Error::ErrNoCandidatePairs)?
            }
        };

        let pair_index = self.find_or_insert_pair(local_addr, remote_index)?;

        // triggered check
        if self.checks_started
            && self.candidate_pairs[pair_index].state == CandidatePairState::Waiting
        {
            self.send_binding_request(pair_index, now);
        }

        if request.has_use_candidate() {
            self.candidate_pairs[pair_index].nominated = true;
        }

        let mut response = Message::binding_success(request.transaction_id);
        response.add_xor_mapped_address(remote_addr);
        response.add_message_integrity(self.ufrag_pwd.local_pwd.as_bytes());
        response.add_fingerprint();
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr,
                peer_addr: remote_addr,
                transport_protocol: shared::TransportProtocol::UDP,
            },
            message: response.encode(),
        });

        self.update_selected_pair();
        self.update_connection_state(now);
        Ok(())
    }

    fn handle_binding_success(
        &mut self,
        response: Message,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        let Some(position) = self
            .pending_binding_requests
            .iter()
            .position(|r| r.transaction_id == response.transaction_id)
        else {
            trace!("response with unknown transaction id from {remote_addr}");
            return Err(Error::ErrUnexpectedStunMessage);
        };
        let request = self.pending_binding_requests.remove(position);

        // RFC 8445 section 7.2.5.2.1, the response must come from the
        // address the request went to
        if request.destination != remote_addr {
            return Err(Error::ErrUnexpectedStunMessage);
        }
        response.verify_integrity(self.ufrag_pwd.remote_pwd.as_bytes())?;

        self.last_received = Some(now);

        if let Some(pair) = self
            .candidate_pairs
            .iter_mut()
            .find(|p| (p.local_index, p.remote_index) == request.pair)
        {
            pair.state = CandidatePairState::Succeeded;
            pair.binding_request_count = 0;
            if request.is_use_candidate {
                pair.nominated = true;
            }
        }

        self.update_selected_pair();
        self.update_connection_state(now);
        Ok(())
    }

    fn handle_binding_error(&mut self, response: Message, remote_addr: SocketAddr) {
        let Some(position) = self
            .pending_binding_requests
            .iter()
            .position(|r| r.transaction_id == response.transaction_id)
        else {
            return;
        };
        let request = self.pending_binding_requests.remove(position);
        let code = response.error_code().map(|(c, _)| c);
        debug!("binding error {code:?} from {remote_addr}");

        if code == Some(ERROR_ROLE_CONFLICT) {
            self.switch_role(!self.is_controlling);
            if let Some(pair) = self
                .candidate_pairs
                .iter_mut()
                .find(|p| (p.local_index, p.remote_index) == request.pair)
            {
                // retry the check in the new role
                pair.state = CandidatePairState::Waiting;
                pair.binding_request_count = 0;
            }
        } else if let Some(pair) = self
            .candidate_pairs
            .iter_mut()
            .find(|p| (p.local_index, p.remote_index) == request.pair)
        {
            pair.state = CandidatePairState::Failed;
        }
    }

    fn find_or_insert_pair(&mut self, local_addr: SocketAddr, remote_index: usize) -> Result<usize> {
        let local_index = self
            .local_candidates
            .iter()
            .position(|c| c.address == local_addr)
            .ok_or(Error::ErrNoCandidatePairs)?;
        if let Some(index) = self
            .candidate_pairs
            .iter()
            .position(|p| p.local_index == local_index && p.remote_index == remote_index)
        {
            return Ok(index);
        }
        self.add_pair(local_index, remote_index);
        self.sort_candidate_pairs();
        self.candidate_pairs
            .iter()
            .position(|p| p.local_index == local_index && p.remote_index == remote_index)
            .ok_or(Error::ErrNoCandidatePairs)
    }

    fn switch_role(&mut self, is_controlling: bool) {
        self.is_controlling = is_controlling;
        for pair in &mut self.candidate_pairs {
            pair.ice_role_controlling = is_controlling;
        }
        self.sort_candidate_pairs();
    }

    /// Picks the highest priority nominated+succeeded pair.
    fn update_selected_pair(&mut self) {
        let best = self
            .candidate_pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.nominated && p.state == CandidatePairState::Succeeded)
            .max_by_key(|(_, p)| p.priority())
            .map(|(i, _)| i);

        if let Some(best) = best {
            if self.selected_pair != Some(best) {
                self.selected_pair = Some(best);
                let pair = &self.candidate_pairs[best];
                let local = self.local_candidates[pair.local_index].address;
                let remote = self.remote_candidates[pair.remote_index].address;
                debug!("selected pair {local} <-> {remote}");
                self.events
                    .push_back(IceEvent::SelectedPairChange(local, remote));
            }
        }
    }

    fn update_connection_state(&mut self, now: Instant) {
        if !self.checks_started || self.connection_state == ConnectionState::Closed {
            return;
        }

        if self.selected_pair.is_some() {
            if let Some(last) = self.last_received {
                if now.duration_since(last) > self.failed_timeout {
                    self.set_connection_state(ConnectionState::Failed);
                    return;
                }
                if now.duration_since(last) > self.disconnected_timeout {
                    self.set_connection_state(ConnectionState::Disconnected);
                    return;
                }
            }
            let next = if self.gathering_state == GatheringState::Complete
                && self
                    .candidate_pairs
                    .iter()
                    .all(|p| p.state != CandidatePairState::Waiting && p.state != CandidatePairState::InProgress)
            {
                ConnectionState::Completed
            } else {
                ConnectionState::Connected
            };
            if self.connection_state != next {
                self.set_connection_state(next);
            }
            return;
        }

        let all_failed = !self.candidate_pairs.is_empty()
            && self
                .candidate_pairs
                .iter()
                .all(|p| p.state == CandidatePairState::Failed);
        if all_failed && self.gathering_state == GatheringState::Complete {
            self.set_connection_state(ConnectionState::Failed);
        }
    }

    fn send_keepalive(&mut self, now: Instant) {
        if self.keepalive_interval.is_zero() {
            return;
        }
        let Some(transport) = self.selected_transport() else {
            return;
        };
        let due = match self.last_sent {
            Some(last) => now.duration_since(last) >= self.keepalive_interval,
            None => true,
        };
        if !due {
            return;
        }
        let mut indication = Message::new(stun::message::MessageType::new(
            stun::message::METHOD_BINDING,
            MessageClass::Indication,
        ));
        indication.add_fingerprint();
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport,
            message: indication.encode(),
        });
        self.last_sent = Some(now);
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        if self.connection_state == state {
            return;
        }
        debug!("ice connection state {} -> {}", self.connection_state, state);
        self.connection_state = state;
        self.events
            .push_back(IceEvent::ConnectionStateChange(state));
    }

    fn set_gathering_state(&mut self, state: GatheringState) {
        if self.gathering_state == state {
            return;
        }
        self.gathering_state = state;
        self.events
            .push_back(IceEvent::GatheringStateChange(state));
    }
}

#[cfg(test)]
mod agent_test {
    use super::*;
    use std::str::FromStr;

    fn new_agent(is_controlling: bool) -> Agent {
        Agent::new(AgentConfig {
            is_controlling,
            ..Default::default()
        })
        .unwrap()
    }

    fn connect_credentials(a: &mut Agent, b: &mut Agent) {
        let (a_ufrag, a_pwd) = {
            let (u, p) = a.local_credentials();
            (u.to_string(), p.to_string())
        };
        let (b_ufrag, b_pwd) = {
            let (u, p) = b.local_credentials();
            (u.to_string(), p.to_string())
        };
        a.set_remote_credentials(b_ufrag, b_pwd).unwrap();
        b.set_remote_credentials(a_ufrag, a_pwd).unwrap();
    }

    /// Moves every queued transmit from `from` into `to`, flipping the
    /// transport context the way a pair of sockets would.
    fn shuttle(from: &mut Agent, to: &mut Agent, now: Instant) {
        while let Some(t) = from.poll_transmit() {
            let msg = TaggedBytesMut {
                now,
                transport: TransportContext {
                    local_addr: t.transport.peer_addr,
                    peer_addr: t.transport.local_addr,
                    transport_protocol: t.transport.transport_protocol,
                },
                message: t.message,
            };
            let _ = to.handle_read(msg);
        }
    }

    #[test]
    fn test_reject_weak_credentials() {
        let result = Agent::new(AgentConfig {
            local_ufrag: "xx".to_string(),
            ..Default::default()
        });
        assert_eq!(result.err(), Some(Error::ErrLocalUfragInsufficientBits));

        let result = Agent::new(AgentConfig {
            local_pwd: "short".to_string(),
            ..Default::default()
        });
        assert_eq!(result.err(), Some(Error::ErrLocalPwdInsufficientBits));
    }

    #[test]
    fn test_checks_require_remote_credentials() {
        let mut a = new_agent(true);
        assert_eq!(
            a.start_connectivity_checks(Instant::now()).err(),
            Some(Error::ErrRemoteUfragEmpty)
        );
    }

    #[test]
    fn test_redundant_candidates_dropped() {
        let mut a = new_agent(true);
        let addr = SocketAddr::from_str("10.0.0.1:4000").unwrap();
        a.add_local_candidate(Candidate::host(addr, 1)).unwrap();
        a.add_local_candidate(Candidate::host(addr, 1)).unwrap();
        assert_eq!(a.local_candidates().len(), 1);
    }

    #[test]
    fn test_no_selection_without_success() {
        let mut a = new_agent(true);
        a.add_local_candidate(Candidate::host(
            SocketAddr::from_str("10.0.0.1:4000").unwrap(),
            1,
        ))
        .unwrap();
        a.add_remote_candidate(Candidate::host(
            SocketAddr::from_str("10.0.0.2:4000").unwrap(),
            1,
        ))
        .unwrap();
        a.set_remote_credentials("remoteufrag".to_string(), "remotepwd012345678901234".to_string())
            .unwrap();
        let now = Instant::now();
        a.start_connectivity_checks(now).unwrap();
        // checks go out but no response ever arrives
        assert!(a.poll_transmit().is_some());
        assert!(a.selected_candidate_pair().is_none());
        assert_eq!(a.connection_state(), ConnectionState::Checking);
    }

    #[test]
    fn test_two_agents_connect() {
        let mut controlling = new_agent(true);
        let mut controlled = new_agent(false);
        connect_credentials(&mut controlling, &mut controlled);

        let addr_a = SocketAddr::from_str("10.0.0.1:4000").unwrap();
        let addr_b = SocketAddr::from_str("10.0.0.2:5000").unwrap();
        controlling.add_local_candidate(Candidate::host(addr_a, 1)).unwrap();
        controlling.end_of_candidates();
        controlled.add_local_candidate(Candidate::host(addr_b, 1)).unwrap();
        controlled.end_of_candidates();
        controlling.add_remote_candidate(Candidate::host(addr_b, 1)).unwrap();
        controlled.add_remote_candidate(Candidate::host(addr_a, 1)).unwrap();

        let mut now = Instant::now();
        controlling.start_connectivity_checks(now).unwrap();
        controlled.start_connectivity_checks(now).unwrap();

        for _ in 0..10 {
            controlling.handle_timeout(now);
            controlled.handle_timeout(now);
            shuttle(&mut controlling, &mut controlled, now);
            shuttle(&mut controlled, &mut controlling, now);
            now += Duration::from_millis(50);
        }

        assert!(matches!(
            controlling.connection_state(),
            ConnectionState::Connected | ConnectionState::Completed
        ));
        assert!(matches!(
            controlled.connection_state(),
            ConnectionState::Connected | ConnectionState::Completed
        ));

        let (local, remote) = controlling.selected_candidate_pair().unwrap();
        assert_eq!(local.address, addr_a);
        assert_eq!(remote.address, addr_b);
        let (local, remote) = controlled.selected_candidate_pair().unwrap();
        assert_eq!(local.address, addr_b);
        assert_eq!(remote.address, addr_a);

        assert!(controlling
            .selected_transport()
            .is_some_and(|t| t.peer_addr == addr_b));
    }

    #[test]
    fn test_peer_reflexive_learning() {
        let mut controlling = new_agent(true);
        let mut controlled = new_agent(false);
        connect_credentials(&mut controlling, &mut controlled);

        let addr_a = SocketAddr::from_str("10.0.0.1:4000").unwrap();
        let addr_b = SocketAddr::from_str("10.0.0.2:5000").unwrap();
        controlling.add_local_candidate(Candidate::host(addr_a, 1)).unwrap();
        controlled.add_local_candidate(Candidate::host(addr_b, 1)).unwrap();
        // only the controlling side knows its peer; the controlled side
        // must learn addr_a as prflx from the inbound check
        controlling.add_remote_candidate(Candidate::host(addr_b, 1)).unwrap();

        let mut now = Instant::now();
        controlling.start_connectivity_checks(now).unwrap();
        controlled.start_connectivity_checks(now).unwrap();

        for _ in 0..10 {
            controlling.handle_timeout(now);
            controlled.handle_timeout(now);
            shuttle(&mut controlling, &mut controlled, now);
            shuttle(&mut controlled, &mut controlling, now);
            now += Duration::from_millis(50);
        }

        let learned = controlled
            .remote_candidates
            .iter()
            .find(|c| c.address == addr_a)
            .expect("prflx learned");
        assert_eq!(learned.candidate_type, CandidateType::PeerReflexive);
        assert!(controlling.selected_candidate_pair().is_some());
    }

    #[test]
    fn test_closed_agent_rejects_input() {
        let mut a = new_agent(true);
        a.close();
        let err = a.add_local_candidate(Candidate::host(
            SocketAddr::from_str("10.0.0.1:4000").unwrap(),
            1,
        ));
        assert_eq!(err.err(), Some(Error::ErrAgentClosed));
    }
}
