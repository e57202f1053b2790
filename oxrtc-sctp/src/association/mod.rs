use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use shared::error::{Error, Result};

use crate::chunk::{Chunk, ChunkData, ChunkForwardTsn, ChunkInit, ChunkSack, GapAckBlock};
use crate::packet::Packet;

/// WebRTC data channel encapsulation pins both ports to 5000.
pub const SCTP_PORT: u16 = 5000;

const MAX_BUNDLE_SIZE: usize = 1200;
const COOKIE_LEN: usize = 32;

fn tsn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn tsn_le(a: u32, b: u32) -> bool {
    a == b || tsn_lt(a, b)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

/// Per-message reliability, fixed when the owning channel opens.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReliabilityPolicy {
    Reliable,
    /// Give up after this many retransmissions.
    MaxRetransmits(u32),
    /// Give up once the message has been pending this long.
    MaxLifetime(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEvent {
    Connected,
    DataReceived {
        stream_id: u16,
        ppid: u32,
        unordered: bool,
        data: Bytes,
    },
    Closed,
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct AssociationConfig {
    pub is_client: bool,
    pub max_streams: u16,
    pub a_rwnd: u32,
    pub max_message_size: usize,
    pub max_fragment_size: usize,
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// Retry ceiling for reliable data; past it the association aborts.
    pub max_retransmits: u32,
    pub max_init_retransmits: u32,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            is_client: false,
            max_streams: 1024,
            a_rwnd: 128 * 1024,
            max_message_size: 256 * 1024,
            max_fragment_size: 1150,
            rto_initial: Duration::from_secs(1),
            rto_min: Duration::from_millis(400),
            rto_max: Duration::from_secs(60),
            max_retransmits: 10,
            max_init_retransmits: 8,
        }
    }
}

struct InflightChunk {
    chunk: ChunkData,
    policy: ReliabilityPolicy,
    enqueued_at: Instant,
    retransmit_count: u32,
    retransmitted: bool,
    acked: bool,
    abandoned: bool,
    miss_count: u8,
}

struct PendingChunk {
    chunk: ChunkData,
    policy: ReliabilityPolicy,
    enqueued_at: Instant,
}

/// Sans-I/O SCTP association. `poll_transmit` yields whole SCTP packets
/// ready for DTLS encapsulation; `handle_read` consumes them.
pub struct Association {
    state: AssociationState,

    my_vtag: u32,
    peer_vtag: u32,
    my_cookie: Vec<u8>,

    // outbound
    next_tsn: u32,
    cum_ack_point: u32,
    peer_rwnd: u32,
    next_ssn: HashMap<u16, u16>,
    pending: VecDeque<PendingChunk>,
    inflight: BTreeMap<u32, InflightChunk>,

    // inbound
    peer_cum_tsn: u32,
    ooo_tsns: BTreeSet<u32>,
    reassembly: BTreeMap<u32, ChunkData>,
    buffered_bytes: usize,
    expected_ssn: HashMap<u16, u16>,
    duplicate_tsns: Vec<u32>,
    sack_needed: bool,

    // timers
    rto: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
    t3_deadline: Option<Instant>,
    /// Handshake and shutdown control retransmission (T1/T2).
    control_packet: Option<Vec<u8>>,
    control_deadline: Option<Instant>,
    control_retransmits: u32,

    config: AssociationConfig,

    transmits: VecDeque<BytesMut>,
    events: VecDeque<AssociationEvent>,
}

impl Association {
    pub fn new(config: AssociationConfig) -> Self {
        let mut rng = rand::rng();
        // random but far from the 32-bit wrap point, the association will
        // never send 2^31 chunks
        let next_tsn: u32 = rng.random_range(0..1 << 31);
        Self {
            state: AssociationState::Closed,
            my_vtag: rng.random_range(1..u32::MAX),
            peer_vtag: 0,
            my_cookie: vec![],
            next_tsn,
            cum_ack_point: next_tsn.wrapping_sub(1),
            peer_rwnd: 0,
            next_ssn: HashMap::new(),
            pending: VecDeque::new(),
            inflight: BTreeMap::new(),
            peer_cum_tsn: 0,
            ooo_tsns: BTreeSet::new(),
            reassembly: BTreeMap::new(),
            buffered_bytes: 0,
            expected_ssn: HashMap::new(),
            duplicate_tsns: vec![],
            sack_needed: false,
            rto: config.rto_initial,
            srtt: None,
            rttvar: Duration::ZERO,
            t3_deadline: None,
            control_packet: None,
            control_deadline: None,
            control_retransmits: 0,
            config,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    pub fn poll_transmit(&mut self) -> Option<BytesMut> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<AssociationEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.control_deadline, self.t3_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    /// Starts the four-way handshake (client side).
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != AssociationState::Closed {
            return Err(Error::ErrAssociationNotEstablished);
        }
        self.state = AssociationState::CookieWait;
        let init = Chunk::Init(ChunkInit {
            is_ack: false,
            initiate_tag: self.my_vtag,
            a_rwnd: self.config.a_rwnd,
            outbound_streams: self.config.max_streams,
            inbound_streams: self.config.max_streams,
            initial_tsn: self.next_tsn,
            cookie: None,
        });
        // INIT goes out with a zero verification tag
        let wire = self.build_packet_with_vtag(vec![init], 0);
        self.arm_control(wire.clone(), now);
        self.transmits.push_back(BytesMut::from(&wire[..]));
        Ok(())
    }

    /// Queues one user message, fragmenting as needed.
    pub fn write(
        &mut self,
        stream_id: u16,
        ppid: u32,
        data: &[u8],
        ordered: bool,
        policy: ReliabilityPolicy,
        now: Instant,
    ) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(Error::ErrAssociationNotEstablished);
        }
        if data.len() > self.config.max_message_size {
            return Err(Error::ErrOutboundPacketTooLarge);
        }

        let stream_seq = if ordered {
            let ssn = self.next_ssn.entry(stream_id).or_insert(0);
            let current = *ssn;
            *ssn = ssn.wrapping_add(1);
            current
        } else {
            0
        };

        let fragments: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(self.config.max_fragment_size).collect()
        };
        let last = fragments.len() - 1;
        for (i, fragment) in fragments.into_iter().enumerate() {
            let chunk = ChunkData {
                unordered: !ordered,
                beginning: i == 0,
                ending: i == last,
                tsn: self.next_tsn,
                stream_id,
                stream_seq,
                ppid,
                user_data: Bytes::copy_from_slice(fragment),
            };
            self.next_tsn = self.next_tsn.wrapping_add(1);
            self.pending.push_back(PendingChunk {
                chunk,
                policy,
                enqueued_at: now,
            });
        }
        self.flush(now);
        Ok(())
    }

    /// Graceful close: drain outbound data, then SHUTDOWN.
    pub fn shutdown(&mut self, now: Instant) -> Result<()> {
        match self.state {
            AssociationState::Established => {
                self.state = AssociationState::ShutdownPending;
                self.maybe_send_shutdown(now);
                Ok(())
            }
            _ => Err(Error::ErrShutdownNonEstablished),
        }
    }

    /// Abrupt teardown, notifies the peer.
    pub fn abort(&mut self, reason: &str, _now: Instant) {
        if self.state == AssociationState::Closed {
            return;
        }
        let wire = self.build_packet(vec![Chunk::Abort(reason.to_string())]);
        self.transmits.push_back(BytesMut::from(&wire[..]));
        self.enter_closed(Some(reason.to_string()));
    }

    pub fn handle_read(&mut self, raw: &[u8], now: Instant) -> Result<()> {
        let packet = Packet::decode(raw)?;

        let is_init = packet
            .chunks
            .iter()
            .any(|c| matches!(c, Chunk::Init(init) if !init.is_ack));
        if is_init {
            if packet.verification_tag != 0 {
                return Err(Error::ErrInitChunkVerifyTagNotZero);
            }
            if packet.chunks.len() != 1 {
                return Err(Error::ErrInitChunkBundled);
            }
        } else if packet.verification_tag != self.my_vtag {
            // out-of-association traffic is dropped, not fatal
            trace!(
                "dropping packet with verification tag {:08x}",
                packet.verification_tag
            );
            return Ok(());
        }

        for chunk in packet.chunks {
            self.handle_chunk(chunk, now)?;
        }

        if self.sack_needed {
            self.sack_needed = false;
            self.send_sack();
        }
        Ok(())
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.control_deadline {
            if now >= deadline {
                self.retransmit_control(now);
            }
        }
        if let Some(deadline) = self.t3_deadline {
            if now >= deadline {
                self.on_t3_expiry(now);
            }
        }
    }

    fn handle_chunk(&mut self, chunk: Chunk, now: Instant) -> Result<()> {
        match chunk {
            Chunk::Init(init) if !init.is_ack => self.handle_init(init),
            Chunk::Init(init) => self.handle_init_ack(init, now),
            Chunk::CookieEcho(cookie) => self.handle_cookie_echo(cookie),
            Chunk::CookieAck => self.handle_cookie_ack(),
            Chunk::Data(data) => {
                self.handle_data(data);
                Ok(())
            }
            Chunk::Sack(sack) => {
                self.handle_sack(sack, now);
                Ok(())
            }
            Chunk::ForwardTsn(forward) => {
                self.handle_forward_tsn(forward);
                Ok(())
            }
            Chunk::Heartbeat(info) => {
                let wire = self.build_packet(vec![Chunk::HeartbeatAck(info)]);
                self.transmits.push_back(BytesMut::from(&wire[..]));
                Ok(())
            }
            Chunk::HeartbeatAck(_) => Ok(()),
            Chunk::Abort(reason) => {
                warn!("association aborted by peer: {reason}");
                self.enter_closed(Some(reason));
                Ok(())
            }
            Chunk::Shutdown { cumulative_tsn_ack } => {
                self.ack_through(cumulative_tsn_ack, now);
                self.state = AssociationState::ShutdownReceived;
                self.maybe_send_shutdown_ack(now);
                Ok(())
            }
            Chunk::ShutdownAck => {
                let wire = self.build_packet(vec![Chunk::ShutdownComplete]);
                self.transmits.push_back(BytesMut::from(&wire[..]));
                self.enter_closed(None);
                Ok(())
            }
            Chunk::ShutdownComplete => {
                self.enter_closed(None);
                Ok(())
            }
        }
    }

    fn handle_init(&mut self, init: ChunkInit) -> Result<()> {
        self.peer_vtag = init.initiate_tag;
        self.peer_rwnd = init.a_rwnd;
        self.peer_cum_tsn = init.initial_tsn.wrapping_sub(1);

        let mut cookie = vec![0u8; COOKIE_LEN];
        rand::rng().fill(&mut cookie[..]);
        self.my_cookie = cookie.clone();

        let init_ack = Chunk::Init(ChunkInit {
            is_ack: true,
            initiate_tag: self.my_vtag,
            a_rwnd: self.config.a_rwnd,
            outbound_streams: self.config.max_streams,
            inbound_streams: self.config.max_streams,
            initial_tsn: self.next_tsn,
            cookie: Some(cookie),
        });
        let wire = self.build_packet(vec![init_ack]);
        self.transmits.push_back(BytesMut::from(&wire[..]));
        Ok(())
    }

    fn handle_init_ack(&mut self, init: ChunkInit, now: Instant) -> Result<()> {
        if self.state != AssociationState::CookieWait {
            return Ok(());
        }
        let cookie = init.cookie.ok_or(Error::ErrInitAckNoCookie)?;
        self.peer_vtag = init.initiate_tag;
        self.peer_rwnd = init.a_rwnd;
        self.peer_cum_tsn = init.initial_tsn.wrapping_sub(1);
        self.state = AssociationState::CookieEchoed;

        let wire = self.build_packet(vec![Chunk::CookieEcho(cookie)]);
        self.arm_control(wire.clone(), now);
        self.transmits.push_back(BytesMut::from(&wire[..]));
        Ok(())
    }

    fn handle_cookie_echo(&mut self, cookie: Vec<u8>) -> Result<()> {
        if self.my_cookie.is_empty() || cookie != self.my_cookie {
            trace!("dropping cookie echo with unknown cookie");
            return Ok(());
        }
        let wire = self.build_packet(vec![Chunk::CookieAck]);
        self.transmits.push_back(BytesMut::from(&wire[..]));
        if self.state != AssociationState::Established {
            self.state = AssociationState::Established;
            debug!("association established (server)");
            self.events.push_back(AssociationEvent::Connected);
        }
        Ok(())
    }

    fn handle_cookie_ack(&mut self) -> Result<()> {
        if self.state != AssociationState::CookieEchoed {
            return Ok(());
        }
        self.disarm_control();
        self.state = AssociationState::Established;
        debug!("association established (client)");
        self.events.push_back(AssociationEvent::Connected);
        Ok(())
    }

    fn handle_data(&mut self, data: ChunkData) {
        if !matches!(
            self.state,
            AssociationState::Established
                | AssociationState::ShutdownPending
                | AssociationState::ShutdownSent
        ) {
            return;
        }
        self.sack_needed = true;

        let tsn = data.tsn;
        if tsn_le(tsn, self.peer_cum_tsn) || self.reassembly.contains_key(&tsn) {
            self.duplicate_tsns.push(tsn);
            return;
        }

        self.buffered_bytes += data.user_data.len();
        self.reassembly.insert(tsn, data);
        if tsn == self.peer_cum_tsn.wrapping_add(1) {
            self.peer_cum_tsn = tsn;
            while self.ooo_tsns.remove(&self.peer_cum_tsn.wrapping_add(1)) {
                self.peer_cum_tsn = self.peer_cum_tsn.wrapping_add(1);
            }
        } else {
            self.ooo_tsns.insert(tsn);
        }

        self.drain_deliverable();
    }

    /// Delivers every complete message whose ordering constraints are met.
    fn drain_deliverable(&mut self) {
        loop {
            let Some((tsns, first)) = self.find_deliverable() else {
                return;
            };
            let mut payload = BytesMut::new();
            for tsn in &tsns {
                if let Some(chunk) = self.reassembly.remove(tsn) {
                    self.buffered_bytes -= chunk.user_data.len();
                    payload.extend_from_slice(&chunk.user_data);
                }
            }
            if !first.unordered {
                let expected = self.expected_ssn.entry(first.stream_id).or_insert(0);
                *expected = first.stream_seq.wrapping_add(1);
            }
            self.events.push_back(AssociationEvent::DataReceived {
                stream_id: first.stream_id,
                ppid: first.ppid,
                unordered: first.unordered,
                data: payload.freeze(),
            });
        }
    }

    /// Finds one complete message ready for delivery: consecutive TSNs
    /// from a beginning fragment to an ending fragment, all received, and
    /// in stream-sequence order if the stream is ordered.
    fn find_deliverable(&self) -> Option<(Vec<u32>, ChunkData)> {
        for (start_tsn, start) in &self.reassembly {
            if !start.beginning {
                continue;
            }
            if !start.unordered {
                let expected = self.expected_ssn.get(&start.stream_id).copied().unwrap_or(0);
                if start.stream_seq != expected {
                    continue;
                }
            }
            let mut tsns = vec![*start_tsn];
            let mut tsn = *start_tsn;
            let mut tail = start;
            while !tail.ending {
                tsn = tsn.wrapping_add(1);
                match self.reassembly.get(&tsn) {
                    Some(next) if next.stream_id == start.stream_id => {
                        tsns.push(tsn);
                        tail = next;
                    }
                    _ => break,
                }
            }
            if tail.ending {
                return Some((tsns, start.clone()));
            }
        }
        None
    }

    fn handle_forward_tsn(&mut self, forward: ChunkForwardTsn) {
        if !tsn_lt(self.peer_cum_tsn, forward.new_cumulative_tsn) {
            self.sack_needed = true;
            return;
        }
        self.peer_cum_tsn = forward.new_cumulative_tsn;
        while self.ooo_tsns.remove(&self.peer_cum_tsn.wrapping_add(1)) {
            self.peer_cum_tsn = self.peer_cum_tsn.wrapping_add(1);
        }
        self.ooo_tsns.retain(|tsn| tsn_lt(self.peer_cum_tsn, *tsn));

        for (stream_id, stream_seq) in forward.streams {
            let expected = self.expected_ssn.entry(stream_id).or_insert(0);
            let skipped_past = stream_seq.wrapping_add(1);
            // only move forward
            if skipped_past.wrapping_sub(*expected) < 0x8000 {
                *expected = skipped_past;
            }
        }
        // messages that were only blocked on the skipped sequence numbers
        // must go out before the leftover fragments are discarded
        self.drain_deliverable();

        let stale: Vec<u32> = self
            .reassembly
            .keys()
            .filter(|tsn| tsn_le(**tsn, self.peer_cum_tsn))
            .copied()
            .collect();
        for tsn in stale {
            if let Some(chunk) = self.reassembly.remove(&tsn) {
                self.buffered_bytes -= chunk.user_data.len();
            }
        }
        self.sack_needed = true;
    }

    fn handle_sack(&mut self, sack: ChunkSack, now: Instant) {
        if tsn_lt(sack.cumulative_tsn_ack, self.cum_ack_point) {
            return;
        }
        self.ack_through(sack.cumulative_tsn_ack, now);

        // gap ack blocks mark chunks above the cumulative point
        let mut highest_gap_acked = sack.cumulative_tsn_ack;
        for gap in &sack.gap_ack_blocks {
            for offset in gap.start..=gap.end {
                let tsn = sack.cumulative_tsn_ack.wrapping_add(u32::from(offset));
                if let Some(inflight) = self.inflight.get_mut(&tsn) {
                    inflight.acked = true;
                }
                highest_gap_acked = tsn;
            }
        }

        // count misses for fast retransmit
        let mut to_fast_retransmit = vec![];
        for (tsn, inflight) in self.inflight.iter_mut() {
            if inflight.acked || inflight.abandoned || !tsn_lt(*tsn, highest_gap_acked) {
                continue;
            }
            inflight.miss_count = inflight.miss_count.saturating_add(1);
            if inflight.miss_count == 3 {
                inflight.retransmit_count += 1;
                inflight.retransmitted = true;
                to_fast_retransmit.push(inflight.chunk.clone());
            }
        }
        if !to_fast_retransmit.is_empty() {
            trace!("fast retransmitting {} chunks", to_fast_retransmit.len());
            self.send_data_chunks(&to_fast_retransmit);
        }

        self.peer_rwnd = sack.a_rwnd.saturating_sub(self.outstanding_bytes() as u32);
        if self.inflight.values().all(|c| c.acked || c.abandoned) && self.pending.is_empty() {
            self.t3_deadline = None;
        }
        self.flush(now);
        self.maybe_send_forward_tsn();
        self.maybe_send_shutdown(now);
    }

    /// Removes inflight chunks at or below the cumulative ack and updates
    /// the RTO estimate from a fresh (never retransmitted) chunk.
    fn ack_through(&mut self, cumulative_tsn_ack: u32, now: Instant) {
        let acked: Vec<u32> = self
            .inflight
            .keys()
            .filter(|tsn| tsn_le(**tsn, cumulative_tsn_ack))
            .copied()
            .collect();
        let mut measured = false;
        for tsn in acked {
            if let Some(chunk) = self.inflight.remove(&tsn) {
                if !measured && !chunk.retransmitted {
                    self.update_rto(now.duration_since(chunk.enqueued_at));
                    measured = true;
                }
            }
        }
        if tsn_lt(self.cum_ack_point, cumulative_tsn_ack) {
            self.cum_ack_point = cumulative_tsn_ack;
        }
    }

    /// RFC 6298 smoothed RTT.
    fn update_rto(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let rto = self.srtt.unwrap_or(self.config.rto_initial) + 4 * self.rttvar;
        self.rto = rto.clamp(self.config.rto_min, self.config.rto_max);
    }

    fn on_t3_expiry(&mut self, now: Instant) {
        self.rto = (self.rto * 2).min(self.config.rto_max);

        let mut to_retransmit = vec![];
        let mut abort_reason = None;
        for inflight in self.inflight.values_mut() {
            if inflight.acked || inflight.abandoned {
                continue;
            }
            let abandoned = match inflight.policy {
                ReliabilityPolicy::Reliable => false,
                ReliabilityPolicy::MaxRetransmits(limit) => inflight.retransmit_count > limit,
                ReliabilityPolicy::MaxLifetime(lifetime) => {
                    now.duration_since(inflight.enqueued_at) > lifetime
                }
            };
            if abandoned {
                debug!("abandoning tsn {} past its reliability limit", inflight.chunk.tsn);
                inflight.abandoned = true;
                continue;
            }
            if inflight.retransmit_count >= self.config.max_retransmits {
                abort_reason = Some("retransmission limit exceeded".to_string());
                break;
            }
            inflight.retransmit_count += 1;
            inflight.retransmitted = true;
            to_retransmit.push(inflight.chunk.clone());
            if to_retransmit.iter().map(|c| c.user_data.len()).sum::<usize>() > MAX_BUNDLE_SIZE {
                break;
            }
        }

        if let Some(reason) = abort_reason {
            warn!("aborting association: {reason}");
            let wire = self.build_packet(vec![Chunk::Abort(reason.clone())]);
            self.transmits.push_back(BytesMut::from(&wire[..]));
            self.enter_closed(Some(reason));
            return;
        }

        if !to_retransmit.is_empty() {
            self.send_data_chunks(&to_retransmit);
        }
        self.maybe_send_forward_tsn();

        if self.inflight.values().any(|c| !c.acked && !c.abandoned) {
            self.t3_deadline = Some(now + self.rto);
        } else {
            self.t3_deadline = None;
        }
    }

    /// Moves pending chunks into flight while the peer window allows.
    fn flush(&mut self, now: Instant) {
        let mut to_send = vec![];
        loop {
            let size = match self.pending.front() {
                Some(front) => front.chunk.user_data.len(),
                None => break,
            };
            if self.outstanding_bytes() > 0
                && self.outstanding_bytes() + size > self.peer_rwnd as usize
            {
                break;
            }
            let Some(pending) = self.pending.pop_front() else {
                break;
            };
            to_send.push(pending.chunk.clone());
            self.inflight.insert(
                pending.chunk.tsn,
                InflightChunk {
                    chunk: pending.chunk,
                    policy: pending.policy,
                    enqueued_at: pending.enqueued_at,
                    retransmit_count: 0,
                    retransmitted: false,
                    acked: false,
                    abandoned: false,
                    miss_count: 0,
                },
            );
        }
        if !to_send.is_empty() {
            self.send_data_chunks(&to_send);
            if self.t3_deadline.is_none() {
                self.t3_deadline = Some(now + self.rto);
            }
        }
    }

    /// Bundles DATA chunks into packets no larger than the usable MTU.
    fn send_data_chunks(&mut self, chunks: &[ChunkData]) {
        let mut bundle: Vec<Chunk> = vec![];
        let mut size = 0;
        for chunk in chunks {
            let chunk_size = 16 + chunk.user_data.len();
            if !bundle.is_empty() && size + chunk_size > MAX_BUNDLE_SIZE {
                let wire = self.build_packet(std::mem::take(&mut bundle));
                self.transmits.push_back(BytesMut::from(&wire[..]));
                size = 0;
            }
            bundle.push(Chunk::Data(chunk.clone()));
            size += chunk_size;
        }
        if !bundle.is_empty() {
            let wire = self.build_packet(bundle);
            self.transmits.push_back(BytesMut::from(&wire[..]));
        }
    }

    fn send_sack(&mut self) {
        let gap_ack_blocks = self.build_gap_blocks();
        let sack = Chunk::Sack(ChunkSack {
            cumulative_tsn_ack: self.peer_cum_tsn,
            a_rwnd: self
                .config
                .a_rwnd
                .saturating_sub(self.buffered_bytes as u32),
            gap_ack_blocks,
            duplicate_tsns: std::mem::take(&mut self.duplicate_tsns),
        });
        let wire = self.build_packet(vec![sack]);
        self.transmits.push_back(BytesMut::from(&wire[..]));
    }

    fn build_gap_blocks(&self) -> Vec<GapAckBlock> {
        let mut blocks: Vec<GapAckBlock> = vec![];
        for tsn in &self.ooo_tsns {
            let offset = tsn.wrapping_sub(self.peer_cum_tsn);
            if offset > u16::MAX as u32 {
                break;
            }
            let offset = offset as u16;
            match blocks.last_mut() {
                Some(last) if last.end + 1 == offset => last.end = offset,
                _ => blocks.push(GapAckBlock {
                    start: offset,
                    end: offset,
                }),
            }
        }
        blocks
    }

    /// RFC 3758: when the first outstanding chunks are abandoned, tell the
    /// peer to move its cumulative point past them.
    fn maybe_send_forward_tsn(&mut self) {
        let mut new_cum = self.cum_ack_point;
        let mut streams: Vec<(u16, u16)> = vec![];
        for (tsn, inflight) in &self.inflight {
            if *tsn != new_cum.wrapping_add(1) {
                break;
            }
            if inflight.abandoned || inflight.acked {
                new_cum = *tsn;
                if inflight.abandoned && !inflight.chunk.unordered {
                    match streams.iter_mut().find(|(id, _)| *id == inflight.chunk.stream_id) {
                        Some(entry) => entry.1 = inflight.chunk.stream_seq,
                        None => streams.push((inflight.chunk.stream_id, inflight.chunk.stream_seq)),
                    }
                }
            } else {
                break;
            }
        }
        if new_cum == self.cum_ack_point {
            return;
        }
        let forward = Chunk::ForwardTsn(ChunkForwardTsn {
            new_cumulative_tsn: new_cum,
            streams,
        });
        let wire = self.build_packet(vec![forward]);
        self.transmits.push_back(BytesMut::from(&wire[..]));
    }

    fn maybe_send_shutdown(&mut self, now: Instant) {
        if self.state != AssociationState::ShutdownPending
            || !self.pending.is_empty()
            || self.inflight.values().any(|c| !c.acked && !c.abandoned)
        {
            return;
        }
        self.state = AssociationState::ShutdownSent;
        let wire = self.build_packet(vec![Chunk::Shutdown {
            cumulative_tsn_ack: self.peer_cum_tsn,
        }]);
        self.arm_control(wire.clone(), now);
        self.transmits.push_back(BytesMut::from(&wire[..]));
    }

    fn maybe_send_shutdown_ack(&mut self, now: Instant) {
        if self.state != AssociationState::ShutdownReceived
            || !self.pending.is_empty()
            || self.inflight.values().any(|c| !c.acked && !c.abandoned)
        {
            return;
        }
        self.state = AssociationState::ShutdownAckSent;
        let wire = self.build_packet(vec![Chunk::ShutdownAck]);
        self.arm_control(wire.clone(), now);
        self.transmits.push_back(BytesMut::from(&wire[..]));
    }

    fn outstanding_bytes(&self) -> usize {
        self.inflight
            .values()
            .filter(|c| !c.acked && !c.abandoned)
            .map(|c| c.chunk.user_data.len())
            .sum()
    }

    fn build_packet(&self, chunks: Vec<Chunk>) -> Vec<u8> {
        self.build_packet_with_vtag(chunks, self.peer_vtag)
    }

    fn build_packet_with_vtag(&self, chunks: Vec<Chunk>, verification_tag: u32) -> Vec<u8> {
        Packet {
            source_port: SCTP_PORT,
            destination_port: SCTP_PORT,
            verification_tag,
            chunks,
        }
        .encode()
    }

    fn arm_control(&mut self, wire: Vec<u8>, now: Instant) {
        self.control_packet = Some(wire);
        self.control_deadline = Some(now + self.rto);
        self.control_retransmits = 0;
    }

    fn disarm_control(&mut self) {
        self.control_packet = None;
        self.control_deadline = None;
        self.control_retransmits = 0;
    }

    fn retransmit_control(&mut self, now: Instant) {
        let Some(wire) = self.control_packet.clone() else {
            self.control_deadline = None;
            return;
        };
        if self.control_retransmits >= self.config.max_init_retransmits {
            let reason = "handshake retransmission limit exceeded".to_string();
            warn!("{reason}");
            self.enter_closed(Some(reason));
            return;
        }
        self.control_retransmits += 1;
        self.control_deadline = Some(
            now + self
                .rto
                .mul_f64(f64::from(1 << self.control_retransmits.min(6))),
        );
        self.transmits.push_back(BytesMut::from(&wire[..]));
    }

    fn enter_closed(&mut self, abort_reason: Option<String>) {
        let was_closed = self.state == AssociationState::Closed;
        self.state = AssociationState::Closed;
        self.t3_deadline = None;
        self.disarm_control();
        self.pending.clear();
        self.inflight.clear();
        if was_closed {
            return;
        }
        match abort_reason {
            Some(reason) => self.events.push_back(AssociationEvent::Aborted(reason)),
            None => self.events.push_back(AssociationEvent::Closed),
        }
    }
}

#[cfg(test)]
mod association_test;
