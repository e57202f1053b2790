use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};

use shared::error::{Error, Result};

use crate::header::Header;
use crate::jitter_buffer::JitterBuffer;
use crate::packet::Packet;
use crate::rtcp::{
    self, Goodbye, ReceiverReport, ReceptionReport, RtcpPacket, SdesChunk, SenderReport,
    SourceDescription,
};
use crate::sequence::Sequencer;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cname: String,
    pub clock_rate: u32,
    pub report_interval: Duration,
    pub retransmit_cache_size: usize,
    pub jitter_buffer_capacity: usize,
    /// Wall clock corresponding to the first `Instant` the session sees,
    /// used only to stamp NTP times in sender reports.
    pub wallclock_origin: SystemTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cname: format!("oxrtc-{:08x}", rand::random::<u32>()),
            clock_rate: 90_000,
            report_interval: Duration::from_secs(5),
            retransmit_cache_size: 128,
            jitter_buffer_capacity: 64,
            wallclock_origin: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PacketReceived(Packet),
    /// Peer-reported available bandwidth in bits per second.
    BandwidthEstimate(u64),
    /// An inbound stream claimed one of our sending SSRCs; the sender
    /// was moved to a freshly drawn SSRC.
    SsrcConflict { old_ssrc: u32, new_ssrc: u32 },
}

struct SenderStream {
    ssrc: u32,
    payload_type: u8,
    sequencer: Sequencer,
    packet_count: u32,
    octet_count: u32,
    last_timestamp: u32,
    cache: VecDeque<Packet>,
}

struct ReceiverStream {
    jitter_buffer: JitterBuffer,
    base_ext: u64,
    max_ext: u64,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    jitter: f64,
    last_transit: Option<i64>,
    first_arrival: Option<Instant>,
    last_sr_ntp_mid: u32,
    last_sr_arrival: Option<Instant>,
}

/// Sans-I/O RTP/RTCP session: tracks sending and receiving streams,
/// reorders inbound media, answers NACKs from a bounded retransmit
/// cache, and emits periodic compound reports.
pub struct RtpSession {
    config: SessionConfig,
    epoch: Option<Instant>,
    senders: HashMap<u32, SenderStream>,
    receivers: HashMap<u32, ReceiverStream>,
    next_report: Option<Instant>,
    rtp_queue: VecDeque<Packet>,
    rtcp_queue: VecDeque<BytesMut>,
    events: VecDeque<SessionEvent>,
}

impl RtpSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            epoch: None,
            senders: HashMap::new(),
            receivers: HashMap::new(),
            next_report: None,
            rtp_queue: VecDeque::new(),
            rtcp_queue: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Registers a sending stream under a freshly drawn SSRC.
    pub fn add_sender(&mut self, payload_type: u8) -> u32 {
        let ssrc = self.draw_ssrc();
        self.senders.insert(
            ssrc,
            SenderStream {
                ssrc,
                payload_type,
                sequencer: Sequencer::new_random(),
                packet_count: 0,
                octet_count: 0,
                last_timestamp: 0,
                cache: VecDeque::new(),
            },
        );
        ssrc
    }

    pub fn sender_ssrcs(&self) -> Vec<u32> {
        self.senders.keys().copied().collect()
    }

    /// Wraps one media frame into an RTP packet, counting and caching it
    /// for retransmission. The caller owns actually sending it.
    pub fn packetize(
        &mut self,
        ssrc: u32,
        timestamp: u32,
        marker: bool,
        payload: Bytes,
        now: Instant,
    ) -> Result<Packet> {
        self.touch(now);
        let cache_size = self.config.retransmit_cache_size;
        let sender = self.senders.get_mut(&ssrc).ok_or(Error::ErrStreamNotExisted)?;

        let packet = Packet {
            header: Header {
                version: 2,
                marker,
                payload_type: sender.payload_type,
                sequence_number: sender.sequencer.next_sequence_number(),
                timestamp,
                ssrc: sender.ssrc,
                ..Default::default()
            },
            payload,
        };
        sender.packet_count = sender.packet_count.wrapping_add(1);
        sender.octet_count = sender.octet_count.wrapping_add(packet.payload.len() as u32);
        sender.last_timestamp = timestamp;
        sender.cache.push_back(packet.clone());
        while sender.cache.len() > cache_size {
            sender.cache.pop_front();
        }
        Ok(packet)
    }

    /// Feeds one inbound RTP packet through collision detection, stream
    /// statistics and the jitter buffer.
    pub fn handle_rtp(&mut self, packet: Packet, now: Instant) {
        self.touch(now);
        let ssrc = packet.header.ssrc;
        if self.senders.contains_key(&ssrc) {
            self.resolve_ssrc_conflict(ssrc);
        }

        let clock_rate = self.config.clock_rate;
        let capacity = self.config.jitter_buffer_capacity;
        let receiver = self.receivers.entry(ssrc).or_insert_with(|| {
            debug!("new inbound rtp stream ssrc={ssrc:08x}");
            ReceiverStream {
                jitter_buffer: JitterBuffer::new(capacity),
                base_ext: 0,
                max_ext: 0,
                received: 0,
                expected_prior: 0,
                received_prior: 0,
                jitter: 0.0,
                last_transit: None,
                first_arrival: None,
                last_sr_ntp_mid: 0,
                last_sr_arrival: None,
            }
        });

        let ext = extend_seq(
            (receiver.received > 0).then_some(receiver.max_ext),
            packet.header.sequence_number,
        );
        if receiver.received == 0 {
            receiver.base_ext = ext;
            receiver.max_ext = ext;
            receiver.first_arrival = Some(now);
        } else if ext > receiver.max_ext {
            receiver.max_ext = ext;
        }
        receiver.received = receiver.received.wrapping_add(1);

        // RFC 3550 appendix A.8 interarrival jitter
        if let Some(first) = receiver.first_arrival {
            let arrival_rtp = now.duration_since(first).as_secs_f64() * f64::from(clock_rate);
            let transit = arrival_rtp as i64 - i64::from(packet.header.timestamp);
            if let Some(last) = receiver.last_transit {
                let d = (transit - last).abs() as f64;
                receiver.jitter += (d - receiver.jitter) / 16.0;
            }
            receiver.last_transit = Some(transit);
        }

        if !receiver.jitter_buffer.push(packet) {
            trace!("dropped duplicate rtp packet on ssrc={ssrc:08x}");
        }
        while let Some(ready) = receiver.jitter_buffer.pop() {
            self.events.push_back(SessionEvent::PacketReceived(ready));
        }
    }

    /// Processes one compound RTCP datagram.
    pub fn handle_rtcp(&mut self, raw: &[u8], now: Instant) -> Result<()> {
        self.touch(now);
        for packet in rtcp::unmarshal_compound(raw)? {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    if let Some(receiver) = self.receivers.get_mut(&sr.ssrc) {
                        receiver.last_sr_ntp_mid = (sr.ntp_time >> 16) as u32;
                        receiver.last_sr_arrival = Some(now);
                    }
                }
                RtcpPacket::TransportLayerNack(nack) => {
                    self.handle_nack(&nack.media_ssrc, &nack.nacks);
                }
                RtcpPacket::ReceiverEstimatedMaximumBitrate(remb) => {
                    self.events
                        .push_back(SessionEvent::BandwidthEstimate(remb.bitrate));
                }
                RtcpPacket::Goodbye(bye) => {
                    for ssrc in bye.sources {
                        self.receivers.remove(&ssrc);
                    }
                }
                RtcpPacket::ReceiverReport(_) | RtcpPacket::SourceDescription(_) => {}
            }
        }
        Ok(())
    }

    /// RTP packets queued for (re)transmission, already sequenced.
    pub fn poll_transmit(&mut self) -> Option<Packet> {
        self.rtp_queue.pop_front()
    }

    /// Compound RTCP datagrams ready to be protected and sent.
    pub fn poll_rtcp_transmit(&mut self) -> Option<BytesMut> {
        self.rtcp_queue.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_report
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let Some(deadline) = self.next_report else {
            return;
        };
        if now < deadline {
            return;
        }
        self.next_report = Some(now + self.config.report_interval);
        if let Ok(report) = self.build_report(now) {
            if !report.is_empty() {
                self.rtcp_queue.push_back(report);
            }
        }
    }

    /// Queues a BYE for every sending stream.
    pub fn goodbye(&mut self, reason: &str) -> Result<()> {
        if self.senders.is_empty() {
            return Ok(());
        }
        let bye = RtcpPacket::Goodbye(Goodbye {
            sources: self.senders.keys().copied().collect(),
            reason: reason.to_string(),
        });
        self.rtcp_queue.push_back(bye.marshal()?);
        Ok(())
    }

    fn handle_nack(&mut self, media_ssrc: &u32, nacks: &[crate::rtcp::NackPair]) {
        let Some(sender) = self.senders.get(media_ssrc) else {
            return;
        };
        for pair in nacks {
            for seq in pair.packet_list() {
                if let Some(cached) = sender
                    .cache
                    .iter()
                    .find(|p| p.header.sequence_number == seq)
                {
                    trace!("retransmitting seq={seq} on ssrc={media_ssrc:08x}");
                    self.rtp_queue.push_back(cached.clone());
                }
            }
        }
    }

    /// Moves a sender whose SSRC collided with an inbound stream onto a
    /// fresh SSRC. Cached packets carry the old SSRC and are discarded.
    fn resolve_ssrc_conflict(&mut self, old_ssrc: u32) {
        let new_ssrc = self.draw_ssrc();
        if let Some(mut sender) = self.senders.remove(&old_ssrc) {
            debug!("ssrc conflict: moving sender {old_ssrc:08x} to {new_ssrc:08x}");
            sender.ssrc = new_ssrc;
            sender.cache.clear();
            self.senders.insert(new_ssrc, sender);
            self.events.push_back(SessionEvent::SsrcConflict {
                old_ssrc,
                new_ssrc,
            });
        }
    }

    fn draw_ssrc(&self) -> u32 {
        loop {
            let ssrc = rand::random::<u32>();
            if ssrc != 0
                && !self.senders.contains_key(&ssrc)
                && !self.receivers.contains_key(&ssrc)
            {
                return ssrc;
            }
        }
    }

    fn touch(&mut self, now: Instant) {
        if self.epoch.is_none() {
            self.epoch = Some(now);
        }
        if self.next_report.is_none() {
            self.next_report = Some(now + self.config.report_interval);
        }
    }

    fn build_report(&mut self, now: Instant) -> Result<BytesMut> {
        let reception_reports: Vec<ReceptionReport> = self
            .receivers
            .iter_mut()
            .map(|(ssrc, receiver)| receiver.reception_report(*ssrc, now))
            .collect();

        let mut packets: Vec<RtcpPacket> = vec![];
        let mut reports = reception_reports;
        if let Some(sender) = self.senders.values().next() {
            packets.push(RtcpPacket::SenderReport(SenderReport {
                ssrc: sender.ssrc,
                ntp_time: self.ntp_time(now),
                rtp_time: sender.last_timestamp,
                packet_count: sender.packet_count,
                octet_count: sender.octet_count,
                reports: std::mem::take(&mut reports),
            }));
        } else if !reports.is_empty() {
            packets.push(RtcpPacket::ReceiverReport(ReceiverReport {
                // receiver-only endpoints still need a reporting ssrc
                ssrc: 1,
                reports: std::mem::take(&mut reports),
            }));
        }

        if !self.senders.is_empty() {
            packets.push(RtcpPacket::SourceDescription(SourceDescription {
                chunks: self
                    .senders
                    .keys()
                    .map(|ssrc| SdesChunk {
                        ssrc: *ssrc,
                        cname: self.config.cname.clone(),
                    })
                    .collect(),
            }));
        }

        rtcp::marshal_compound(&packets)
    }

    fn ntp_time(&self, now: Instant) -> u64 {
        let since_epoch = self.epoch.map_or(Duration::ZERO, |e| now.duration_since(e));
        let unix = self
            .config
            .wallclock_origin
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            + since_epoch;
        let secs = unix.as_secs() + NTP_EPOCH_OFFSET;
        let frac = (u64::from(unix.subsec_nanos()) << 32) / 1_000_000_000;
        (secs << 32) | frac
    }
}

impl ReceiverStream {
    /// RFC 3550 appendix A.3 loss accounting.
    fn reception_report(&mut self, ssrc: u32, now: Instant) -> ReceptionReport {
        let expected = (self.max_ext - self.base_ext + 1) as u32;
        let lost = expected.saturating_sub(self.received).min(0x00FF_FFFF);

        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval * 256) / expected_interval) as u8
        };

        let delay = self.last_sr_arrival.map_or(0, |at| {
            (now.duration_since(at).as_secs_f64() * 65536.0) as u32
        });

        ReceptionReport {
            ssrc,
            fraction_lost,
            total_lost: lost,
            last_sequence_number: (self.max_ext - (1 << 16)) as u32,
            jitter: self.jitter as u32,
            last_sender_report: self.last_sr_ntp_mid,
            delay,
        }
    }
}

/// Maps a 16-bit sequence number onto the extended sequence space used
/// by the receiver statistics; mirrors the jitter buffer's tracking.
fn extend_seq(max: Option<u64>, seq: u16) -> u64 {
    let Some(max) = max else {
        return u64::from(seq) + (1 << 16);
    };
    let max_seq = max as u16;
    let forward = seq.wrapping_sub(max_seq);
    if forward < 0x8000 {
        max + u64::from(forward)
    } else {
        max.saturating_sub(u64::from(max_seq.wrapping_sub(seq)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn session() -> RtpSession {
        RtpSession::new(SessionConfig {
            cname: "test".to_string(),
            clock_rate: 8000,
            report_interval: Duration::from_millis(100),
            ..Default::default()
        })
    }

    fn inbound(ssrc: u32, seq: u16, timestamp: u32) -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type: 8,
                sequence_number: seq,
                timestamp,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from_static(b"pcm"),
        }
    }

    #[test]
    fn test_packetize_sequences_and_counts() {
        let mut session = session();
        let now = Instant::now();
        let ssrc = session.add_sender(111);

        let first = session
            .packetize(ssrc, 960, true, Bytes::from_static(b"abc"), now)
            .unwrap();
        let second = session
            .packetize(ssrc, 1920, false, Bytes::from_static(b"defg"), now)
            .unwrap();

        assert_eq!(
            second.header.sequence_number,
            first.header.sequence_number.wrapping_add(1)
        );
        assert_eq!(first.header.ssrc, ssrc);
        assert_eq!(first.header.payload_type, 111);

        let sender = &session.senders[&ssrc];
        assert_eq!(sender.packet_count, 2);
        assert_eq!(sender.octet_count, 7);
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let mut session = session();
        let result = session.packetize(42, 0, false, Bytes::new(), Instant::now());
        assert_eq!(result.unwrap_err(), Error::ErrStreamNotExisted);
    }

    #[test]
    fn test_nack_triggers_retransmission() {
        let mut session = session();
        let now = Instant::now();
        let ssrc = session.add_sender(96);

        let mut sent = vec![];
        for i in 0..3u32 {
            sent.push(
                session
                    .packetize(ssrc, i * 960, false, Bytes::from_static(b"x"), now)
                    .unwrap(),
            );
        }
        let lost_seq = sent[1].header.sequence_number;

        let nack = RtcpPacket::TransportLayerNack(crate::rtcp::TransportLayerNack {
            sender_ssrc: 2,
            media_ssrc: ssrc,
            nacks: vec![crate::rtcp::NackPair {
                packet_id: lost_seq,
                lost_packets: 0,
            }],
        });
        session.handle_rtcp(&nack.marshal().unwrap(), now).unwrap();

        let resent = session.poll_transmit().unwrap();
        assert_eq!(resent, sent[1]);
        assert!(session.poll_transmit().is_none());
    }

    #[test]
    fn test_ssrc_conflict_moves_sender() {
        let mut session = session();
        let now = Instant::now();
        let ssrc = session.add_sender(96);

        session.handle_rtp(inbound(ssrc, 1, 0), now);

        match session.poll_event() {
            Some(SessionEvent::SsrcConflict { old_ssrc, new_ssrc }) => {
                assert_eq!(old_ssrc, ssrc);
                assert_ne!(new_ssrc, ssrc);
                assert!(session.senders.contains_key(&new_ssrc));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // the inbound packet itself still gets delivered
        assert!(matches!(
            session.poll_event(),
            Some(SessionEvent::PacketReceived(_))
        ));
    }

    #[test]
    fn test_receiver_report_counts_losses() {
        let mut session = session();
        let now = Instant::now();
        for seq in [1u16, 2, 3, 5] {
            session.handle_rtp(inbound(0x33, seq, u32::from(seq) * 160), now);
        }

        let later = now + Duration::from_millis(200);
        session.handle_timeout(later);
        let raw = session.poll_rtcp_transmit().unwrap();
        let packets = rtcp::unmarshal_compound(&raw).unwrap();

        let RtcpPacket::ReceiverReport(rr) = &packets[0] else {
            panic!("expected receiver report, got {packets:?}");
        };
        assert_eq!(rr.reports.len(), 1);
        assert_eq!(rr.reports[0].ssrc, 0x33);
        assert_eq!(rr.reports[0].total_lost, 1);
        assert_eq!(rr.reports[0].last_sequence_number, 5);
    }

    #[test]
    fn test_sender_report_generated() {
        let mut session = session();
        let now = Instant::now();
        let ssrc = session.add_sender(96);
        session
            .packetize(ssrc, 3000, false, Bytes::from_static(b"frame"), now)
            .unwrap();

        let later = now + Duration::from_millis(200);
        session.handle_timeout(later);
        let raw = session.poll_rtcp_transmit().unwrap();
        let packets = rtcp::unmarshal_compound(&raw).unwrap();

        let RtcpPacket::SenderReport(sr) = &packets[0] else {
            panic!("expected sender report, got {packets:?}");
        };
        assert_eq!(sr.ssrc, ssrc);
        assert_eq!(sr.packet_count, 1);
        assert_eq!(sr.octet_count, 5);
        assert_eq!(sr.rtp_time, 3000);
        assert!(matches!(&packets[1], RtcpPacket::SourceDescription(_)));
    }

    #[test]
    fn test_remb_surfaces_bandwidth_estimate() {
        let mut session = session();
        let remb = RtcpPacket::ReceiverEstimatedMaximumBitrate(
            crate::rtcp::ReceiverEstimatedMaximumBitrate {
                sender_ssrc: 9,
                bitrate: 250_000,
                ssrcs: vec![],
            },
        );
        session
            .handle_rtcp(&remb.marshal().unwrap(), Instant::now())
            .unwrap();
        assert_eq!(
            session.poll_event(),
            Some(SessionEvent::BandwidthEstimate(250_000))
        );
    }
}
