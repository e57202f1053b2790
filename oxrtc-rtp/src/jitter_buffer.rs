use std::collections::{BTreeMap, VecDeque};

use shared::replay_detector::SlidingWindowDetector;

use crate::packet::Packet;

const DUP_WINDOW: u64 = 128;

/// Bounded reordering buffer keyed by extended sequence number.
///
/// Packets at or past the next expected sequence number are held until
/// the gap before them fills or the buffer overflows; packets older than
/// the expected sequence number are emitted immediately since reordering
/// can no longer help them, and duplicates are dropped.
pub struct JitterBuffer {
    capacity: usize,
    next_out: Option<u64>,
    max_received: Option<u64>,
    buffer: BTreeMap<u64, Packet>,
    ready: VecDeque<Packet>,
    seen: SlidingWindowDetector,
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_out: None,
            max_received: None,
            buffer: BTreeMap::new(),
            ready: VecDeque::new(),
            seen: SlidingWindowDetector::new(DUP_WINDOW),
        }
    }

    /// Returns false when the packet was dropped as a duplicate.
    pub fn push(&mut self, packet: Packet) -> bool {
        let ext = self.extend(packet.header.sequence_number);
        if !self.seen.check(ext) {
            return false;
        }
        self.seen.accept();
        if self.max_received.map_or(true, |m| ext > m) {
            self.max_received = Some(ext);
        }

        match self.next_out {
            Some(next) if ext < next => {
                // too late to reorder
                self.ready.push_back(packet);
            }
            _ => {
                self.buffer.insert(ext, packet);
                self.drain();
            }
        }
        true
    }

    pub fn pop(&mut self) -> Option<Packet> {
        self.ready.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&mut self) {
        loop {
            let Some((&lowest, _)) = self.buffer.first_key_value() else {
                return;
            };
            let in_sequence = match self.next_out {
                None => true,
                Some(next) => lowest == next,
            };
            // overflowing the window forfeits the missing packets
            if in_sequence || self.buffer.len() > self.capacity {
                if let Some(packet) = self.buffer.remove(&lowest) {
                    self.ready.push_back(packet);
                }
                self.next_out = Some(lowest + 1);
            } else {
                return;
            }
        }
    }

    /// Maps a 16-bit sequence number onto the nearest point of the
    /// extended sequence space.
    fn extend(&self, seq: u16) -> u64 {
        let Some(max) = self.max_received else {
            // leave headroom so early late arrivals stay representable
            return u64::from(seq) + (1 << 16);
        };
        let max_seq = max as u16;
        let forward = seq.wrapping_sub(max_seq);
        if forward < 0x8000 {
            max + u64::from(forward)
        } else {
            let backward = u64::from(max_seq.wrapping_sub(seq));
            max.saturating_sub(backward)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::Header;

    fn packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn popped(buffer: &mut JitterBuffer) -> Vec<u16> {
        let mut seqs = vec![];
        while let Some(p) = buffer.pop() {
            seqs.push(p.header.sequence_number);
        }
        seqs
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut jb = JitterBuffer::new(16);
        for seq in 10..13 {
            assert!(jb.push(packet(seq)));
        }
        assert_eq!(popped(&mut jb), vec![10, 11, 12]);
    }

    #[test]
    fn test_reordering_within_window() {
        let mut jb = JitterBuffer::new(16);
        jb.push(packet(1));
        assert_eq!(popped(&mut jb), vec![1]);

        jb.push(packet(3));
        jb.push(packet(4));
        assert_eq!(popped(&mut jb), vec![]);

        jb.push(packet(2));
        assert_eq!(popped(&mut jb), vec![2, 3, 4]);
    }

    #[test]
    fn test_overflow_skips_gap() {
        let mut jb = JitterBuffer::new(3);
        jb.push(packet(1));
        jb.pop();
        // packet 2 never arrives
        for seq in [3, 4, 5, 6] {
            jb.push(packet(seq));
        }
        assert_eq!(popped(&mut jb), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_late_packet_emitted_immediately() {
        let mut jb = JitterBuffer::new(2);
        jb.push(packet(10));
        jb.push(packet(12));
        jb.push(packet(13));
        jb.push(packet(14));
        // the gap at 11 was already skipped by overflow
        assert_eq!(popped(&mut jb), vec![10, 12, 13, 14]);

        assert!(jb.push(packet(11)));
        assert_eq!(popped(&mut jb), vec![11]);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut jb = JitterBuffer::new(16);
        assert!(jb.push(packet(5)));
        assert!(!jb.push(packet(5)));
        assert_eq!(popped(&mut jb), vec![5]);
        assert!(!jb.push(packet(5)));
        assert_eq!(popped(&mut jb), vec![]);
    }

    #[test]
    fn test_sequence_wrap() {
        let mut jb = JitterBuffer::new(16);
        jb.push(packet(65534));
        jb.push(packet(65535));
        jb.push(packet(0));
        jb.push(packet(1));
        assert_eq!(popped(&mut jb), vec![65534, 65535, 0, 1]);
    }
}
