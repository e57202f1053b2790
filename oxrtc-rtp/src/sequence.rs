/// Monotonic RTP sequence number generator with rollover tracking.
#[derive(Debug, Clone)]
pub struct Sequencer {
    sequence_number: u16,
    roll_over_count: u64,
}

impl Sequencer {
    pub fn new(start: u16) -> Self {
        Self {
            sequence_number: start,
            roll_over_count: 0,
        }
    }

    pub fn new_random() -> Self {
        Self::new(rand::random::<u16>())
    }

    pub fn next_sequence_number(&mut self) -> u16 {
        let current = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        if self.sequence_number == 0 {
            self.roll_over_count += 1;
        }
        current
    }

    pub fn roll_over_count(&self) -> u64 {
        self.roll_over_count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sequence_increments() {
        let mut seq = Sequencer::new(100);
        assert_eq!(seq.next_sequence_number(), 100);
        assert_eq!(seq.next_sequence_number(), 101);
        assert_eq!(seq.roll_over_count(), 0);
    }

    #[test]
    fn test_rollover_counted() {
        let mut seq = Sequencer::new(u16::MAX);
        assert_eq!(seq.next_sequence_number(), u16::MAX);
        assert_eq!(seq.next_sequence_number(), 0);
        assert_eq!(seq.roll_over_count(), 1);
    }
}
