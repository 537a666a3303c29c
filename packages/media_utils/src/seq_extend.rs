const CYCLE: u64 = 1 << 16;
const HALF_CYCLE: u16 = 1 << 15;

/// Extends 16-bit RTP sequence numbers into a 64-bit space by tracking
/// wraparound cycles.
#[derive(Default, Clone)]
pub struct SeqExtend {
    last_seq: Option<u16>,
    cycles: u64,
}

impl SeqExtend {
    /// Extend `seq` into 64 bits. Returns `None` for a straggler from before
    /// the first observed cycle, which cannot be represented without going
    /// negative.
    pub fn generate(&mut self, seq: u16) -> Option<u64> {
        let last = match self.last_seq {
            Some(last) => last,
            None => {
                self.last_seq = Some(seq);
                return Some(seq as u64);
            }
        };

        if seq > last && seq - last > HALF_CYCLE {
            // from the previous cycle, do not move the cycle counter
            return (seq as u64 + self.cycles).checked_sub(CYCLE);
        }

        if seq < last && last - seq > HALF_CYCLE {
            self.cycles += CYCLE;
            log::trace!("[SeqExtend] wrapped {} => {}, cycles {}", last, seq, self.cycles >> 16);
        }
        self.last_seq = Some(seq);
        Some(seq as u64 + self.cycles)
    }
}
