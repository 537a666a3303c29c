use sorted_vec::SortedSet;

/// Dropped-input bookkeeping is bounded; when it overflows the oldest
/// entries are folded into the base offset.
const DROP_CAP: usize = 1024;

/// Maps one counter space onto a continuous output space across stream
/// switches and selective drops.
///
/// Used for RTP sequence numbers, VP8 picture ids, tl0picidx and keyidx:
/// anything that must keep incrementing by exactly one on the wire while the
/// forwarder splices sources and skips packets. `MAX` is the wrap modulus of
/// the wire counter (2^16 for sequence numbers, 2^15 for picture ids, ...).
///
/// The first generated value passes through unchanged; `sync_next` arms a
/// resynchronization so the next input continues one past the highest output
/// so far, which is what a layer switch needs.
#[derive(Clone)]
pub struct SeqRewrite<const MAX: u64> {
    base: u64,
    max_input: u64,
    max_output: u64,
    ext_cycles: u64,
    dropped: SortedSet<u64>,
    pending_sync: bool,
    pending_offset: Option<u64>,
}

impl<const MAX: u64> Default for SeqRewrite<MAX> {
    fn default() -> Self {
        Self {
            base: 0,
            max_input: 0,
            max_output: 0,
            ext_cycles: 0,
            dropped: SortedSet::with_capacity(DROP_CAP),
            pending_sync: false,
            pending_offset: None,
        }
    }
}

impl<const MAX: u64> SeqRewrite<MAX> {
    /// Arm a resync: the next input is treated as the start of a new stream
    /// and mapped to `max_output + 1`.
    pub fn sync_next(&mut self) {
        self.pending_sync = true;
    }

    /// Push the output space forward, e.g. after synthesizing padding
    /// packets that consumed output values.
    pub fn offset(&mut self, n: u64) {
        if self.pending_sync {
            self.pending_offset = Some(self.pending_offset.unwrap_or(0) + n);
        } else {
            self.base = self.wrap_add(self.base, n);
        }
    }

    /// Record `input` as intentionally skipped so later inputs compact over
    /// the hole.
    pub fn drop_value(&mut self, input: u64) {
        debug_assert!(input < MAX);
        self.apply_pending_sync(input);

        let ext = self.extend(input);
        if self.newer_than_max(input) {
            self.dropped.push(ext);
        }

        if self.dropped.len() > DROP_CAP {
            let excess = self.dropped.len() - DROP_CAP;
            self.dropped.drain(0..excess);
            self.base = self.wrap_sub(self.base, excess as u64);
        }
    }

    /// Map `input` into the output space. Returns `None` when the input was
    /// previously dropped.
    pub fn generate(&mut self, input: u64) -> Option<u64> {
        debug_assert!(input < MAX);
        self.apply_pending_sync(input);

        let ext = self.extend(input);
        let mut base = self.base;
        if !self.dropped.is_empty() {
            match self.dropped.binary_search(&ext) {
                Ok(_) => return None,
                // compact the output over every dropped input before this one
                Err(before) => base = self.wrap_sub(self.base, before as u64),
            }
        }

        let output = self.wrap_add(input, base);
        if self.wrap_sub(input, self.max_input) < MAX / 2 {
            self.max_input = input;
        }
        if self.wrap_sub(output, self.max_output) < MAX / 2 {
            self.max_output = output;
        }
        Some(output)
    }

    fn apply_pending_sync(&mut self, input: u64) {
        if self.pending_sync {
            self.pending_sync = false;
            self.resync_to(self.wrap_sub(input, 1));
            if let Some(n) = self.pending_offset.take() {
                self.offset(n);
            }
        }
    }

    /// Align the generator so `value` maps to the highest output produced so
    /// far; the caller passes the predecessor of the new stream's first input.
    fn resync_to(&mut self, value: u64) {
        self.base = self.wrap_sub(self.max_output, value);
        self.max_input = value;
        self.ext_cycles = 0;
        self.dropped.clear();
    }

    fn extend(&mut self, value: u64) -> u64 {
        if value < self.max_input && self.max_input - value > MAX / 2 {
            self.ext_cycles += MAX;
        }
        self.ext_cycles + value
    }

    fn newer_than_max(&self, value: u64) -> bool {
        (value > self.max_input && value - self.max_input <= MAX / 2) || (self.max_input > value && self.max_input - value > MAX / 2)
    }

    fn wrap_add(&self, a: u64, b: u64) -> u64 {
        (a + b) % MAX
    }

    fn wrap_sub(&self, a: u64, b: u64) -> u64 {
        if a >= b {
            a - b
        } else {
            a + MAX - b
        }
    }
}
