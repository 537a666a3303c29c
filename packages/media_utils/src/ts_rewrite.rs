/// Outbound frame cadence assumed when jumping the clock at a resync.
const REINIT_FRAME_RATE: u64 = 30;

#[derive(Clone)]
enum State {
    FirstInit,
    Resync,
    Rewriting,
}

/// Rewrites RTP timestamps into one continuous outbound clock across stream
/// switches.
///
/// The first timestamp passes through unchanged. After `sync_next` (a layer
/// switch) the next input is anchored so the output advances from the last
/// emitted timestamp by the wall-clock gap projected onto the media clock,
/// with a minimum jump of one frame at the nominal cadence so the outbound
/// clock never stalls or rewinds. `MAX` is the wrap modulus (2^32 for RTP).
#[derive(Clone)]
pub struct TsRewrite<const MAX: u64> {
    clock_rate: u64,
    /// One frame at the assumed cadence, the smallest advance a resync takes.
    reinit_jump: u64,
    state: State,
    delta: i64,
    last_extended: i64,
    last_input: u64,
    last_now_ms: u64,
}

impl<const MAX: u64> TsRewrite<MAX> {
    pub fn new(clock_rate: u64) -> Self {
        Self {
            clock_rate,
            reinit_jump: (clock_rate / REINIT_FRAME_RATE).max(1),
            state: State::FirstInit,
            delta: 0,
            last_extended: 0,
            last_input: 0,
            last_now_ms: 0,
        }
    }

    /// Arm a resync for the next input, called when the source stream
    /// changes.
    pub fn sync_next(&mut self) {
        self.state = State::Resync;
    }

    pub fn generate(&mut self, now_ms: u64, ts: u64) -> u64 {
        match self.state {
            State::FirstInit => {
                self.delta = 0;
                self.last_input = ts;
                self.last_extended = ts as i64;
                self.last_now_ms = now_ms;
                self.state = State::Rewriting;
            }
            State::Resync => {
                let elapsed_ticks = now_ms.saturating_sub(self.last_now_ms) * self.clock_rate / 1000;
                let target = self.last_extended + elapsed_ticks.max(self.reinit_jump) as i64;
                self.delta = target - ts as i64;
                self.last_input = ts;
                self.last_extended = target;
                self.last_now_ms = now_ms;
                self.state = State::Rewriting;
            }
            State::Rewriting => {
                if (self.last_input as i64) + (MAX as i64) / 2 < ts as i64 {
                    // straggler from the previous cycle, map without advancing
                    return ((self.delta + ts as i64).rem_euclid(MAX as i64)) as u64;
                }
                if (ts as i64) + (MAX as i64) / 2 < self.last_input as i64 {
                    // input clock wrapped
                    self.delta += MAX as i64;
                }
                self.last_input = ts;
                self.last_extended = self.delta + ts as i64;
                self.last_now_ms = now_ms;
            }
        }

        (self.last_extended.rem_euclid(MAX as i64)) as u64
    }
}
