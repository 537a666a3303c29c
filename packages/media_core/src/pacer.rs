//! Outbound rate shaping.
//!
//! The per-packet path enqueues, the subscriber loop drains at `now_ms`.
//! [`PassThroughPacer`] releases immediately for transports that pace
//! themselves; [`LeakyBucketPacer`] shapes to a target bitrate and releases
//! probe padding only when the media queue is idle.

use std::collections::VecDeque;

use media_forward_protocol::media::ExtPacket;

use crate::transport::TrackId;

/// Burst ceiling so a stalled drain does not dump unbounded bytes at once.
const MAX_BURST_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct PacedPacket {
    pub track: TrackId,
    pub pkt: ExtPacket,
    pub padding: bool,
}

impl PacedPacket {
    fn wire_size(&self) -> u64 {
        self.pkt.header_size as u64 + self.pkt.payload_size as u64 + self.pkt.padding_size as u64
    }
}

pub trait Pacer {
    fn enqueue(&mut self, now_ms: u64, pkt: PacedPacket);
    fn set_target_bitrate(&mut self, bps: u64);
    /// Ask for `bytes` of probe padding to be released when idle.
    fn request_padding(&mut self, bytes: u64);
    /// Bytes of padding the caller should synthesize and enqueue now.
    fn padding_due(&mut self, now_ms: u64) -> u64;
    fn pop(&mut self, now_ms: u64) -> Option<PacedPacket>;
    /// Release everything regardless of budget, used on close.
    fn drain(&mut self) -> Vec<PacedPacket>;
    fn queue_len(&self) -> usize;
}

/// No shaping, the transport paces.
#[derive(Default)]
pub struct PassThroughPacer {
    queue: VecDeque<PacedPacket>,
    padding_debt: u64,
}

impl Pacer for PassThroughPacer {
    fn enqueue(&mut self, _now_ms: u64, pkt: PacedPacket) {
        self.queue.push_back(pkt);
    }

    fn set_target_bitrate(&mut self, _bps: u64) {}

    fn request_padding(&mut self, bytes: u64) {
        self.padding_debt += bytes;
    }

    fn padding_due(&mut self, _now_ms: u64) -> u64 {
        std::mem::take(&mut self.padding_debt)
    }

    fn pop(&mut self, _now_ms: u64) -> Option<PacedPacket> {
        self.queue.pop_front()
    }

    fn drain(&mut self) -> Vec<PacedPacket> {
        self.queue.drain(..).collect()
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Byte-budget shaping at a target bitrate.
pub struct LeakyBucketPacer {
    target_bps: u64,
    budget_bytes: u64,
    last_refill_ms: Option<u64>,
    queue: VecDeque<PacedPacket>,
    padding_debt: u64,
}

impl LeakyBucketPacer {
    pub fn new(target_bps: u64) -> Self {
        Self {
            target_bps,
            budget_bytes: MAX_BURST_BYTES,
            last_refill_ms: None,
            queue: VecDeque::new(),
            padding_debt: 0,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let last = self.last_refill_ms.unwrap_or(now_ms);
        let elapsed = now_ms.saturating_sub(last);
        self.budget_bytes = (self.budget_bytes + elapsed * self.target_bps / 8 / 1000).min(MAX_BURST_BYTES);
        self.last_refill_ms = Some(now_ms);
    }
}

impl Pacer for LeakyBucketPacer {
    fn enqueue(&mut self, now_ms: u64, pkt: PacedPacket) {
        self.refill(now_ms);
        self.queue.push_back(pkt);
    }

    fn set_target_bitrate(&mut self, bps: u64) {
        self.target_bps = bps;
    }

    fn request_padding(&mut self, bytes: u64) {
        self.padding_debt += bytes;
    }

    fn padding_due(&mut self, now_ms: u64) -> u64 {
        self.refill(now_ms);
        if !self.queue.is_empty() || self.padding_debt == 0 {
            return 0;
        }
        let due = self.padding_debt.min(self.budget_bytes);
        self.padding_debt -= due;
        self.budget_bytes -= due;
        due
    }

    fn pop(&mut self, now_ms: u64) -> Option<PacedPacket> {
        self.refill(now_ms);
        let size = self.queue.front().map(|p| p.wire_size())?;
        if size > self.budget_bytes {
            return None;
        }
        self.budget_bytes -= size;
        self.queue.pop_front()
    }

    fn drain(&mut self) -> Vec<PacedPacket> {
        self.queue.drain(..).collect()
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
