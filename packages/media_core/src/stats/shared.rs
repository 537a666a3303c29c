use std::sync::{Arc, RwLock};

use super::rtp_stats::{FlowState, RtpDeltaInfo, RtpStats, SenderReportData};

/// Thread-sharing wrapper for [`RtpStats`], the one core structure touched
/// from more than one thread: the ingress thread updates counters while
/// snapshot readers fetch deltas. Writes take the write lock, snapshot reads
/// see a consistent view under it.
#[derive(Clone)]
pub struct SharedRtpStats {
    inner: Arc<RwLock<RtpStats>>,
}

impl SharedRtpStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RtpStats::new(clock_rate))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(&self, now_ms: u64, seq: u16, ts: u32, marker: bool, header_size: u16, payload_size: usize, padding_size: usize) -> FlowState {
        self.inner.write().expect("rtp stats lock poisoned").update(now_ms, seq, ts, marker, header_size, payload_size, padding_size)
    }

    pub fn new_snapshot_id(&self, now_ms: u64) -> u32 {
        self.inner.write().expect("rtp stats lock poisoned").new_snapshot_id(now_ms)
    }

    /// Snapshot rotation mutates the watermark, so delta reads go through
    /// the write lock as well; plain counter reads below use the read lock.
    pub fn delta_info(&self, now_ms: u64, snapshot_id: u32) -> Option<RtpDeltaInfo> {
        self.inner.write().expect("rtp stats lock poisoned").delta_info(now_ms, snapshot_id)
    }

    pub fn reception_report(&self, now_ms: u64, ssrc: u32, proxy_frac_lost: u8, snapshot_id: u32) -> Option<rtcp::reception_report::ReceptionReport> {
        self.inner.write().expect("rtp stats lock poisoned").reception_report(now_ms, ssrc, proxy_frac_lost, snapshot_id)
    }

    pub fn set_sender_report_data(&self, sr: SenderReportData) {
        self.inner.write().expect("rtp stats lock poisoned").set_sender_report_data(sr)
    }

    pub fn packets_lost(&self) -> u32 {
        self.inner.read().expect("rtp stats lock poisoned").packets_lost()
    }

    pub fn packets_expected(&self) -> u32 {
        self.inner.read().expect("rtp stats lock poisoned").packets_expected()
    }

    pub fn jitter(&self) -> f64 {
        self.inner.read().expect("rtp stats lock poisoned").jitter()
    }

    pub fn with_stats<R>(&self, f: impl FnOnce(&mut RtpStats) -> R) -> R {
        f(&mut self.inner.write().expect("rtp stats lock poisoned"))
    }
}
