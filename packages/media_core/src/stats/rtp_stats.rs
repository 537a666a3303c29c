use std::collections::HashMap;

use media_forward_utils::{ntp_to_unix_ms, unix_ms_to_ntp};

const SN_INFO_SIZE: usize = 8192;
const SN_INFO_MASK: usize = SN_INFO_SIZE - 1;
const GAP_HISTOGRAM_BINS: usize = 101;
const SEQ_SPACE: u32 = 1 << 16;
const FIRST_SNAPSHOT_ID: u32 = 1;

/// Skew between expected and observed SR clocks beyond which a "time warp"
/// is logged. Assumes NTP and the monotonic clock are not independently
/// stepped during a call.
const TIME_WARP_SKEW_MS: u64 = 200;

/// Per-packet result of [`RtpStats::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowState {
    pub has_loss: bool,
    /// First sequence number of the loss run, inclusive.
    pub loss_start: u16,
    /// End of the loss run, exclusive.
    pub loss_end: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct SnInfo {
    pkt_size: u16,
    hdr_size: u16,
    padding_only: bool,
    marker: bool,
    out_of_order: bool,
}

/// RTP timestamp / NTP anchor taken from (or produced for) an RTCP sender
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReportData {
    pub rtp_ts: u32,
    /// 64-bit extension of `rtp_ts`, survives 32-bit wraparound.
    pub rtp_ts_ext: u64,
    /// 32.32 fixed-point NTP timestamp.
    pub ntp_ts: u64,
    /// Local arrival (or departure) in monotonic milliseconds.
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    start_ms: u64,
    ext_start_sn: u32,
    packets_duplicate: u32,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    nacks: u32,
    plis: u32,
    firs: u32,
    max_rtt: u32,
    max_jitter: f64,
}

/// Counters accumulated between two reads of the same snapshot id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtpDeltaInfo {
    pub start_ms: u64,
    pub duration_ms: u64,
    pub packets: u32,
    pub bytes: u64,
    pub header_bytes: u64,
    pub packets_duplicate: u32,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,
    pub packets_padding: u32,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,
    pub packets_lost: u32,
    pub packets_out_of_order: u32,
    pub frames: u32,
    pub rtt_max: u32,
    pub jitter_max_us: f64,
    pub nacks: u32,
    pub plis: u32,
    pub firs: u32,
}

struct IntervalStats {
    packets: u32,
    bytes: u64,
    header_bytes: u64,
    packets_padding: u32,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_lost: u32,
    packets_out_of_order: u32,
    frames: u32,
}

/// Tracks every packet seen on one stream, either direction: extended
/// sequence/timestamp spaces, loss, duplicates, reordering, jitter, drift,
/// sender-report anchors and named snapshot deltas for report generators.
pub struct RtpStats {
    clock_rate: u32,

    initialized: bool,
    resync_next: bool,
    ended: bool,

    start_ms: u64,

    ext_start_sn: u32,
    highest_sn: u16,
    cycles: u16,

    ext_start_ts: u64,
    highest_ts: u32,
    ts_cycles: u32,

    first_ms: u64,
    highest_ms: u64,

    last_transit: u32,
    last_jitter_ts: u32,

    bytes: u64,
    header_bytes: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_duplicate: u32,
    packets_padding: u32,
    packets_out_of_order: u32,
    packets_lost: u32,
    frames: u32,

    jitter: f64,
    max_jitter: f64,

    sn_infos: Box<[SnInfo; SN_INFO_SIZE]>,
    sn_write_ptr: usize,

    gap_histogram: [u32; GAP_HISTOGRAM_BINS],

    nacks: u32,
    plis: u32,
    last_pli_ms: u64,
    firs: u32,
    last_fir_ms: u64,
    key_frames: u32,
    last_key_frame_ms: u64,

    rtt: u32,
    max_rtt: u32,

    last_rr_ms: Option<u64>,
    ext_highest_sn_rr: u32,
    packets_lost_rr: u32,

    sr_first: Option<SenderReportData>,
    sr_newest: Option<SenderReportData>,

    next_snapshot_id: u32,
    snapshots: HashMap<u32, Snapshot>,
}

impl RtpStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            initialized: false,
            resync_next: false,
            ended: false,
            start_ms: 0,
            ext_start_sn: 0,
            highest_sn: 0,
            cycles: 0,
            ext_start_ts: 0,
            highest_ts: 0,
            ts_cycles: 0,
            first_ms: 0,
            highest_ms: 0,
            last_transit: 0,
            last_jitter_ts: 0,
            bytes: 0,
            header_bytes: 0,
            bytes_duplicate: 0,
            header_bytes_duplicate: 0,
            bytes_padding: 0,
            header_bytes_padding: 0,
            packets_duplicate: 0,
            packets_padding: 0,
            packets_out_of_order: 0,
            packets_lost: 0,
            frames: 0,
            jitter: 0.0,
            max_jitter: 0.0,
            sn_infos: Box::new([SnInfo::default(); SN_INFO_SIZE]),
            sn_write_ptr: 0,
            gap_histogram: [0; GAP_HISTOGRAM_BINS],
            nacks: 0,
            plis: 0,
            last_pli_ms: 0,
            firs: 0,
            last_fir_ms: 0,
            key_frames: 0,
            last_key_frame_ms: 0,
            rtt: 0,
            max_rtt: 0,
            last_rr_ms: None,
            ext_highest_sn_rr: 0,
            packets_lost_rr: 0,
            sr_first: None,
            sr_newest: None,
            next_snapshot_id: FIRST_SNAPSHOT_ID,
            snapshots: HashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.initialized && !self.ended
    }

    pub fn stop(&mut self) {
        self.ended = true;
    }

    /// Re-anchor the highest seen sequence/timestamp on the next packet.
    /// Used when the stream source behind this ssrc is replaced.
    pub fn resync_on_next_packet(&mut self) {
        self.resync_next = true;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(&mut self, now_ms: u64, seq: u16, ts: u32, marker: bool, header_size: u16, payload_size: usize, padding_size: usize) -> FlowState {
        let mut flow = FlowState::default();
        if self.ended {
            return flow;
        }

        let mut first = false;
        if !self.initialized {
            self.initialized = true;
            self.start_ms = now_ms;

            self.ext_start_sn = seq as u32;
            self.highest_sn = seq.wrapping_sub(1);
            self.cycles = 0;

            self.ext_start_ts = ts as u64;
            self.highest_ts = ts;
            self.ts_cycles = 0;

            self.first_ms = now_ms;
            self.highest_ms = now_ms;

            first = true;

            for id in FIRST_SNAPSHOT_ID..self.next_snapshot_id {
                self.snapshots.insert(
                    id,
                    Snapshot {
                        start_ms: self.start_ms,
                        ext_start_sn: self.ext_start_sn,
                        ..Default::default()
                    },
                );
            }
        }

        if self.resync_next {
            self.resync_next = false;
            self.highest_sn = seq.wrapping_sub(1);
            self.highest_ts = ts;
            self.highest_ms = now_ms;
        }

        let hdr_size = header_size as u64;
        let pkt_size = hdr_size + (payload_size + padding_size) as u64;
        let mut is_duplicate = false;
        let diff = seq.wrapping_sub(self.highest_sn);
        if diff == 0 || diff > (1 << 15) {
            // duplicate or out-of-order
            if diff != 0 {
                self.packets_out_of_order += 1;
            }

            // out-of-order packets before a cycle completes may precede the start
            if !self.maybe_adjust_start_sn(seq, pkt_size, hdr_size, payload_size, marker) {
                if !self.is_sn_info_lost(seq) {
                    self.bytes_duplicate += pkt_size;
                    self.header_bytes_duplicate += hdr_size;
                    self.packets_duplicate += 1;
                    is_duplicate = true;
                } else {
                    self.packets_lost = self.packets_lost.saturating_sub(1);
                    self.set_sn_info(seq, pkt_size as u16, hdr_size as u16, payload_size, marker, true);
                }
            }
        } else {
            // in-order
            if diff > 1 {
                flow.has_loss = true;
                flow.loss_start = self.highest_sn.wrapping_add(1);
                flow.loss_end = seq;
            }

            self.update_gap_histogram(diff as usize);
            self.clear_sn_infos(self.highest_sn.wrapping_add(1), seq);
            self.packets_lost += (diff - 1) as u32;

            self.set_sn_info(seq, pkt_size as u16, hdr_size as u16, payload_size, marker, false);

            if seq < self.highest_sn && !first {
                self.cycles += 1;
            }
            self.highest_sn = seq;

            if ts != self.highest_ts {
                if ts < self.highest_ts && !first {
                    self.ts_cycles += 1;
                }
                self.highest_ts = ts;
                // packets of the same frame share a timestamp, anchor on the first
                self.highest_ms = now_ms;
            }
        }

        if !is_duplicate {
            if payload_size == 0 {
                self.packets_padding += 1;
                self.bytes_padding += pkt_size;
                self.header_bytes_padding += hdr_size;
            } else {
                self.bytes += pkt_size;
                self.header_bytes += hdr_size;
                if marker {
                    self.frames += 1;
                }
                self.update_jitter(now_ms, ts);
            }
        }

        flow
    }

    fn maybe_adjust_start_sn(&mut self, seq: u16, pkt_size: u64, hdr_size: u64, payload_size: usize, marker: bool) -> bool {
        if (self.ext_highest_sn().wrapping_sub(self.ext_start_sn) + 1) >= (SEQ_SPACE / 2) {
            return false;
        }

        if seq.wrapping_sub(self.ext_start_sn as u16) < (1 << 15) {
            return false;
        }

        self.packets_lost += ((self.ext_start_sn as u16).wrapping_sub(seq) - 1) as u32;
        let before = self.ext_start_sn;
        self.ext_start_sn = seq as u32;

        self.set_sn_info(seq, pkt_size as u16, hdr_size as u16, payload_size, marker, true);

        for snapshot in self.snapshots.values_mut() {
            if snapshot.ext_start_sn == before {
                snapshot.ext_start_sn = seq as u32;
            }
        }

        true
    }

    fn update_jitter(&mut self, now_ms: u64, ts: u32) {
        // all packets of a frame share a timestamp, use only the first
        if self.last_jitter_ts == ts {
            return;
        }

        let elapsed_ms = now_ms.saturating_sub(self.first_ms);
        let packet_time_rtp = (elapsed_ms * self.clock_rate as u64 / 1000) as u32;
        let transit = packet_time_rtp.wrapping_sub(ts);

        if self.last_transit != 0 {
            let d = (transit.wrapping_sub(self.last_transit) as i32).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
            if self.jitter > self.max_jitter {
                self.max_jitter = self.jitter;
            }
            for snapshot in self.snapshots.values_mut() {
                if self.jitter > snapshot.max_jitter {
                    snapshot.max_jitter = self.jitter;
                }
            }
        }

        self.last_transit = transit;
        self.last_jitter_ts = ts;
    }

    fn update_gap_histogram(&mut self, gap: usize) {
        if gap < 2 {
            return;
        }
        let missing = gap - 1;
        if missing > GAP_HISTOGRAM_BINS {
            self.gap_histogram[GAP_HISTOGRAM_BINS - 1] += 1;
        } else {
            self.gap_histogram[missing - 1] += 1;
        }
    }

    // ---- sequence-number info ring ----

    fn sn_info_out_of_order_ptr(&self, seq: u16) -> Option<usize> {
        let ahead = seq.wrapping_sub(self.highest_sn);
        if ahead > 0 && ahead < (1 << 15) {
            // in-order, not expected here
            return None;
        }

        let behind = self.highest_sn.wrapping_sub(seq);
        if behind as usize >= SN_INFO_SIZE {
            // too old for the ring
            return None;
        }

        Some(self.sn_write_ptr.wrapping_sub(behind as usize + 1) & SN_INFO_MASK)
    }

    fn set_sn_info(&mut self, seq: u16, pkt_size: u16, hdr_size: u16, payload_size: usize, marker: bool, out_of_order: bool) {
        let behind = seq.wrapping_sub(self.highest_sn) > (1 << 15);
        let write_ptr = if !behind {
            let ptr = self.sn_write_ptr;
            self.sn_write_ptr = (ptr + 1) & SN_INFO_MASK;
            ptr
        } else {
            match self.sn_info_out_of_order_ptr(seq) {
                Some(ptr) => ptr,
                None => return,
            }
        };

        let info = &mut self.sn_infos[write_ptr];
        info.pkt_size = pkt_size;
        info.hdr_size = hdr_size;
        info.padding_only = payload_size == 0;
        info.marker = marker;
        info.out_of_order = out_of_order;
    }

    fn clear_sn_infos(&mut self, start_inclusive: u16, end_exclusive: u16) {
        let mut seq = start_inclusive;
        while seq != end_exclusive {
            self.sn_infos[self.sn_write_ptr] = SnInfo::default();
            self.sn_write_ptr = (self.sn_write_ptr + 1) & SN_INFO_MASK;
            seq = seq.wrapping_add(1);
        }
    }

    fn is_sn_info_lost(&self, seq: u16) -> bool {
        match self.sn_info_out_of_order_ptr(seq) {
            Some(ptr) => self.sn_infos[ptr].pkt_size == 0,
            None => false,
        }
    }

    fn interval_stats(&self, start_inclusive: u16, end_exclusive: u16) -> IntervalStats {
        let mut stats = IntervalStats {
            packets: 0,
            bytes: 0,
            header_bytes: 0,
            packets_padding: 0,
            bytes_padding: 0,
            header_bytes_padding: 0,
            packets_lost: 0,
            packets_out_of_order: 0,
            frames: 0,
        };
        let mut not_found = 0u32;

        let mut seq = start_inclusive;
        while seq != end_exclusive {
            match self.sn_info_out_of_order_ptr(seq) {
                None => not_found += 1,
                Some(ptr) => {
                    let info = &self.sn_infos[ptr];
                    if info.pkt_size == 0 {
                        stats.packets_lost += 1;
                    } else if info.padding_only {
                        stats.packets_padding += 1;
                        stats.bytes_padding += info.pkt_size as u64;
                        stats.header_bytes_padding += info.hdr_size as u64;
                    } else {
                        stats.packets += 1;
                        stats.bytes += info.pkt_size as u64;
                        stats.header_bytes += info.hdr_size as u64;
                        if info.out_of_order {
                            stats.packets_out_of_order += 1;
                        }
                    }
                    if info.marker {
                        stats.frames += 1;
                    }
                }
            }
            seq = seq.wrapping_add(1);
        }

        if not_found != 0 {
            log::warn!(
                "[RtpStats] could not find some packets, start {}, end {}, count {}, highest {}",
                start_inclusive,
                end_exclusive,
                not_found,
                self.highest_sn
            );
        }
        stats
    }

    // ---- counters ----

    fn ext_highest_sn(&self) -> u32 {
        ((self.cycles as u32) << 16) | self.highest_sn as u32
    }

    fn ext_highest_ts(&self) -> u64 {
        ((self.ts_cycles as u64) << 32) | self.highest_ts as u64
    }

    pub fn packets_expected(&self) -> u32 {
        if !self.initialized {
            return 0;
        }
        self.ext_highest_sn().wrapping_sub(self.ext_start_sn) + 1
    }

    pub fn packets_lost(&self) -> u32 {
        self.packets_lost
    }

    pub fn packets_out_of_order(&self) -> u32 {
        self.packets_out_of_order
    }

    pub fn packets_duplicate(&self) -> u32 {
        self.packets_duplicate
    }

    pub fn packets_padding(&self) -> u32 {
        self.packets_padding
    }

    /// Packets actually received: expected minus lost. Primary plus padding
    /// plus duplicates breaks down the same total.
    pub fn packets_received(&self) -> u32 {
        self.packets_expected().saturating_sub(self.packets_lost)
    }

    fn packets_primary(&self) -> u32 {
        let expected = self.packets_expected();
        if self.packets_lost > expected {
            log::warn!("[RtpStats] packets lost {} exceeds expected {}, zeroing", self.packets_lost, expected);
            return 0;
        }
        let seen = expected - self.packets_lost;
        if self.packets_padding > seen {
            log::warn!("[RtpStats] padding packets {} exceed seen {}, zeroing", self.packets_padding, seen);
            return 0;
        }
        seen - self.packets_padding
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn rtt(&self) -> u32 {
        self.rtt
    }

    // ---- feedback counters ----

    pub fn update_nack(&mut self, count: u32) {
        if !self.ended {
            self.nacks += count;
        }
    }

    pub fn update_pli(&mut self, now_ms: u64, count: u32) {
        if !self.ended {
            self.plis += count;
            self.last_pli_ms = now_ms;
        }
    }

    pub fn last_pli_ms(&self) -> u64 {
        self.last_pli_ms
    }

    pub fn update_fir(&mut self, now_ms: u64, count: u32) {
        if !self.ended {
            self.firs += count;
            self.last_fir_ms = now_ms;
        }
    }

    pub fn update_key_frame(&mut self, now_ms: u64, count: u32) {
        if !self.ended {
            self.key_frames += count;
            self.last_key_frame_ms = now_ms;
        }
    }

    pub fn update_rtt(&mut self, rtt: u32) {
        if self.ended {
            return;
        }
        self.rtt = rtt;
        if rtt > self.max_rtt {
            self.max_rtt = rtt;
        }
        for snapshot in self.snapshots.values_mut() {
            if rtt > snapshot.max_rtt {
                snapshot.max_rtt = rtt;
            }
        }
    }

    /// Fold a remote receiver report into the overridden loss/highest-seq
    /// view. Reports pointing before the start of the stream are dropped.
    pub fn update_from_receiver_report(&mut self, now_ms: u64, rr: &rtcp::reception_report::ReceptionReport) {
        if !self.initialized || self.ended || rr.last_sequence_number < self.ext_start_sn {
            return;
        }

        if self.last_rr_ms.is_none() || self.ext_highest_sn_rr <= rr.last_sequence_number {
            self.ext_highest_sn_rr = rr.last_sequence_number;
            self.packets_lost_rr = rr.total_lost;
            self.last_rr_ms = Some(now_ms);
        } else {
            log::debug!(
                "[RtpStats] receiver report potentially out of order, existing highest {}, received {}",
                self.ext_highest_sn_rr,
                rr.last_sequence_number
            );
        }
    }

    // ---- sender report anchoring ----

    pub fn set_sender_report_data(&mut self, sr: SenderReportData) {
        if !self.initialized {
            return;
        }

        // anachronous report, NTP moved backwards
        if let Some(newest) = &self.sr_newest {
            if newest.ntp_ts > sr.ntp_ts {
                log::info!(
                    "[RtpStats] received anachronous sender report, current ntp {}, last ntp {}",
                    sr.ntp_ts,
                    newest.ntp_ts
                );
                return;
            }
        }

        let mut cycles = 0u64;
        if let Some(newest) = &self.sr_newest {
            cycles = newest.rtp_ts_ext & 0xFFFF_FFFF_0000_0000;
            if sr.rtp_ts.wrapping_sub(newest.rtp_ts) < (1 << 31) && sr.rtp_ts < newest.rtp_ts {
                cycles += 1 << 32;
            }
        }

        let mut anchored = sr;
        anchored.rtp_ts_ext = sr.rtp_ts as u64 + cycles;

        if let Some(newest) = &self.sr_newest {
            if anchored.rtp_ts_ext < newest.rtp_ts_ext {
                // happens when the source track is replaced then restored,
                // restart anchors from here rather than going backwards
                log::warn!(
                    "[RtpStats] out-of-order sender report, resetting, prev ext {}, curr ext {}",
                    newest.rtp_ts_ext,
                    anchored.rtp_ts_ext
                );
                self.sr_first = Some(anchored);
                self.sr_newest = Some(anchored);
                return;
            }

            let ntp_diff_ms = ntp_to_unix_ms(anchored.ntp_ts).saturating_sub(ntp_to_unix_ms(newest.ntp_ts));
            let rtp_diff = anchored.rtp_ts_ext - newest.rtp_ts_ext;
            let expected_ms = rtp_diff * 1000 / self.clock_rate as u64;
            if expected_ms.abs_diff(ntp_diff_ms) > TIME_WARP_SKEW_MS {
                log::info!(
                    "[RtpStats] received sender report, time warp, ntp diff {} ms, expected {} ms",
                    ntp_diff_ms,
                    expected_ms
                );
            }
        }

        self.sr_newest = Some(anchored);
        if self.sr_first.is_none() {
            self.sr_first = Some(anchored);
        }
    }

    pub fn sender_report_data(&self) -> (Option<SenderReportData>, Option<SenderReportData>) {
        (self.sr_first, self.sr_newest)
    }

    /// Synthesize a sender report for `now`. The RTP timestamp is projected
    /// from the highest seen timestamp plus elapsed monotonic time; when an
    /// independently calculated clock rate yields a later timestamp, the
    /// later one wins.
    pub fn sender_report(&mut self, now_ms: u64, unix_now_ms: u64, ssrc: u32, calculated_clock_rate: u32) -> Option<rtcp::sender_report::SenderReport> {
        if !self.initialized {
            return None;
        }

        let now_ntp = unix_ms_to_ntp(unix_now_ms);

        let since_highest_ms = now_ms.saturating_sub(self.highest_ms);
        let mut now_rtp = self.highest_ts.wrapping_add((since_highest_ms * self.clock_rate as u64 / 1000) as u32);

        let mut ts_cycles = self.ts_cycles as u64;
        if now_rtp < self.highest_ts {
            ts_cycles += 1;
        }
        let mut now_rtp_ext = (ts_cycles << 32) | now_rtp as u64;
        if calculated_clock_rate != 0 {
            let since_first_ms = now_ms.saturating_sub(self.first_ms);
            let using_rate = self.ext_start_ts + calculated_clock_rate as u64 * since_first_ms / 1000;
            if using_rate > now_rtp_ext {
                now_rtp_ext = using_rate;
                now_rtp = using_rate as u32;
            }
        }

        if let Some(newest) = &self.sr_newest {
            let ntp_diff_ms = unix_now_ms.saturating_sub(ntp_to_unix_ms(newest.ntp_ts));
            let rtp_diff = now_rtp_ext.saturating_sub(newest.rtp_ts_ext);
            let expected_ms = rtp_diff * 1000 / self.clock_rate as u64;
            if expected_ms.abs_diff(ntp_diff_ms) > TIME_WARP_SKEW_MS {
                log::info!(
                    "[RtpStats] sending sender report, time warp, ntp diff {} ms, expected {} ms",
                    ntp_diff_ms,
                    expected_ms
                );
            }
        }

        self.sr_newest = Some(SenderReportData {
            rtp_ts: now_rtp,
            rtp_ts_ext: now_rtp_ext,
            ntp_ts: now_ntp,
            at_ms: now_ms,
        });
        if self.sr_first.is_none() {
            self.sr_first = self.sr_newest;
        }

        Some(rtcp::sender_report::SenderReport {
            ssrc,
            ntp_time: now_ntp,
            rtp_time: now_rtp,
            packet_count: self.packets_primary() + self.packets_duplicate + self.packets_padding,
            octet_count: (self.bytes + self.bytes_duplicate + self.bytes_padding) as u32,
            ..Default::default()
        })
    }

    // ---- snapshots ----

    pub fn new_snapshot_id(&mut self, now_ms: u64) -> u32 {
        let id = self.next_snapshot_id;
        if self.initialized {
            self.snapshots.insert(
                id,
                Snapshot {
                    start_ms: now_ms,
                    ext_start_sn: self.ext_start_sn,
                    ..Default::default()
                },
            );
        }
        self.next_snapshot_id += 1;
        id
    }

    fn get_and_reset_snapshot(&mut self, now_ms: u64, snapshot_id: u32) -> Option<(Snapshot, Snapshot)> {
        if !self.initialized {
            return None;
        }

        let then = *self.snapshots.entry(snapshot_id).or_insert(Snapshot {
            start_ms: self.start_ms,
            ext_start_sn: self.ext_start_sn,
            ..Default::default()
        });

        let now = Snapshot {
            start_ms: now_ms,
            ext_start_sn: self.ext_highest_sn() + 1,
            packets_duplicate: self.packets_duplicate,
            bytes_duplicate: self.bytes_duplicate,
            header_bytes_duplicate: self.header_bytes_duplicate,
            nacks: self.nacks,
            plis: self.plis,
            firs: self.firs,
            max_rtt: self.rtt,
            max_jitter: self.jitter,
        };
        self.snapshots.insert(snapshot_id, now);

        Some((then, now))
    }

    /// Counters accumulated since the previous read of `snapshot_id`, which
    /// this call resets.
    pub fn delta_info(&mut self, now_ms: u64, snapshot_id: u32) -> Option<RtpDeltaInfo> {
        let (then, now) = self.get_and_reset_snapshot(now_ms, snapshot_id)?;

        let start_ms = then.start_ms;
        let duration_ms = now.start_ms.saturating_sub(then.start_ms);

        let expected = now.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if expected > SEQ_SPACE {
            log::warn!(
                "[RtpStats] too many packets expected in delta, start {}, end {}, expected {}",
                then.ext_start_sn,
                now.ext_start_sn,
                expected
            );
            return None;
        }
        if expected == 0 {
            return Some(RtpDeltaInfo {
                start_ms,
                duration_ms,
                ..Default::default()
            });
        }

        let interval = self.interval_stats(then.ext_start_sn as u16, now.ext_start_sn as u16);
        Some(RtpDeltaInfo {
            start_ms,
            duration_ms,
            packets: expected - interval.packets_padding,
            bytes: interval.bytes,
            header_bytes: interval.header_bytes,
            packets_duplicate: now.packets_duplicate - then.packets_duplicate,
            bytes_duplicate: now.bytes_duplicate - then.bytes_duplicate,
            header_bytes_duplicate: now.header_bytes_duplicate - then.header_bytes_duplicate,
            packets_padding: interval.packets_padding,
            bytes_padding: interval.bytes_padding,
            header_bytes_padding: interval.header_bytes_padding,
            packets_lost: interval.packets_lost,
            packets_out_of_order: interval.packets_out_of_order,
            frames: interval.frames,
            rtt_max: then.max_rtt,
            jitter_max_us: then.max_jitter / self.clock_rate as f64 * 1e6,
            nacks: now.nacks - then.nacks,
            plis: now.plis - then.plis,
            firs: now.firs - then.firs,
        })
    }

    /// RTCP reception report over the interval since the previous read of
    /// `snapshot_id`.
    pub fn reception_report(&mut self, now_ms: u64, ssrc: u32, proxy_frac_lost: u8, snapshot_id: u32) -> Option<rtcp::reception_report::ReceptionReport> {
        let (then, now) = self.get_and_reset_snapshot(now_ms, snapshot_id)?;

        let expected = now.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if expected > SEQ_SPACE {
            log::warn!(
                "[RtpStats] too many packets expected in receiver report, start {}, end {}, expected {}",
                then.ext_start_sn,
                now.ext_start_sn,
                expected
            );
            return None;
        }
        if expected == 0 {
            return None;
        }

        let interval = self.interval_stats(then.ext_start_sn as u16, now.ext_start_sn as u16);
        let loss_rate = interval.packets_lost as f32 / expected as f32;
        let mut frac_lost = (loss_rate * 256.0) as u8;
        if proxy_frac_lost > frac_lost {
            frac_lost = proxy_frac_lost;
        }

        let mut dlsr = 0u32;
        let mut last_sr = 0u32;
        if let Some(newest) = &self.sr_newest {
            if newest.at_ms != 0 {
                let delay_ms = now_ms.saturating_sub(newest.at_ms) as u32;
                dlsr = (delay_ms / 1000) << 16;
                dlsr |= (delay_ms % 1000) * 65536 / 1000;
            }
            last_sr = (newest.ntp_ts >> 16) as u32;
        }

        Some(rtcp::reception_report::ReceptionReport {
            ssrc,
            fraction_lost: frac_lost,
            total_lost: self.packets_lost,
            last_sequence_number: now.ext_start_sn,
            jitter: self.jitter as u32,
            last_sender_report: last_sr,
            delay: dlsr,
        })
    }

    /// Drift between the RTP clock and the wall clock since the first
    /// packet, in milliseconds (positive when the RTP clock runs fast).
    pub fn drift_ms(&self) -> f64 {
        if !self.initialized {
            return 0.0;
        }
        let elapsed_ms = self.highest_ms.saturating_sub(self.first_ms);
        let rtp_diff = self.ext_highest_ts().wrapping_sub(self.ext_start_ts);
        let drift_samples = rtp_diff as i64 - (elapsed_ms * self.clock_rate as u64 / 1000) as i64;
        drift_samples as f64 * 1000.0 / self.clock_rate as f64
    }

    /// One-line rollup of every counter, for periodic stream logs.
    pub fn summary(&self, now_ms: u64) -> String {
        if !self.initialized {
            return "uninitialized".to_string();
        }
        let elapsed_s = (now_ms.saturating_sub(self.start_ms) as f64 / 1000.0).max(0.001);

        let mut out = format!(
            "t: {:.2}s, sn: {}|{}, ep: {}, l: {}|{}(rr), b: {}|{}h, f: {}",
            elapsed_s,
            self.ext_start_sn,
            self.ext_highest_sn(),
            self.packets_expected(),
            self.packets_lost,
            self.packets_lost_rr,
            self.bytes,
            self.header_bytes,
            self.frames,
        );
        out += &format!(
            ", d: {}|{}b|{}h, pp: {}|{}b|{}h, o: {}",
            self.packets_duplicate,
            self.bytes_duplicate,
            self.header_bytes_duplicate,
            self.packets_padding,
            self.bytes_padding,
            self.header_bytes_padding,
            self.packets_out_of_order,
        );
        out += &format!(
            ", c: {}, j: {:.0}|{:.0}, n: {}, pli: {}|{}, fir: {}|{}, kf: {}|{}",
            self.clock_rate,
            self.jitter,
            self.max_jitter,
            self.nacks,
            self.plis,
            self.last_pli_ms,
            self.firs,
            self.last_fir_ms,
            self.key_frames,
            self.last_key_frame_ms,
        );
        out += &format!(", rtt(ms): {}|{}, drift(ms): {:.2}", self.rtt, self.max_rtt, self.drift_ms());

        let gaps: Vec<String> = self
            .gap_histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(burst, count)| format!("{}:{}", burst + 1, count))
            .collect();
        if !gaps.is_empty() {
            out += &format!(", gh: [{}]", gaps.join(", "));
        }

        out
    }
}
