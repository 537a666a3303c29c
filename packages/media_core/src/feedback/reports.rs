//! Cadenced RTCP report generation on top of [`RtpStats`].

use crate::stats::RtpStats;

/// Default cadence for sender reports toward subscribers.
pub const SENDER_REPORT_INTERVAL_MS: u64 = 5000;

/// Sender reports toward a subscriber, one generator per subscribed track.
pub struct SenderReportGenerator {
    interval_ms: u64,
    last_ms: u64,
}

impl SenderReportGenerator {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms, last_ms: 0 }
    }

    pub fn maybe_generate(&mut self, now_ms: u64, unix_now_ms: u64, ssrc: u32, stats: &mut RtpStats) -> Option<rtcp::sender_report::SenderReport> {
        if now_ms.saturating_sub(self.last_ms) < self.interval_ms {
            return None;
        }
        let report = stats.sender_report(now_ms, unix_now_ms, ssrc, 0)?;
        self.last_ms = now_ms;
        Some(report)
    }
}

/// Receiver reports toward a publisher. Owns a stats snapshot so intervals
/// are delta-exact regardless of other consumers.
pub struct ReceiverReportGenerator {
    interval_ms: u64,
    last_ms: u64,
    snapshot_id: u32,
}

impl ReceiverReportGenerator {
    pub fn new(now_ms: u64, interval_ms: u64, stats: &mut RtpStats) -> Self {
        Self {
            interval_ms,
            last_ms: 0,
            snapshot_id: stats.new_snapshot_id(now_ms),
        }
    }

    pub fn maybe_generate(&mut self, now_ms: u64, ssrc: u32, stats: &mut RtpStats) -> Option<rtcp::receiver_report::ReceiverReport> {
        if now_ms.saturating_sub(self.last_ms) < self.interval_ms {
            return None;
        }
        let report = stats.reception_report(now_ms, ssrc, 0, self.snapshot_id)?;
        self.last_ms = now_ms;
        Some(rtcp::receiver_report::ReceiverReport {
            ssrc,
            reports: vec![report],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod test {
    use crate::stats::RtpStats;

    use super::{ReceiverReportGenerator, SenderReportGenerator};

    #[test]
    fn sender_report_respects_cadence() {
        let mut stats = RtpStats::new(90_000);
        stats.update(0, 1, 100, true, 12, 20, 0);

        let mut generator = SenderReportGenerator::new(1000);
        assert!(generator.maybe_generate(1500, 1_700_000_000_500, 0xaa, &mut stats).is_some());
        // within the interval: suppressed
        assert!(generator.maybe_generate(1900, 1_700_000_000_900, 0xaa, &mut stats).is_none());
        assert!(generator.maybe_generate(2600, 1_700_000_001_600, 0xaa, &mut stats).is_some());
    }

    #[test]
    fn receiver_report_covers_interval() {
        let mut stats = RtpStats::new(90_000);
        let mut generator = ReceiverReportGenerator::new(0, 1000, &mut stats);
        for seq in 1u16..=10 {
            stats.update(seq as u64 * 10, seq, seq as u32 * 100, true, 12, 20, 0);
        }
        let report = generator.maybe_generate(1500, 0x55, &mut stats).expect("report");
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].ssrc, 0x55);
        assert_eq!(report.reports[0].fraction_lost, 0);

        // nothing new yet
        assert!(generator.maybe_generate(1600, 0x55, &mut stats).is_none());
    }
}
