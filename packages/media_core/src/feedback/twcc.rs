//! Transport-wide congestion control feedback ingestion.
//!
//! Reconstructs per-packet arrival times at the remote end from RTCP
//! transport-layer-cc reports and hands them to the bandwidth estimator.

use rtcp::transport_feedbacks::transport_layer_cc::{PacketStatusChunk, SymbolTypeTcc, TransportLayerCc};

/// Reports spaced more than this factor away from the smoothed interval are
/// treated as outliers and excluded from the estimate.
const OUTLIER_REPORT_FACTOR: f64 = 4.0;
const FEEDBACK_INTERVAL_ALPHA: f64 = 0.9;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("feedback report out-of-order")]
    ReportOutOfOrder,
    #[error("truncated feedback report")]
    Truncated,
}

/// Remote arrival times recovered from one feedback report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwccInfo {
    pub base_sn: u16,
    /// One entry per reported packet status; `None` when not received.
    /// Times are microseconds on the remote receiver's clock.
    pub arrivals: Vec<Option<i64>>,
}

#[derive(Default)]
pub struct TwccFeedback {
    last_feedback_ms: Option<u64>,
    estimated_interval_ms: Option<f64>,
    highest_fb_count: u8,
}

impl TwccFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smoothed interval between in-order feedback reports.
    pub fn estimated_interval_ms(&self) -> Option<f64> {
        self.estimated_interval_ms
    }

    pub fn handle(&mut self, now_ms: u64, report: &TransportLayerCc) -> Result<TwccInfo, FeedbackError> {
        if let Some(last_ms) = self.last_feedback_ms {
            // feedback count is a u8 with wrap; half the space back is stale
            if report.fb_pkt_count.wrapping_sub(self.highest_fb_count) >= (1 << 7) {
                return Err(FeedbackError::ReportOutOfOrder);
            }

            let since_last = now_ms.saturating_sub(last_ms) as f64;
            match self.estimated_interval_ms {
                None => self.estimated_interval_ms = Some(since_last),
                Some(interval) => {
                    if since_last > interval / OUTLIER_REPORT_FACTOR && since_last < interval * OUTLIER_REPORT_FACTOR {
                        self.estimated_interval_ms = Some(FEEDBACK_INTERVAL_ALPHA * interval + (1.0 - FEEDBACK_INTERVAL_ALPHA) * since_last);
                    }
                }
            }
        }

        self.last_feedback_ms = Some(now_ms);
        self.highest_fb_count = report.fb_pkt_count;

        // reference time ticks are 64 ms, deltas are already microseconds
        let mut ref_time_us = report.reference_time as i64 * 64 * 1000;
        let mut arrivals = Vec::with_capacity(report.packet_status_count as usize);
        let mut delta_index = 0usize;

        let mut push = |symbol: SymbolTypeTcc, arrivals: &mut Vec<Option<i64>>| -> Result<(), FeedbackError> {
            if symbol == SymbolTypeTcc::PacketNotReceived {
                arrivals.push(None);
                return Ok(());
            }
            let delta = report.recv_deltas.get(delta_index).ok_or(FeedbackError::Truncated)?;
            delta_index += 1;
            ref_time_us += delta.delta;
            arrivals.push(Some(ref_time_us));
            Ok(())
        };

        for chunk in &report.packet_chunks {
            match chunk {
                PacketStatusChunk::RunLengthChunk(chunk) => {
                    for _ in 0..chunk.run_length {
                        push(chunk.packet_status_symbol, &mut arrivals)?;
                    }
                }
                PacketStatusChunk::StatusVectorChunk(chunk) => {
                    for symbol in &chunk.symbol_list {
                        push(*symbol, &mut arrivals)?;
                    }
                }
            }
        }
        arrivals.truncate(report.packet_status_count as usize);

        Ok(TwccInfo {
            base_sn: report.base_sequence_number,
            arrivals,
        })
    }
}
