mod rtp_stats;
mod shared;

pub use rtp_stats::{FlowState, RtpDeltaInfo, RtpStats, SenderReportData};
pub use shared::SharedRtpStats;
