mod reports;
mod twcc;

pub use reports::{ReceiverReportGenerator, SenderReportGenerator, SENDER_REPORT_INTERVAL_MS};
pub use twcc::{FeedbackError, TwccFeedback, TwccInfo};
