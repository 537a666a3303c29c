mod ntp;
mod seq_extend;
mod seq_rewrite;
mod time;
mod ts_rewrite;

pub use ntp::{ntp_to_unix_ms, unix_ms_to_ntp};
pub use seq_extend::SeqExtend;
pub use seq_rewrite::SeqRewrite;
pub use time::now_ms;
pub use ts_rewrite::TsRewrite;
