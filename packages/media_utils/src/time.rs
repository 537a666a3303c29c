use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in unix milliseconds. Core components take `now_ms` as a
/// parameter instead of calling this, so tests can drive time explicitly.
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before unix epoch").as_millis() as u64
}
