//! 从编码日志中解析进度 (`time=HH:MM:SS.ss`)

use once_cell::sync::Lazy;
use regex::Regex;

static TIME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"time=\s*(\d{2,}):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex")
});

/// 日志行中的已处理时长 (秒)
pub fn parse_time(line: &str) -> Option<f64> {
    let caps = TIME_REGEX.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// 编码进度 `[0, 1]`; 时长未知或没有 `time=` 时为 `None`
pub fn parse_progress(line: &str, duration_seconds: f64) -> Option<f32> {
    if !(duration_seconds > 0.0) {
        return None;
    }
    let elapsed = parse_time(line)?;
    Some((elapsed / duration_seconds).clamp(0.0, 1.0) as f32)
}
