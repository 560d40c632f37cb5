/// 媒体工具 (Media Toolkit)
///
/// 流水线通过 [`MediaToolkit`] 访问外部媒体工具:
/// - probe:         读取容器/流信息
/// - extract_frames: 按目标帧率抽帧到目录
/// - encode_frames:  把帧序列编码成视频
///
/// 任务日志逐行回调; 编码进度只来自日志里的 `time=HH:MM:SS.ss`.
pub mod ffmpeg;
pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use ffmpeg::FfmpegToolkit;

/// 源帧率缺失时的默认值
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// 宽高未知时的默认宽高比
pub const DEFAULT_ASPECT_RATIO: f64 = 16.0 / 9.0;

/// 媒体文件信息
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub filename: String,
    pub format: Option<String>,
    /// 秒
    pub duration: Option<f64>,
    pub start_time: Option<f64>,
    /// bit/s
    pub bitrate: Option<u64>,
    /// 字节
    pub size: Option<u64>,
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
}

impl MediaInfo {
    pub fn first_video_stream(&self) -> Option<&VideoStream> {
        self.video_streams.first()
    }

    /// 时长未知时为0
    pub fn duration_seconds(&self) -> f64 {
        self.duration.filter(|d| d.is_finite() && *d > 0.0).unwrap_or(0.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<u64>,
}

impl VideoStream {
    pub fn frame_rate_or_default(&self) -> f64 {
        self.frame_rate
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(DEFAULT_FRAME_RATE)
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.width == 0 || self.height == 0 {
            DEFAULT_ASPECT_RATIO
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    pub codec: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub bitrate: Option<u64>,
}

/// 抽帧任务: 输出 `output_dir/frame_<补零序号>.jpg`, 序号从0开始
#[derive(Clone, Debug)]
pub struct ExtractRequest {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub frame_rate: f64,
    /// 序号补零位数
    pub digits: usize,
    pub hardware_acceleration: bool,
}

/// 编码任务: 输入 `input_dir/frame_<序号>.jpg` (不补零), 序号从0开始
#[derive(Clone, Debug)]
pub struct EncodeRequest {
    pub input_dir: PathBuf,
    pub output: PathBuf,
    pub frame_rate: f64,
    pub hardware_acceleration: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed { exit_code: Option<i32> },
    Cancelled,
}

/// 外部任务结果 + 完整日志
#[derive(Clone, Debug)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub log: String,
}

impl JobOutcome {
    pub fn success(log: String) -> Self {
        Self {
            status: JobStatus::Success,
            log,
        }
    }

    pub fn failed(exit_code: Option<i32>, log: String) -> Self {
        Self {
            status: JobStatus::Failed { exit_code },
            log,
        }
    }

    pub fn cancelled(log: String) -> Self {
        Self {
            status: JobStatus::Cancelled,
            log,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// 媒体工具接口
///
/// 任务方法会阻塞到任务结束; `cancel` 被置位时应尽快终止并返回 `Cancelled`.
pub trait MediaToolkit: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaInfo>;

    /// 是否有可用的硬件编解码
    fn hardware_acceleration_available(&self) -> bool;

    fn extract_frames(
        &self,
        request: &ExtractRequest,
        cancel: &AtomicBool,
        on_log: &mut dyn FnMut(&str),
    ) -> JobOutcome;

    fn encode_frames(
        &self,
        request: &EncodeRequest,
        cancel: &AtomicBool,
        on_log: &mut dyn FnMut(&str),
    ) -> JobOutcome;
}

/// 抽帧文件名 `frame_<补零序号>.jpg`
pub fn frame_file_name(index: usize, digits: usize) -> String {
    format!("frame_{:0width$}.jpg", index, width = digits)
}

/// 数字位数 (0 也算1位)
pub fn digit_count(n: usize) -> usize {
    let mut digits = 1;
    let mut n = n / 10;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits
}

/// 统计目录中 `frame_<数字>.jpg` 文件的数量
pub fn count_frame_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let is_frame = name
            .strip_prefix("frame_")
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()));
        if is_frame {
            count += 1;
        }
    }
    Ok(count)
}
