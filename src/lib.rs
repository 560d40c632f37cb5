// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 运行参数
pub mod detection; // 智能检测系统
pub mod error; // 错误类型
pub mod media; // 媒体工具 (ffmpeg)
pub mod models; // 推理引擎接口与实现
pub mod pipeline; // 视频处理流水线

pub use crate::config::{DetectorConfig, PipelineConfig};
pub use crate::detection::{
    Annotator, BoundingBox, DetectionOutcome, DetectionTensor, Detector, DetectorListener,
    IouThreshold,
};
pub use crate::error::{Error, Result};
pub use crate::media::{FfmpegToolkit, MediaInfo, MediaToolkit};
pub use crate::models::{ExecutionProvider, InferenceEngine};
pub use crate::pipeline::{
    EncodeResult, PipelineEvent, PipelineState, SessionHandle, VideoPipeline, VideoRequest,
};

/// 本地时间字符串, 用于生成唯一文件名
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%3f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

/// 读取类别名称文件 (每行一个, 忽略空行)
pub fn load_labels(path: &std::path::Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_time_string() {
        let s = gen_time_string("");
        assert_eq!(s.len(), 17);
        assert!(s.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(gen_time_string("-").matches('-').count(), 6);
    }

    #[test]
    fn test_load_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "tricycle\n\n  car \n").unwrap();
        assert_eq!(load_labels(&path).unwrap(), vec!["tricycle", "car"]);
    }
}
