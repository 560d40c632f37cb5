//! 错误类型 (Error types)

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IOU threshold must be between 0 and 1, got {0}")]
    InvalidIouThreshold(f32),

    #[error("confidence threshold must be between 0 and 1, got {0}")]
    InvalidConfidence(f32),

    #[error("target frame rate must be positive, got {0}")]
    InvalidFrameRate(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("detection tensor shape {0:?} is not [1, channels >= 5, elements]")]
    TensorShape(Vec<usize>),

    #[error("media probe failed: {0}")]
    Probe(String),

    #[error("no video stream found in {}", .0.display())]
    NoVideoStream(PathBuf),

    #[error("frame extraction failed")]
    Extraction { log: String },

    #[error("no frames were extracted")]
    NoFrames,

    #[error("video encoding failed")]
    Encoding { log: String },

    #[error("failed to save frame {index}: {source}")]
    FrameSave {
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("worker thread failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 外部工具的日志输出 (仅提取/编码失败时存在)
    pub fn toolkit_log(&self) -> Option<&str> {
        match self {
            Error::Extraction { log } | Error::Encoding { log } => Some(log.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
