//! 运行参数 - 通过JSON文件调整, 命令行参数优先

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detection::{IouThreshold, DEFAULT_CONF_THRESHOLD};
use crate::error::{Error, Result};

/// 检测器参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub conf_threshold: f32,         // 检测置信度阈值 (严格大于)
    pub iou_threshold: IouThreshold, // NMS IOU阈值
    pub input_width: u32,            // 模型输入宽度
    pub input_height: u32,           // 模型输入高度
    pub cuda: bool,                  // 优先使用CUDA
    pub device_id: i32,              // CUDA设备号
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            iou_threshold: IouThreshold::default(),
            input_width: 640,
            input_height: 640,
            cuda: false,
            device_id: 0,
        }
    }
}

impl DetectorConfig {
    /// 文件不存在时使用默认值; 内容无效时报错, 不会静默替换
    pub fn load(path: &Path) -> Result<Self> {
        let Some(json) = read_json(path)? else {
            return Ok(Self::default());
        };
        // 越界的IOU阈值单独报告, 不混在解析错误里
        if let Some(iou) = json.get("iou_threshold").and_then(Value::as_f64) {
            IouThreshold::new(iou as f32)?;
        }
        let config: Self = serde_json::from_value(json)?;
        config.validate()?;
        log::info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(Error::InvalidConfidence(self.conf_threshold));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(Error::InvalidConfig(format!(
                "input size {}x{} must be non-zero",
                self.input_width, self.input_height
            )));
        }
        Ok(())
    }
}

/// 视频流水线参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub target_fps: f64,       // 抽帧帧率
    pub poll_interval_ms: u64, // 等待下一帧时的轮询间隔
    pub save_workers: usize,   // 保存帧的线程数 (0 = CPU核数)
    pub jpeg_quality: u8,      // 保存帧的JPEG质量
    pub work_dir: PathBuf,     // 临时目录的父目录
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            poll_interval_ms: 5,
            save_workers: 0,
            jpeg_quality: 95,
            work_dir: default_work_dir(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let Some(json) = read_json(path)? else {
            return Ok(Self::default());
        };
        let config: Self = serde_json::from_value(json)?;
        config.validate()?;
        log::info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn validate(&self) -> Result<()> {
        validate_frame_rate(self.target_fps)?;
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(Error::InvalidConfig(format!(
                "jpeg quality must be between 1 and 100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

pub fn validate_frame_rate(fps: f64) -> Result<()> {
    if fps.is_finite() && fps > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidFrameRate(fps))
    }
}

/// 用户缓存目录, 没有时退回系统临时目录
pub fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("tricycle-detector"))
        .unwrap_or_else(std::env::temp_dir)
}

/// 读取JSON配置文件; 文件不存在时返回 `None`
fn read_json(path: &Path) -> Result<Option<Value>> {
    match fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
            log::error!("❌ 配置文件 {} 解析失败: {}", path.display(), e);
            Error::from(e)
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::info!("📝 配置文件 {} 不存在, 使用默认值", path.display());
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// 保存配置到JSON文件
fn save_json<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    log::info!("💾 配置已保存到 {}", path.display());
    Ok(())
}
