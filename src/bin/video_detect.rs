/// 视频检测 (Video Detect)
///
/// 抽帧 → 逐帧检测并标注 → 重新编码为视频
///
/// 流程:
/// 1. 会话线程: ffprobe 探测 + ffmpeg 抽帧/编码
/// 2. 监视线程: 按序号把帧交给检测线程
/// 3. 检测线程: ONNX 推理 + NMS + 标注
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use image::DynamicImage;
use tricycle_detector::models::engine_factory;
use tricycle_detector::{
    gen_time_string, load_labels, Annotator, BoundingBox, Detector, DetectorConfig, DetectorListener,
    ExecutionProvider, FfmpegToolkit, IouThreshold, PipelineConfig, PipelineEvent, VideoPipeline,
    VideoRequest,
};

/// 视频检测参数
#[derive(Parser, Debug)]
#[command(author, version, about = "视频检测 - 抽帧检测并输出标注视频", long_about = None)]
struct Args {
    /// ONNX 模型路径
    #[arg(short, long)]
    model: PathBuf,

    /// 输入视频
    #[arg(short, long)]
    source: PathBuf,

    /// 输出视频 (默认: 源文件旁的 processed_video_<时间>.mp4)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 类别名称文件 (每行一个)
    #[arg(short, long)]
    labels: Option<PathBuf>,

    /// 标签字体 (ttf/otf), 不指定时只画框
    #[arg(long)]
    font: Option<PathBuf>,

    /// 抽帧帧率
    #[arg(long)]
    fps: Option<f64>,

    /// 置信度阈值
    #[arg(long)]
    conf: Option<f32>,

    /// NMS IOU阈值
    #[arg(long)]
    iou: Option<f32>,

    /// 模型输入宽度
    #[arg(long)]
    width: Option<u32>,

    /// 模型输入高度
    #[arg(long)]
    height: Option<u32>,

    /// 优先使用CUDA
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// CUDA设备号
    #[arg(long, default_value_t = 0)]
    device_id: i32,

    /// 检测器配置文件 (JSON)
    #[arg(long)]
    detector_config: Option<PathBuf>,

    /// 流水线配置文件 (JSON)
    #[arg(long)]
    pipeline_config: Option<PathBuf>,
}

/// 逐帧检测结果输出到日志
struct FrameLogger {
    labels: Vec<String>,
}

impl DetectorListener for FrameLogger {
    fn on_detect(&self, boxes: &[BoundingBox], inference_ms: u64) {
        let names: Vec<String> = boxes
            .iter()
            .map(|b| {
                let name = self.labels.get(b.class_index).map(String::as_str).unwrap_or("?");
                format!("{} {:.0}%", name, b.confidence * 100.0)
            })
            .collect();
        log::debug!("🎯 {} 个目标 ({}ms): {}", boxes.len(), inference_ms, names.join(", "));
    }

    fn on_empty_detect(&self, _frame: &DynamicImage) {}
}

fn default_output(source: &Path) -> PathBuf {
    source.with_file_name(format!("processed_video_{}.mp4", gen_time_string("")))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // 配置文件 + 命令行覆盖
    let mut detector_config = args
        .detector_config
        .as_deref()
        .map(DetectorConfig::load)
        .transpose()?
        .unwrap_or_default();
    if let Some(conf) = args.conf {
        detector_config.conf_threshold = conf;
    }
    if let Some(iou) = args.iou {
        detector_config.iou_threshold = IouThreshold::new(iou)?;
    }
    if let Some(width) = args.width {
        detector_config.input_width = width;
    }
    if let Some(height) = args.height {
        detector_config.input_height = height;
    }
    if args.cuda {
        detector_config.cuda = true;
        detector_config.device_id = args.device_id;
    }

    let mut pipeline_config = args
        .pipeline_config
        .as_deref()
        .map(PipelineConfig::load)
        .transpose()?
        .unwrap_or_default();
    if let Some(fps) = args.fps {
        pipeline_config.target_fps = fps;
    }

    let labels = match &args.labels {
        Some(path) => load_labels(path)?,
        None => Vec::new(),
    };
    let font = args.font.as_deref().map(Annotator::load_font).transpose()?;

    let preferred = if detector_config.cuda {
        ExecutionProvider::Cuda(detector_config.device_id)
    } else {
        ExecutionProvider::Cpu
    };
    let factory = engine_factory(
        args.model.clone(),
        (detector_config.input_width, detector_config.input_height),
    );
    let detector = Detector::with_fallback(
        factory,
        preferred,
        Annotator::new(labels.clone(), font),
        Arc::new(FrameLogger { labels }),
        &detector_config,
    )?;
    if !detector.is_ready() {
        log::warn!("⚠️ 推理引擎不可用, 输出视频将不含检测框");
    }

    let toolkit = FfmpegToolkit::from_config(&pipeline_config);
    let pipeline = VideoPipeline::new(toolkit, Arc::new(detector), pipeline_config)?;

    let output = args.output.clone().unwrap_or_else(|| default_output(&args.source));
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = pipeline
        .start(
            VideoRequest {
                input: args.source.clone(),
                output,
                target_fps: None,
            },
            tx,
        )
        .ok_or_else(|| anyhow!("another session is already running"))?;

    let mut failure = None;
    for event in rx.iter() {
        match event {
            PipelineEvent::State(state) => log::info!("📍 {:?}", state),
            PipelineEvent::Progress {
                stage,
                fraction,
                info,
            } => {
                log::info!("⏳ [{}] {:>5.1}% {}", stage.name(), fraction * 100.0, info);
            }
            PipelineEvent::Finished(result) => {
                println!(
                    "✅ 输出: {} (硬件编码: {})",
                    result.output_path.display(),
                    result.used_hardware_acceleration
                );
                break;
            }
            PipelineEvent::Failed { reason, log } => {
                if let Some(log) = log {
                    eprintln!("{}", log);
                }
                failure = Some(reason);
                break;
            }
            PipelineEvent::Cancelled => {
                failure = Some("cancelled".to_string());
                break;
            }
        }
    }

    handle.wait();
    match failure {
        Some(reason) => Err(anyhow!("❌ 处理失败: {}", reason)),
        None => Ok(()),
    }
}
