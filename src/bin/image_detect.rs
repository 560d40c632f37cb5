/// 图片检测 (Image Detect)
///
/// 单张图片检测, 标注结果保存为新文件
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::Sender;
use image::{DynamicImage, RgbaImage};
use tricycle_detector::models::engine_factory;
use tricycle_detector::{
    load_labels, Annotator, BoundingBox, Detector, DetectorConfig, DetectorListener,
    ExecutionProvider, IouThreshold,
};

/// 图片检测参数
#[derive(Parser, Debug)]
#[command(author, version, about = "图片检测 - 检测单张图片并输出标注结果", long_about = None)]
struct Args {
    /// ONNX 模型路径
    #[arg(short, long)]
    model: PathBuf,

    /// 输入图片
    #[arg(short, long)]
    source: PathBuf,

    /// 输出图片 (默认: <源文件名>_detected.png)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 类别名称文件 (每行一个)
    #[arg(short, long)]
    labels: Option<PathBuf>,

    /// 标签字体 (ttf/otf)
    #[arg(long)]
    font: Option<PathBuf>,

    /// 置信度阈值
    #[arg(long)]
    conf: Option<f32>,

    /// NMS IOU阈值
    #[arg(long)]
    iou: Option<f32>,

    /// 优先使用CUDA
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// CUDA设备号
    #[arg(long, default_value_t = 0)]
    device_id: i32,

    /// 检测器配置文件 (JSON)
    #[arg(long)]
    detector_config: Option<PathBuf>,
}

/// 收集预览图, 检测结束后交给主线程
struct ImageListener {
    labels: Vec<String>,
    preview: Mutex<Option<RgbaImage>>,
    done: Sender<Option<RgbaImage>>,
}

impl DetectorListener for ImageListener {
    fn on_detect(&self, boxes: &[BoundingBox], inference_ms: u64) {
        println!("🎯 检测到 {} 个目标 ({}ms)", boxes.len(), inference_ms);
        for b in boxes {
            let name = self.labels.get(b.class_index).map(String::as_str).unwrap_or("?");
            println!(
                "   {} {:.1}% [{:.3}, {:.3}, {:.3}, {:.3}]",
                name,
                b.confidence * 100.0,
                b.x1,
                b.y1,
                b.x2,
                b.y2
            );
        }
        let preview = self.preview.lock().ok().and_then(|mut p| p.take());
        let _ = self.done.send(preview);
    }

    fn on_empty_detect(&self, _frame: &DynamicImage) {
        println!("🔍 未检测到目标");
        let _ = self.done.send(None);
    }

    fn wants_preview(&self) -> bool {
        true
    }

    fn on_preview(&self, processed: &RgbaImage) {
        if let Ok(mut preview) = self.preview.lock() {
            *preview = Some(processed.clone());
        }
    }
}

fn default_output(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    source.with_file_name(format!("{}_detected.png", stem))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = args
        .detector_config
        .as_deref()
        .map(DetectorConfig::load)
        .transpose()?
        .unwrap_or_default();
    if let Some(conf) = args.conf {
        config.conf_threshold = conf;
    }
    if let Some(iou) = args.iou {
        config.iou_threshold = IouThreshold::new(iou)?;
    }
    if args.cuda {
        config.cuda = true;
        config.device_id = args.device_id;
    }

    let labels = match &args.labels {
        Some(path) => load_labels(path)?,
        None => Vec::new(),
    };
    let font = args.font.as_deref().map(Annotator::load_font).transpose()?;

    let (tx, rx) = crossbeam_channel::bounded(1);
    let listener = Arc::new(ImageListener {
        labels: labels.clone(),
        preview: Mutex::new(None),
        done: tx,
    });

    let preferred = if config.cuda {
        ExecutionProvider::Cuda(config.device_id)
    } else {
        ExecutionProvider::Cpu
    };
    let mut detector = Detector::with_fallback(
        engine_factory(args.model.clone(), (config.input_width, config.input_height)),
        preferred,
        Annotator::new(labels, font),
        listener,
        &config,
    )?;
    if !detector.is_ready() {
        return Err(anyhow!("❌ 推理引擎初始化失败"));
    }

    detector.detect_from_path(&args.source)?;
    let annotated = rx
        .recv_timeout(Duration::from_secs(60))
        .map_err(|_| anyhow!("detection timed out"))?;
    detector.close();

    if let Some(annotated) = annotated {
        let output = args.output.unwrap_or_else(|| default_output(&args.source));
        annotated.save(&output)?;
        println!("💾 已保存: {}", output.display());
    }

    Ok(())
}
