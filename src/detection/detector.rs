//! 检测器 (Detector)
//! 职责: 接收图像 → 缩放+归一化 → 推理 → 解码 → NMS → 通知监听者
//!
//! 推理引擎只在一个专用工作线程中使用, 所有请求按提交顺序 (FIFO) 处理.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use fast_image_resize as fr;
use image::{DynamicImage, RgbaImage};
use ndarray::Array4;

use super::decode::decode_boxes;
use super::nms::{non_max_suppression, IouThreshold};
use super::render::Annotator;
use super::types::{BoundingBox, DetectionTensor};
use crate::config::DetectorConfig;
use crate::error::Result;
use crate::models::{ExecutionProvider, InferenceEngine};

const INPUT_MEAN: f32 = 0.0;
const INPUT_STANDARD_DEVIATION: f32 = 255.0;

/// 检测事件监听者
///
/// `on_detect` / `on_empty_detect` 必须实现; 预览和进度是可选能力,
/// 通过 `wants_preview` 在注册时声明.
pub trait DetectorListener: Send + Sync {
    fn on_detect(&self, boxes: &[BoundingBox], inference_ms: u64);

    fn on_empty_detect(&self, frame: &DynamicImage);

    /// 是否需要标注后的预览图 (注册时读取一次)
    fn wants_preview(&self) -> bool {
        false
    }

    /// 标注图, 在 `on_detect` 之前送达
    fn on_preview(&self, _processed: &RgbaImage) {}

    /// 处理进度 `[0, 1]`
    fn on_progress(&self, _progress: f32, _info: &str) {}
}

/// 不关心事件时使用
pub struct NoopListener;

impl DetectorListener for NoopListener {
    fn on_detect(&self, _boxes: &[BoundingBox], _inference_ms: u64) {}

    fn on_empty_detect(&self, _frame: &DynamicImage) {}
}

/// 单次检测的结果 (传给 `detect` 的完成回调)
#[derive(Clone, Debug)]
pub struct DetectionOutcome {
    /// 有检测框时为标注后的副本, 否则为原图
    pub frame: DynamicImage,
    pub boxes: Vec<BoundingBox>,
    pub inference_ms: u64,
}

pub type Completion = Box<dyn FnOnce(DetectionOutcome) + Send + 'static>;

struct Job {
    image: DynamicImage,
    on_complete: Option<Completion>,
}

pub struct Detector {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    iou_threshold: Arc<AtomicU32>,
    listener: Arc<dyn DetectorListener>,
    wants_preview: bool,
    ready: bool,
}

impl Detector {
    /// 启动检测线程
    ///
    /// `engine` 为 `None` 时检测被禁用, 每次调用都报告空检测.
    pub fn new(
        engine: Option<Box<dyn InferenceEngine>>,
        annotator: Annotator,
        listener: Arc<dyn DetectorListener>,
        config: &DetectorConfig,
    ) -> Result<Self> {
        config.validate()?;

        let ready = engine.is_some();
        let wants_preview = listener.wants_preview();
        let iou_threshold = Arc::new(AtomicU32::new(config.iou_threshold.get().to_bits()));

        let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let mut worker = Worker {
            engine,
            annotator,
            listener: listener.clone(),
            wants_preview,
            conf_threshold: config.conf_threshold,
            iou_threshold: iou_threshold.clone(),
        };

        let handle = thread::Builder::new()
            .name("detector".to_string())
            .spawn(move || {
                log::debug!("🔍 检测线程启动");
                while let Ok(job) = rx.recv() {
                    worker.process(job);
                }
                log::debug!("🔍 检测线程退出");
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(handle),
            iou_threshold,
            listener,
            wants_preview,
            ready,
        })
    }

    /// 先用首选设备创建引擎, 失败后退回CPU; 都失败则禁用检测
    pub fn with_fallback<F>(
        factory: F,
        preferred: ExecutionProvider,
        annotator: Annotator,
        listener: Arc<dyn DetectorListener>,
        config: &DetectorConfig,
    ) -> Result<Self>
    where
        F: Fn(ExecutionProvider) -> anyhow::Result<Box<dyn InferenceEngine>>,
    {
        let engine = setup_engine(factory, preferred);
        Self::new(engine, annotator, listener, config)
    }

    /// 推理引擎是否可用
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn iou_threshold(&self) -> f32 {
        f32::from_bits(self.iou_threshold.load(Ordering::Relaxed))
    }

    /// 更新IOU阈值, 范围 `[0, 1]`, 下一次检测生效
    pub fn set_iou_threshold(&self, threshold: f32) -> Result<()> {
        let threshold = IouThreshold::new(threshold)?;
        self.iou_threshold
            .store(threshold.get().to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// 异步检测: 放入队列后立即返回
    ///
    /// `on_complete` 在检测线程中恰好调用一次.
    pub fn detect(&self, image: DynamicImage, on_complete: Option<Completion>) {
        let job = Job { image, on_complete };
        let job = match &self.tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => job,
        };

        log::warn!("⚠️ 检测线程已退出, 返回空检测");
        if let Some(on_complete) = job.on_complete {
            on_complete(DetectionOutcome {
                frame: job.image,
                boxes: Vec::new(),
                inference_ms: 0,
            });
        }
    }

    /// 读取图片文件并检测
    pub fn detect_from_path(&self, path: &Path) -> Result<()> {
        let image = image::open(path)?;
        self.detect(image, None);
        Ok(())
    }

    /// 声明了预览能力的监听者 (用于转发处理进度)
    pub fn progress_listener(&self) -> Option<Arc<dyn DetectorListener>> {
        self.wants_preview.then(|| self.listener.clone())
    }

    /// 关闭队列, 等待已提交的检测完成
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("❌ 检测线程异常退出");
            }
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.close();
    }
}

fn setup_engine<F>(factory: F, preferred: ExecutionProvider) -> Option<Box<dyn InferenceEngine>>
where
    F: Fn(ExecutionProvider) -> anyhow::Result<Box<dyn InferenceEngine>>,
{
    match factory(preferred) {
        Ok(engine) => return Some(engine),
        Err(e) if preferred != ExecutionProvider::Cpu => {
            log::warn!("⚠️ {} 推理初始化失败, 退回CPU: {:#}", preferred.name(), e);
        }
        Err(e) => {
            log::error!("❌ 推理引擎初始化失败, 检测已禁用: {:#}", e);
            return None;
        }
    }

    match factory(ExecutionProvider::Cpu) {
        Ok(engine) => Some(engine),
        Err(e) => {
            log::error!("❌ CPU推理初始化失败, 检测已禁用: {:#}", e);
            None
        }
    }
}

/// 检测线程状态, 独占推理引擎
struct Worker {
    engine: Option<Box<dyn InferenceEngine>>,
    annotator: Annotator,
    listener: Arc<dyn DetectorListener>,
    wants_preview: bool,
    conf_threshold: f32,
    iou_threshold: Arc<AtomicU32>,
}

impl Worker {
    fn process(&mut self, job: Job) {
        let Job { image, on_complete } = job;

        let start = Instant::now();
        let boxes = self.infer(&image);
        let inference_ms = start.elapsed().as_millis() as u64;

        if boxes.is_empty() {
            self.listener.on_empty_detect(&image);
            if let Some(on_complete) = on_complete {
                on_complete(DetectionOutcome {
                    frame: image,
                    boxes,
                    inference_ms,
                });
            }
            return;
        }

        let annotated = if self.wants_preview || on_complete.is_some() {
            Some(self.annotator.annotate(&image, &boxes))
        } else {
            None
        };

        if self.wants_preview {
            if let Some(annotated) = &annotated {
                self.listener.on_preview(annotated);
            }
        }
        self.listener.on_detect(&boxes, inference_ms);

        if let Some(on_complete) = on_complete {
            let frame = annotated.map(DynamicImage::ImageRgba8).unwrap_or(image);
            on_complete(DetectionOutcome {
                frame,
                boxes,
                inference_ms,
            });
        }
    }

    /// 任何失败都视为空检测
    fn infer(&mut self, image: &DynamicImage) -> Vec<BoundingBox> {
        let Some(engine) = self.engine.as_mut() else {
            return Vec::new();
        };

        let (width, height) = engine.input_shape();
        let (num_channels, num_elements) = engine.output_shape();
        if width == 0 || height == 0 || num_channels == 0 || num_elements == 0 {
            return Vec::new();
        }

        let xs = match preprocess(image, width, height) {
            Ok(xs) => xs,
            Err(e) => {
                log::warn!("⚠️ 预处理失败: {:#}", e);
                return Vec::new();
            }
        };

        let ys = match engine.run(&xs) {
            Ok(ys) => ys,
            Err(e) => {
                log::warn!("⚠️ 推理失败: {:#}", e);
                return Vec::new();
            }
        };

        let tensor = match DetectionTensor::from_array(ys) {
            Ok(tensor) => tensor,
            Err(e) => {
                log::warn!("⚠️ 输出格式错误: {}", e);
                return Vec::new();
            }
        };

        let iou_threshold =
            IouThreshold::new(f32::from_bits(self.iou_threshold.load(Ordering::Relaxed)))
                .unwrap_or_default();
        let candidates = decode_boxes(&tensor, self.conf_threshold);
        non_max_suppression(&candidates, iou_threshold)
    }
}

/// 缩放到模型输入尺寸 (最近邻) 并转换为 NCHW `[1, 3, H, W]`, 像素归一化到 `[0, 1]`
pub fn preprocess(image: &DynamicImage, width: u32, height: u32) -> anyhow::Result<Array4<f32>> {
    let rgb = image.to_rgb8();
    let (w0, h0) = rgb.dimensions();

    let src_image = fr::images::Image::from_vec_u8(w0, h0, rgb.into_raw(), fr::PixelType::U8x3)?;
    let mut dst_image = fr::images::Image::new(width, height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer.resize(
        &src_image,
        &mut dst_image,
        &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
    )?;

    let (w, h) = (width as usize, height as usize);
    let mut xs = Array4::<f32>::zeros((1, 3, h, w));
    for (i, rgb) in dst_image.buffer().chunks_exact(3).enumerate() {
        let (y, x) = (i / w, i % w);
        xs[[0, 0, y, x]] = (rgb[0] as f32 - INPUT_MEAN) / INPUT_STANDARD_DEVIATION;
        xs[[0, 1, y, x]] = (rgb[1] as f32 - INPUT_MEAN) / INPUT_STANDARD_DEVIATION;
        xs[[0, 2, y, x]] = (rgb[2] as f32 - INPUT_MEAN) / INPUT_STANDARD_DEVIATION;
    }

    Ok(xs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 固定输出的假引擎
    struct FakeEngine {
        input: (u32, u32),
        output: (usize, usize),
        data: Vec<f32>,
        seen: Arc<Mutex<Vec<(usize, usize, usize, usize)>>>,
    }

    impl InferenceEngine for FakeEngine {
        fn input_shape(&self) -> (u32, u32) {
            self.input
        }

        fn output_shape(&self) -> (usize, usize) {
            self.output
        }

        fn run(&mut self, input: &Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
            let s = input.shape();
            self.seen.lock().unwrap().push((s[0], s[1], s[2], s[3]));
            let (c, n) = self.output;
            Ok(ArrayD::from_shape_vec(IxDyn(&[1, c, n]), self.data.clone())?)
        }
    }

    /// 一个类别0的框 (0.5, 0.5, 0.2, 0.2) conf 0.9, 另一个 anchor 低于阈值
    fn one_box_engine(seen: Arc<Mutex<Vec<(usize, usize, usize, usize)>>>) -> Box<dyn InferenceEngine> {
        let n = 2;
        let mut data = vec![0.0; 6 * n];
        for (ch, v) in [0.5, 0.5, 0.2, 0.2, 0.9, 0.1].iter().enumerate() {
            data[ch * n] = *v;
        }
        Box::new(FakeEngine {
            input: (32, 24),
            output: (6, n),
            data,
            seen,
        })
    }

    #[derive(Default)]
    struct Recorder {
        preview: bool,
        events: Mutex<Vec<String>>,
    }

    impl DetectorListener for Recorder {
        fn on_detect(&self, boxes: &[BoundingBox], _inference_ms: u64) {
            self.events.lock().unwrap().push(format!("detect:{}", boxes.len()));
        }

        fn on_empty_detect(&self, _frame: &DynamicImage) {
            self.events.lock().unwrap().push("empty".to_string());
        }

        fn wants_preview(&self) -> bool {
            self.preview
        }

        fn on_preview(&self, _processed: &RgbaImage) {
            self.events.lock().unwrap().push("preview".to_string());
        }

        fn on_progress(&self, progress: f32, _info: &str) {
            self.events.lock().unwrap().push(format!("progress:{:.1}", progress));
        }
    }

    fn detect_blocking(detector: &Detector, image: DynamicImage) -> DetectionOutcome {
        let (tx, rx) = crossbeam_channel::bounded(1);
        detector.detect(
            image,
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_detect_emits_preview_before_detect() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(Recorder {
            preview: true,
            ..Default::default()
        });
        let detector = Detector::new(
            Some(one_box_engine(seen.clone())),
            Annotator::new(vec!["tricycle".into()], None),
            listener.clone(),
            &DetectorConfig::default(),
        )
        .unwrap();

        let outcome = detect_blocking(&detector, DynamicImage::new_rgb8(64, 48));
        assert_eq!(outcome.boxes.len(), 1);
        assert_eq!(outcome.boxes[0].class_index, 0);
        // 标注副本与原图同尺寸
        assert_eq!((outcome.frame.width(), outcome.frame.height()), (64, 48));

        assert_eq!(*listener.events.lock().unwrap(), vec!["preview", "detect:1"]);
        // NCHW, H=24, W=32
        assert_eq!(seen.lock().unwrap()[0], (1, 3, 24, 32));

        detector.progress_listener().unwrap().on_progress(0.5, "encoding");
        assert_eq!(listener.events.lock().unwrap().last().unwrap(), "progress:0.5");
    }

    #[test]
    fn test_without_preview_capability_no_preview_event() {
        let listener = Arc::new(Recorder::default());
        let detector = Detector::new(
            Some(one_box_engine(Arc::default())),
            Annotator::new(Vec::new(), None),
            listener.clone(),
            &DetectorConfig::default(),
        )
        .unwrap();

        detect_blocking(&detector, DynamicImage::new_rgb8(16, 16));
        assert!(detector.progress_listener().is_none());
        assert_eq!(*listener.events.lock().unwrap(), vec!["detect:1"]);
    }

    #[test]
    fn test_missing_engine_reports_empty() {
        let listener = Arc::new(Recorder::default());
        let detector = Detector::new(
            None,
            Annotator::new(Vec::new(), None),
            listener.clone(),
            &DetectorConfig::default(),
        )
        .unwrap();
        assert!(!detector.is_ready());

        let image = DynamicImage::new_rgb8(8, 8);
        let outcome = detect_blocking(&detector, image.clone());
        assert!(outcome.boxes.is_empty());
        assert_eq!(outcome.frame, image);
        assert_eq!(*listener.events.lock().unwrap(), vec!["empty"]);
    }

    #[test]
    fn test_uninitialized_dimensions_report_empty() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = Box::new(FakeEngine {
            input: (0, 0),
            output: (6, 2),
            data: vec![0.0; 12],
            seen: seen.clone(),
        });
        let listener = Arc::new(Recorder::default());
        let detector = Detector::new(
            Some(engine),
            Annotator::new(Vec::new(), None),
            listener.clone(),
            &DetectorConfig::default(),
        )
        .unwrap();

        let outcome = detect_blocking(&detector, DynamicImage::new_rgb8(8, 8));
        assert!(outcome.boxes.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detect_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        image::RgbImage::new(16, 16).save(&path).unwrap();

        let listener = Arc::new(Recorder::default());
        let mut detector = Detector::new(
            Some(one_box_engine(Arc::default())),
            Annotator::new(Vec::new(), None),
            listener.clone(),
            &DetectorConfig::default(),
        )
        .unwrap();

        detector.detect_from_path(&path).unwrap();
        assert!(detector.detect_from_path(&dir.path().join("missing.png")).is_err());
        detector.close();
        assert_eq!(*listener.events.lock().unwrap(), vec!["detect:1"]);
    }

    #[test]
    fn test_iou_threshold_validation() {
        let detector = Detector::new(
            None,
            Annotator::new(Vec::new(), None),
            Arc::new(NoopListener),
            &DetectorConfig::default(),
        )
        .unwrap();
        assert_eq!(detector.iou_threshold(), 0.7);
        assert!(detector.set_iou_threshold(0.5).is_ok());
        assert_eq!(detector.iou_threshold(), 0.5);
        assert!(detector.set_iou_threshold(1.2).is_err());
        assert_eq!(detector.iou_threshold(), 0.5);
    }

    #[test]
    fn test_fallback_to_cpu() {
        let calls = Mutex::new(Vec::new());
        let engine = setup_engine(
            |provider| {
                calls.lock().unwrap().push(provider);
                match provider {
                    ExecutionProvider::Cuda(_) => anyhow::bail!("no gpu"),
                    ExecutionProvider::Cpu => Ok(one_box_engine(Arc::default())),
                }
            },
            ExecutionProvider::Cuda(0),
        );
        assert!(engine.is_some());
        assert_eq!(
            *calls.lock().unwrap(),
            vec![ExecutionProvider::Cuda(0), ExecutionProvider::Cpu]
        );

        let disabled = setup_engine(|_| anyhow::bail!("broken model"), ExecutionProvider::Cuda(0));
        assert!(disabled.is_none());
    }

    #[test]
    fn test_results_arrive_in_submission_order() {
        let detector = Detector::new(
            Some(one_box_engine(Arc::default())),
            Annotator::new(Vec::new(), None),
            Arc::new(NoopListener),
            &DetectorConfig::default(),
        )
        .unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..20usize {
            let tx = tx.clone();
            detector.detect(
                DynamicImage::new_rgb8(8 + i as u32, 8),
                Some(Box::new(move |_| {
                    let _ = tx.send(i);
                })),
            );
        }
        let order: Vec<usize> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_preprocess_normalizes_to_unit_range() {
        let mut img = image::RgbImage::new(4, 4);
        for p in img.pixels_mut() {
            *p = image::Rgb([255, 0, 51]);
        }
        let xs = preprocess(&DynamicImage::ImageRgb8(img), 2, 3).unwrap();
        assert_eq!(xs.shape(), &[1, 3, 3, 2]);
        assert_eq!(xs[[0, 0, 2, 1]], 1.0);
        assert_eq!(xs[[0, 1, 0, 0]], 0.0);
        assert!((xs[[0, 2, 1, 1]] - 0.2).abs() < 1e-6);
    }
}
