/// 视频处理流水线 (Video Processing Pipeline)
///
/// 会话线程 + 监视线程 + 检测线程:
/// - Session:  探测 → 抽帧 → 保存 → 编码 (阻塞操作都在这里)
/// - Monitor:  按序号把抽出的帧交给检测线程
/// - Detector: 目标检测, 完成回调按顺序收集标注帧
///
/// 同一时间只允许一个会话.
pub mod monitor;
pub mod session;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use image::codecs::jpeg::JpegEncoder;
use rayon::prelude::*;
use tempfile::TempDir;

use crate::config::{validate_frame_rate, PipelineConfig};
use crate::detection::Detector;
use crate::error::{Error, Result};
use crate::gen_time_string;
use crate::media::{
    count_frame_files, digit_count, progress, EncodeRequest, ExtractRequest, JobOutcome, JobStatus,
    MediaToolkit,
};

pub use monitor::{ExtractionSignal, FrameExtractionMonitor, FrameUnit, MonitorState, MonitorStep};
pub use session::{
    EncodeResult, PipelineEvent, PipelineState, SessionHandle, SourceMeta, Stage,
};

use session::{ProgressSink, SessionShared};

/// 等待检测完成时检查取消的间隔
const COMPLETION_WAIT: Duration = Duration::from_millis(20);

/// 一次处理请求
#[derive(Clone, Debug)]
pub struct VideoRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// 为空时使用配置中的帧率
    pub target_fps: Option<f64>,
}

pub struct VideoPipeline<T: MediaToolkit + 'static> {
    toolkit: Arc<T>,
    detector: Arc<Detector>,
    config: PipelineConfig,
    active: Arc<AtomicBool>,
}

impl<T: MediaToolkit + 'static> VideoPipeline<T> {
    pub fn new(toolkit: T, detector: Arc<Detector>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            toolkit: Arc::new(toolkit),
            detector,
            config,
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn toolkit(&self) -> &T {
        &self.toolkit
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 是否有会话正在运行
    pub fn is_processing(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 开始处理; 已有会话在运行时返回 `None`
    pub fn start(&self, request: VideoRequest, events: Sender<PipelineEvent>) -> Option<SessionHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::info!("⏳ 已有处理任务在运行, 忽略本次请求");
            return None;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(SessionShared::new());
        let session = Session {
            toolkit: self.toolkit.clone(),
            detector: self.detector.clone(),
            config: self.config.clone(),
            request,
            cancel: cancel.clone(),
            progress: ProgressSink::new(shared.clone(), events, self.detector.progress_listener()),
        };

        let active = ActiveGuard(self.active.clone());
        let spawned = thread::Builder::new()
            .name("video-session".to_string())
            .spawn(move || {
                let _active = active;
                session.run();
            });

        match spawned {
            Ok(thread) => Some(SessionHandle::new(cancel, shared, thread)),
            Err(e) => {
                log::error!("❌ 会话线程启动失败: {}", e);
                None
            }
        }
    }
}

/// 会话线程退出时 (包括 panic) 释放占用标志
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 检测完成回调写入的标注帧 (唯一写者)
struct FrameCollector {
    state: Mutex<Collected>,
    ready: Condvar,
    progress: ProgressSink,
}

#[derive(Default)]
struct Collected {
    frames: Vec<FrameUnit>,
    /// 已经上报过进度的帧数
    reported: usize,
    closed: bool,
}

impl FrameCollector {
    fn new(progress: ProgressSink) -> Self {
        Self {
            state: Mutex::new(Collected::default()),
            ready: Condvar::new(),
            progress,
        }
    }

    /// 进度在锁外上报; 等待者以 `reported` 为准, 看到最后一帧时进度已经发出
    fn push(&self, frame: FrameUnit) {
        let processed = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            state.frames.push(frame);
            state.frames.len()
        };

        self.progress.frames_processed(processed);

        if let Ok(mut state) = self.state.lock() {
            state.reported = processed;
        }
        self.ready.notify_all();
    }

    /// 等待收齐 `count` 帧; 取消时返回 `false`
    fn wait_for(&self, count: usize, cancel: &AtomicBool) -> Result<bool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Worker("frame buffer poisoned".to_string()))?;
        while state.reported < count {
            if cancel.load(Ordering::Relaxed) {
                return Ok(false);
            }
            state = self
                .ready
                .wait_timeout(state, COMPLETION_WAIT)
                .map_err(|_| Error::Worker("frame buffer poisoned".to_string()))?
                .0;
        }
        Ok(true)
    }

    /// 关闭后迟到的检测结果直接丢弃; 等正在上报的那一帧结束后才返回
    fn close(&self) -> Vec<FrameUnit> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        state.closed = true;
        match self
            .ready
            .wait_while(state, |state| state.reported < state.frames.len())
        {
            Ok(mut state) => std::mem::take(&mut state.frames),
            Err(_) => Vec::new(),
        }
    }
}

/// 离开 `extract_and_detect` 时 (包括出错和取消) 关闭收集器
struct CloseOnExit<'a>(&'a FrameCollector);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        let discarded = self.0.close();
        if !discarded.is_empty() {
            log::debug!("🗑️ 丢弃 {} 帧未使用的检测结果", discarded.len());
        }
    }
}

struct Session<T: MediaToolkit> {
    toolkit: Arc<T>,
    detector: Arc<Detector>,
    config: PipelineConfig,
    request: VideoRequest,
    cancel: Arc<AtomicBool>,
    progress: ProgressSink,
}

impl<T: MediaToolkit + 'static> Session<T> {
    fn run(self) {
        log::info!("▶️ 开始处理视频 {}", self.request.input.display());

        match self.process() {
            Ok(result) => {
                log::info!(
                    "✅ 处理完成: {} (硬件编码: {})",
                    result.output_path.display(),
                    result.used_hardware_acceleration
                );
                self.progress.emit(PipelineEvent::State(PipelineState::Done));
                self.progress.emit(PipelineEvent::Finished(result));
            }
            Err(Error::Cancelled) => {
                log::info!("⏹️ 处理已取消");
                self.progress.emit(PipelineEvent::State(PipelineState::Cancelled));
                self.progress.emit(PipelineEvent::Cancelled);
            }
            Err(e) => {
                log::error!("❌ 处理失败: {}", e);
                self.progress.emit(PipelineEvent::State(PipelineState::Failed));
                self.progress.emit(PipelineEvent::Failed {
                    reason: e.to_string(),
                    log: e.toolkit_log().map(str::to_owned),
                });
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 临时目录在所有退出路径上随 `TempDir` 一起删除
    fn process(&self) -> Result<EncodeResult> {
        self.progress.emit(PipelineEvent::State(PipelineState::Probing));

        let target_fps = self.request.target_fps.unwrap_or(self.config.target_fps);
        validate_frame_rate(target_fps)?;

        let info = self.toolkit.probe(&self.request.input)?;
        let stream = info
            .first_video_stream()
            .ok_or_else(|| Error::NoVideoStream(self.request.input.clone()))?;
        let duration = info.duration_seconds();
        let meta = SourceMeta {
            width: stream.width,
            height: stream.height,
            frame_rate: stream.frame_rate_or_default(),
            duration_seconds: duration,
        };
        self.progress.shared().set_source_meta(meta);

        let expected = (duration * target_fps).floor() as usize;
        self.progress.shared().set_total_expected_frames(expected);
        let hardware = self.toolkit.hardware_acceleration_available();
        log::info!(
            "🎥 {}x{} @ {:.2}fps, {:.2}s → 抽帧 {}fps, 预计 {} 帧, 硬件加速: {}",
            meta.width,
            meta.height,
            meta.frame_rate,
            duration,
            target_fps,
            expected,
            hardware
        );
        self.check_cancelled()?;

        self.progress
            .emit(PipelineEvent::State(PipelineState::ExtractingDetecting));
        let frames = self.extract_and_detect(target_fps, expected, hardware)?;
        self.check_cancelled()?;

        self.progress.emit(PipelineEvent::State(PipelineState::Encoding));
        self.encode(frames, target_fps, duration, hardware)
    }

    fn extract_and_detect(&self, target_fps: f64, expected: usize, hardware: bool) -> Result<Vec<FrameUnit>> {
        let extract_dir = scratch_dir(&self.config.work_dir, "extract")?;
        let digits = digit_count(expected);
        let collector = Arc::new(FrameCollector::new(self.progress.clone()));
        let _close = CloseOnExit(collector.as_ref());
        let (signal_tx, signal_rx) = crossbeam_channel::bounded(1);

        let monitor_thread = {
            let dir = extract_dir.path().to_path_buf();
            let cancel = self.cancel.clone();
            let detector = self.detector.clone();
            let collector = collector.clone();
            let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
            thread::Builder::new()
                .name("frame-monitor".to_string())
                .spawn(move || {
                    let mut monitor = FrameExtractionMonitor::new(dir, digits, Some(target_fps), poll_interval);
                    let state = monitor.run(&signal_rx, &cancel, |frame| {
                        let FrameUnit {
                            sequence_index,
                            image,
                            source_timestamp,
                        } = frame;
                        let collector = collector.clone();
                        detector.detect(
                            image,
                            Some(Box::new(move |outcome| {
                                collector.push(FrameUnit {
                                    sequence_index,
                                    image: outcome.frame,
                                    source_timestamp,
                                });
                            })),
                        );
                    });
                    (state, monitor.next_expected_index())
                })?
        };

        let request = ExtractRequest {
            input: self.request.input.clone(),
            output_dir: extract_dir.path().to_path_buf(),
            frame_rate: target_fps,
            digits,
            hardware_acceleration: hardware,
        };
        let outcome = self
            .toolkit
            .extract_frames(&request, &self.cancel, &mut |line: &str| log::debug!("[ffmpeg] {}", line));

        let extraction = self.finish_extraction(&outcome, extract_dir.path());
        let signal = match &extraction {
            Ok(frame_count) => ExtractionSignal::Completed {
                frame_count: *frame_count,
            },
            Err(_) => ExtractionSignal::Failed,
        };
        let _ = signal_tx.send(signal);

        let (monitor_state, dispatched) = monitor_thread
            .join()
            .map_err(|_| Error::Worker("frame monitor panicked".to_string()))?;
        extraction?;

        match monitor_state {
            MonitorState::Done => {}
            MonitorState::Cancelled => return Err(Error::Cancelled),
            MonitorState::Failed(reason) => return Err(Error::Extraction { log: reason }),
            other => return Err(Error::Worker(format!("monitor stopped in state {:?}", other))),
        }

        if !collector.wait_for(dispatched, &self.cancel)? {
            return Err(Error::Cancelled);
        }
        let frames = collector.close();
        if frames.is_empty() {
            return Err(Error::NoFrames);
        }

        // 对齐后的最终进度
        self.progress.frames_processed(frames.len());
        log::info!("🔍 检测完成: {} 帧", frames.len());
        Ok(frames)
    }

    /// 抽帧结束后以磁盘上的实际帧数为准
    fn finish_extraction(&self, outcome: &JobOutcome, dir: &Path) -> Result<usize> {
        match outcome.status {
            JobStatus::Success => {
                let frame_count = count_frame_files(dir)?;
                let expected = self.progress.shared().total_expected_frames();
                if frame_count != expected {
                    log::info!("📐 帧数对齐: 预计 {} → 实际 {}", expected, frame_count);
                }
                self.progress.shared().set_total_expected_frames(frame_count);
                Ok(frame_count)
            }
            JobStatus::Cancelled => Err(Error::Cancelled),
            JobStatus::Failed { exit_code } => {
                log::error!("❌ 抽帧失败, 退出码 {:?}", exit_code);
                Err(Error::Extraction {
                    log: outcome.log.clone(),
                })
            }
        }
    }

    fn encode(&self, frames: Vec<FrameUnit>, target_fps: f64, duration: f64, hardware: bool) -> Result<EncodeResult> {
        let encode_dir = scratch_dir(&self.config.work_dir, "encode")?;
        self.save_frames(&frames, encode_dir.path())?;
        drop(frames);
        self.check_cancelled()?;

        let mut request = EncodeRequest {
            input_dir: encode_dir.path().to_path_buf(),
            output: self.request.output.clone(),
            frame_rate: target_fps,
            hardware_acceleration: hardware,
        };

        let mut outcome = self.run_encoder(&request, duration);
        if hardware && matches!(outcome.status, JobStatus::Failed { .. }) {
            log::warn!("⚠️ 硬件编码失败, 改用软件编码重试");
            request.hardware_acceleration = false;
            outcome = self.run_encoder(&request, duration);
        }

        match outcome.status {
            JobStatus::Success => {
                self.progress
                    .report(Stage::Encoding, 1.0, "encoding finished".to_string());
                Ok(EncodeResult {
                    output_path: request.output,
                    used_hardware_acceleration: request.hardware_acceleration,
                })
            }
            JobStatus::Cancelled => Err(Error::Cancelled),
            JobStatus::Failed { .. } => Err(Error::Encoding { log: outcome.log }),
        }
    }

    fn run_encoder(&self, request: &EncodeRequest, duration: f64) -> JobOutcome {
        self.progress.report(
            Stage::Encoding,
            0.0,
            if request.hardware_acceleration {
                "hardware encoding".to_string()
            } else {
                "software encoding".to_string()
            },
        );
        self.toolkit.encode_frames(request, &self.cancel, &mut |line: &str| {
            log::debug!("[ffmpeg] {}", line);
            if let Some(fraction) = progress::parse_progress(line, duration) {
                self.progress.report(Stage::Encoding, fraction, line.to_string());
            }
        })
    }

    /// 并行保存为 `frame_<序号>.jpg` (从0开始, 不补零)
    fn save_frames(&self, frames: &[FrameUnit], dir: &Path) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.save_workers)
            .thread_name(|i| format!("frame-save-{}", i))
            .build()
            .map_err(|e| Error::Worker(e.to_string()))?;

        let total = frames.len();
        let saved = AtomicUsize::new(0);
        // 多个线程同时完成时只上报更大的计数, 保证进度不回退
        let reported = Mutex::new(0usize);
        let quality = self.config.jpeg_quality;

        pool.install(|| {
            frames.par_iter().enumerate().try_for_each(|(index, frame)| {
                self.check_cancelled()?;
                save_jpeg(&frame.image, &dir.join(format!("frame_{}.jpg", index)), quality)
                    .map_err(|source| Error::FrameSave { index, source })?;
                let done = saved.fetch_add(1, Ordering::Relaxed) + 1;
                if let Ok(mut last) = reported.lock() {
                    if done > *last {
                        *last = done;
                        self.progress
                            .report(Stage::Saving, done as f32 / total as f32, format!("{}/{}", done, total));
                    }
                }
                Ok(())
            })
        })
    }
}

fn save_jpeg(image: &image::DynamicImage, path: &Path, quality: u8) -> image::ImageResult<()> {
    let file = File::create(path).map_err(image::ImageError::IoError)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(&image.to_rgb8())?;
    writer.flush().map_err(image::ImageError::IoError)
}

/// 在 `work_dir` 下创建唯一的临时目录 (前缀 + 时间戳 + 随机后缀)
fn scratch_dir(work_dir: &Path, purpose: &str) -> Result<TempDir> {
    fs::create_dir_all(work_dir)?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}_{}_", purpose, gen_time_string("")))
        .tempdir_in(work_dir)?;
    log::debug!("📁 临时目录 {}", dir.path().display());
    Ok(dir)
}
