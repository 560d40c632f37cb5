//! 处理会话: 状态/事件类型 + 调用方持有的会话句柄

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::detection::DetectorListener;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Probing,
    ExtractingDetecting,
    Encoding,
    Done,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Cancelled | PipelineState::Failed
        )
    }
}

/// 进度所属阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Detecting,
    Saving,
    Encoding,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Detecting => "detecting",
            Stage::Saving => "saving",
            Stage::Encoding => "encoding",
        }
    }
}

/// 源视频元数据
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceMeta {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration_seconds: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EncodeResult {
    pub output_path: PathBuf,
    pub used_hardware_acceleration: bool,
}

/// 流水线事件; 每次运行恰好一个终止事件 (Finished / Failed / Cancelled)
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    State(PipelineState),
    Progress {
        stage: Stage,
        fraction: f32,
        info: String,
    },
    Finished(EncodeResult),
    Failed {
        reason: String,
        log: Option<String>,
    },
    Cancelled,
}

impl PipelineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Finished(_) | PipelineEvent::Failed { .. } | PipelineEvent::Cancelled
        )
    }
}

/// 会话线程与句柄共享的状态
pub(crate) struct SessionShared {
    state: Mutex<PipelineState>,
    progress: AtomicU32,
    source_meta: Mutex<Option<SourceMeta>>,
    processed_count: AtomicUsize,
    total_expected_frames: AtomicUsize,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            progress: AtomicU32::new(0f32.to_bits()),
            source_meta: Mutex::new(None),
            processed_count: AtomicUsize::new(0),
            total_expected_frames: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> PipelineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub(crate) fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub(crate) fn set_progress(&self, fraction: f32) {
        self.progress.store(fraction.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn source_meta(&self) -> Option<SourceMeta> {
        self.source_meta.lock().ok().and_then(|m| *m)
    }

    pub(crate) fn set_source_meta(&self, meta: SourceMeta) {
        if let Ok(mut m) = self.source_meta.lock() {
            *m = Some(meta);
        }
    }

    pub(crate) fn processed_count(&self) -> usize {
        self.processed_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_processed_count(&self, count: usize) {
        self.processed_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn total_expected_frames(&self) -> usize {
        self.total_expected_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn set_total_expected_frames(&self, total: usize) {
        self.total_expected_frames.store(total, Ordering::Relaxed);
    }
}

/// 进度上报: 更新共享状态, 发送事件, 转发给检测监听者
#[derive(Clone)]
pub(crate) struct ProgressSink {
    shared: Arc<SessionShared>,
    events: Sender<PipelineEvent>,
    listener: Option<Arc<dyn DetectorListener>>,
}

impl ProgressSink {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        events: Sender<PipelineEvent>,
        listener: Option<Arc<dyn DetectorListener>>,
    ) -> Self {
        Self {
            shared,
            events,
            listener,
        }
    }

    pub(crate) fn shared(&self) -> &SessionShared {
        &self.shared
    }

    pub(crate) fn report(&self, stage: Stage, fraction: f32, info: String) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.shared.set_progress(fraction);
        if let Some(listener) = &self.listener {
            listener.on_progress(fraction, &info);
        }
        let _ = self.events.send(PipelineEvent::Progress {
            stage,
            fraction,
            info,
        });
    }

    /// 检测进度 = 已处理 / 预计总数
    pub(crate) fn frames_processed(&self, processed: usize) {
        self.shared.set_processed_count(processed);
        let total = self.shared.total_expected_frames();
        let fraction = if total == 0 {
            0.0
        } else {
            processed as f32 / total as f32
        };
        self.report(Stage::Detecting, fraction, format!("{}/{}", processed, total));
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        if let PipelineEvent::State(state) = event {
            self.shared.set_state(state);
        }
        let _ = self.events.send(event);
    }
}

/// 会话句柄
///
/// 由 `VideoPipeline::start` 返回; 会话线程退出后流水线才接受新的 `start`.
pub struct SessionHandle {
    cancel: Arc<AtomicBool>,
    shared: Arc<SessionShared>,
    thread: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn new(cancel: Arc<AtomicBool>, shared: Arc<SessionShared>, thread: JoinHandle<()>) -> Self {
        Self {
            cancel,
            shared,
            thread: Some(thread),
        }
    }

    /// 请求取消 (异步), 终止事件为 `Cancelled`
    pub fn stop(&self) {
        log::info!("⏹️ 请求停止处理");
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// 最近一次上报的进度 `[0, 1]`
    pub fn progress(&self) -> f32 {
        self.shared.progress()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn source_meta(&self) -> Option<SourceMeta> {
        self.shared.source_meta()
    }

    pub fn processed_count(&self) -> usize {
        self.shared.processed_count()
    }

    pub fn total_expected_frames(&self) -> usize {
        self.shared.total_expected_frames()
    }

    /// 会话线程是否已退出
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// 等待会话结束, 返回最终状态
    pub fn wait(mut self) -> PipelineState {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("❌ 会话线程异常退出");
                self.shared.set_state(PipelineState::Failed);
            }
        }
        self.shared.state()
    }
}
