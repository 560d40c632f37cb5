//! 抽帧监视器 (FrameExtractionMonitor)
//! 职责: 按序号顺序等待抽帧文件写完 → 解码 → 交给检测线程
//!
//! 状态: Idle → Watching → Draining → Done (或 Cancelled / Failed)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use image::DynamicImage;

use crate::media::frame_file_name;

/// 抽帧结束后, 仍读不到某一帧时的最大重试次数
const DRAIN_RETRY_LIMIT: u32 = 50;

/// 一帧图像及其在源视频中的位置
#[derive(Clone, Debug)]
pub struct FrameUnit {
    pub sequence_index: usize,
    pub image: DynamicImage,
    pub source_timestamp: Option<Duration>,
}

/// 抽帧任务发给监视器的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionSignal {
    /// 抽帧成功, 磁盘上的实际帧数
    Completed { frame_count: usize },
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Watching,
    Draining { total: usize },
    Done,
    Cancelled,
    Failed(String),
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorState::Done | MonitorState::Cancelled | MonitorState::Failed(_)
        )
    }
}

/// 单次轮询的结果
#[derive(Debug)]
pub enum MonitorStep {
    /// 下一帧已就绪
    Ready(FrameUnit),
    /// 还没写完, 稍后再试
    Pending,
    /// 进入终态
    Finished(MonitorState),
}

pub struct FrameExtractionMonitor {
    dir: PathBuf,
    digits: usize,
    target_fps: Option<f64>,
    poll_interval: Duration,
    state: MonitorState,
    next_expected_index: usize,
    drain_retries: u32,
}

impl FrameExtractionMonitor {
    pub fn new(dir: impl Into<PathBuf>, digits: usize, target_fps: Option<f64>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            digits,
            target_fps: target_fps.filter(|fps| fps.is_finite() && *fps > 0.0),
            poll_interval,
            state: MonitorState::Idle,
            next_expected_index: 0,
            drain_retries: 0,
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// 已派发的帧数 (= 下一个期望的序号)
    pub fn next_expected_index(&self) -> usize {
        self.next_expected_index
    }

    /// 阻塞运行到终态, 每个就绪帧按序号顺序交给 `dispatch`
    pub fn run<F>(&mut self, signals: &Receiver<ExtractionSignal>, cancel: &AtomicBool, mut dispatch: F) -> MonitorState
    where
        F: FnMut(FrameUnit),
    {
        log::debug!("👀 开始监视抽帧目录 {}", self.dir.display());
        loop {
            match self.poll(signals, cancel) {
                MonitorStep::Ready(frame) => dispatch(frame),
                MonitorStep::Pending => thread::sleep(self.poll_interval),
                MonitorStep::Finished(state) => {
                    log::debug!("👀 监视结束: {:?}, 共 {} 帧", state, self.next_expected_index);
                    return state;
                }
            }
        }
    }

    /// 轮询一次
    pub fn poll(&mut self, signals: &Receiver<ExtractionSignal>, cancel: &AtomicBool) -> MonitorStep {
        if self.state.is_terminal() {
            return MonitorStep::Finished(self.state.clone());
        }
        if self.state == MonitorState::Idle {
            self.state = MonitorState::Watching;
        }

        if cancel.load(Ordering::Relaxed) {
            return self.finish(MonitorState::Cancelled);
        }

        if self.state == MonitorState::Watching {
            match signals.try_recv() {
                Ok(ExtractionSignal::Completed { frame_count }) => {
                    log::debug!("📦 抽帧完成, 磁盘帧数 {}", frame_count);
                    self.state = MonitorState::Draining { total: frame_count };
                }
                Ok(ExtractionSignal::Failed) => {
                    return self.finish(MonitorState::Failed("frame extraction failed".to_string()));
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return self.finish(MonitorState::Failed(
                        "extraction ended without reporting a result".to_string(),
                    ));
                }
            }
        }

        let extraction_done = match self.state {
            MonitorState::Draining { total } => {
                if self.next_expected_index >= total {
                    return self.finish(MonitorState::Done);
                }
                true
            }
            _ => false,
        };

        match self.try_read_next(extraction_done) {
            Some(image) => {
                let sequence_index = self.next_expected_index;
                self.next_expected_index += 1;
                self.drain_retries = 0;
                MonitorStep::Ready(FrameUnit {
                    sequence_index,
                    image,
                    source_timestamp: self
                        .target_fps
                        .map(|fps| Duration::from_secs_f64(sequence_index as f64 / fps)),
                })
            }
            None if extraction_done => {
                self.drain_retries += 1;
                if self.drain_retries > DRAIN_RETRY_LIMIT {
                    let reason = format!(
                        "frame {} could not be read after extraction finished",
                        self.next_expected_index
                    );
                    log::error!("❌ {}", reason);
                    return self.finish(MonitorState::Failed(reason));
                }
                MonitorStep::Pending
            }
            None => MonitorStep::Pending,
        }
    }

    fn finish(&mut self, state: MonitorState) -> MonitorStep {
        self.state = state.clone();
        MonitorStep::Finished(state)
    }

    fn frame_path(&self, index: usize) -> PathBuf {
        self.dir.join(frame_file_name(index, self.digits))
    }

    /// 下一帧存在、已写完并且能解码时返回图像
    ///
    /// 写完的判断: 后一帧已经出现, 或者抽帧已经结束
    fn try_read_next(&self, extraction_done: bool) -> Option<DynamicImage> {
        let path = self.frame_path(self.next_expected_index);
        if !path.exists() {
            return None;
        }
        if !extraction_done && !self.frame_path(self.next_expected_index + 1).exists() {
            return None;
        }
        decode_frame(&path)
    }
}

fn decode_frame(path: &Path) -> Option<DynamicImage> {
    match image::open(path) {
        Ok(image) => Some(image),
        Err(e) => {
            log::debug!("⏳ {} 暂不可读: {}", path.display(), e);
            None
        }
    }
}
