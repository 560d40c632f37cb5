//! FFmpeg 命令行实现
//! 包含: ffprobe 元数据解析、硬件编码器检测、抽帧/编码子进程管理

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use super::{
    AudioStream, EncodeRequest, ExtractRequest, JobOutcome, MediaInfo, MediaToolkit, VideoStream,
};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};

/// 子进程状态检查间隔
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 硬件编码器 (按优先级)
const HARDWARE_ENCODERS: [&str; 6] = [
    "h264_nvenc",
    "h264_qsv",
    "h264_videotoolbox",
    "h264_amf",
    "h264_mediacodec",
    "hevc_nvenc",
];

/// 软件编码参数
const SOFTWARE_CODEC: &str = "mpeg4";
const SOFTWARE_QUALITY: &str = "5";

pub struct FfmpegToolkit {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    hardware_encoder: OnceCell<Option<String>>,
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl FfmpegToolkit {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            hardware_encoder: OnceCell::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.ffmpeg_bin.clone(), config.ffprobe_bin.clone())
    }

    /// 检测到的硬件编码器 (只检测一次)
    pub fn hardware_encoder(&self) -> Option<&str> {
        self.hardware_encoder
            .get_or_init(|| self.detect_hardware_encoder())
            .as_deref()
    }

    fn detect_hardware_encoder(&self) -> Option<String> {
        let output = match Command::new(&self.ffmpeg_bin)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                log::warn!("⚠️ ffmpeg -encoders 退出码 {:?}", output.status.code());
                return None;
            }
            Err(e) => {
                log::warn!("⚠️ 无法运行 {}: {}", self.ffmpeg_bin, e);
                return None;
            }
        };

        let listing = String::from_utf8_lossy(&output.stdout);
        let encoder = find_hardware_encoder(&listing);
        match &encoder {
            Some(name) => log::info!("🚀 检测到硬件编码器: {}", name),
            None => log::info!("💻 未检测到硬件编码器, 使用软件编码"),
        }
        encoder
    }

    fn extract_command(&self, request: &ExtractRequest) -> Command {
        let pattern = request
            .output_dir
            .join(format!("frame_%0{}d.jpg", request.digits));

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-hide_banner", "-y"]);
        if request.hardware_acceleration {
            cmd.args(["-hwaccel", "auto"]);
        }
        cmd.arg("-i")
            .arg(&request.input)
            .arg("-vf")
            .arg(format!("fps={}", request.frame_rate))
            .args(["-vsync", "0", "-start_number", "0"])
            .arg(pattern);
        cmd
    }

    fn encode_command(&self, request: &EncodeRequest, encoder: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-hide_banner", "-y"])
            .arg("-framerate")
            .arg(request.frame_rate.to_string())
            .args(["-start_number", "0"])
            .arg("-i")
            .arg(request.input_dir.join("frame_%d.jpg"));
        match encoder {
            Some(encoder) => {
                cmd.args(["-c:v", encoder]);
            }
            None => {
                cmd.args(["-c:v", SOFTWARE_CODEC, "-q:v", SOFTWARE_QUALITY]);
            }
        }
        cmd.args(["-pix_fmt", "yuv420p"]).arg(&request.output);
        cmd
    }
}

impl MediaToolkit for FfmpegToolkit {
    fn probe(&self, path: &Path) -> Result<MediaInfo> {
        if !path.exists() {
            return Err(Error::Probe(format!("{} does not exist", path.display())));
        }

        let output = Command::new(&self.ffprobe_bin)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Probe(format!("failed to execute {}: {}", self.ffprobe_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe(format!("ffprobe failed: {}", stderr.trim())));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn hardware_acceleration_available(&self) -> bool {
        self.hardware_encoder().is_some()
    }

    fn extract_frames(
        &self,
        request: &ExtractRequest,
        cancel: &AtomicBool,
        on_log: &mut dyn FnMut(&str),
    ) -> JobOutcome {
        let mut cmd = self.extract_command(request);
        log::info!("🎞️ 开始抽帧: {:?}", cmd);
        run_job(&mut cmd, cancel, on_log)
    }

    fn encode_frames(
        &self,
        request: &EncodeRequest,
        cancel: &AtomicBool,
        on_log: &mut dyn FnMut(&str),
    ) -> JobOutcome {
        let encoder = if request.hardware_acceleration {
            self.hardware_encoder()
        } else {
            None
        };
        let mut cmd = self.encode_command(request, encoder);
        log::info!("🎬 开始编码: {:?}", cmd);
        run_job(&mut cmd, cancel, on_log)
    }
}

/// 从 `ffmpeg -encoders` 输出中挑选硬件编码器
fn find_hardware_encoder(listing: &str) -> Option<String> {
    let available: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();

    HARDWARE_ENCODERS
        .iter()
        .find(|name| available.contains(*name))
        .map(|name| name.to_string())
}

/// 运行子进程直到结束或被取消, stderr 逐行回调
fn run_job(cmd: &mut Command, cancel: &AtomicBool, on_log: &mut dyn FnMut(&str)) -> JobOutcome {
    let mut child = match cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let log = format!("failed to spawn {:?}: {}", cmd.get_program(), e);
            log::error!("❌ {}", log);
            return JobOutcome::failed(None, log);
        }
    };

    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    let reader = child.stderr.take().map(|stderr| {
        thread::Builder::new()
            .name("ffmpeg-log".to_string())
            .spawn(move || forward_lines(stderr, tx))
    });

    let mut log = String::new();
    let mut append = |line: String, log: &mut String| {
        on_log(&line);
        log.push_str(&line);
        log.push('\n');
    };

    let mut log_closed = false;
    let status = loop {
        if log_closed {
            thread::sleep(JOB_POLL_INTERVAL);
        } else {
            match rx.recv_timeout(JOB_POLL_INTERVAL) {
                Ok(line) => append(line, &mut log),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => log_closed = true,
            }
        }

        if cancel.load(Ordering::Relaxed) {
            kill(&mut child);
            break None;
        }

        match child.try_wait() {
            Ok(Some(status)) => break Some(Ok(status)),
            Ok(None) => {}
            Err(e) => {
                kill(&mut child);
                break Some(Err(e));
            }
        }
    };

    if let Some(Ok(reader)) = reader {
        let _ = reader.join();
    }
    for line in rx.try_iter() {
        append(line, &mut log);
    }

    match status {
        None => {
            log::warn!("⏹️ 任务已取消");
            JobOutcome::cancelled(log)
        }
        Some(Ok(status)) if status.success() => JobOutcome::success(log),
        Some(Ok(status)) => {
            log::warn!("⚠️ 任务失败, 退出码 {:?}", status.code());
            JobOutcome::failed(status.code(), log)
        }
        Some(Err(e)) => {
            log.push_str(&format!("failed to wait for child: {}\n", e));
            JobOutcome::failed(None, log)
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// 按 `\n` 或 `\r` 切分 (ffmpeg 用 `\r` 刷新进度行)
fn forward_lines<R: Read>(mut reader: R, tx: Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !line.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
                    line.clear();
                }
            } else {
                line.push(b);
            }
        }
    }
    if !line.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
    }
}

// ========== ffprobe JSON ==========

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    filename: Option<String>,
    format_name: Option<String>,
    duration: Option<String>,
    start_time: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    bit_rate: Option<String>,
}

pub(crate) fn parse_probe_output(json: &str) -> Result<MediaInfo> {
    let probe: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| Error::Probe(format!("invalid ffprobe output: {}", e)))?;

    let mut info = MediaInfo::default();
    if let Some(format) = &probe.format {
        info.filename = format.filename.clone().unwrap_or_default();
        info.format = format.format_name.clone();
        info.duration = parse_number(&format.duration);
        info.start_time = parse_number(&format.start_time);
        info.size = parse_number(&format.size);
        info.bitrate = parse_number(&format.bit_rate);
    }

    for stream in &probe.streams {
        match stream.codec_type.as_deref() {
            Some("video") => info.video_streams.push(VideoStream {
                codec: stream.codec_name.clone(),
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
                frame_rate: stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate)),
                bitrate: parse_number(&stream.bit_rate),
            }),
            Some("audio") => info.audio_streams.push(AudioStream {
                codec: stream.codec_name.clone(),
                sample_rate: parse_number(&stream.sample_rate),
                channels: stream.channels,
                bitrate: parse_number(&stream.bit_rate),
            }),
            _ => {}
        }
    }

    Ok(info)
}

fn parse_number<T: std::str::FromStr>(value: &Option<String>) -> Option<T> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

/// 解析 "30000/1001" 或 "25"; 分母为0或结果非正数时为 `None`
fn parse_frame_rate(value: &str) -> Option<f64> {
    let fps = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}
