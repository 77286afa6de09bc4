// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/ffmpeg_source.rs - 基于 ffmpeg 命令行工具的视频输入源
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Tanjing Authors

//! 备用解码后端（`--ffmpeg`，或未启用 `gstreamer_input` 特性时）：
//! `ffprobe` 报告分辨率与帧率，`ffmpeg` 把帧以 `rgb24` 原始数据写到管道。
//!
//! 带旋转信息的视频由 `ffmpeg` 自动旋转，探测到的宽高按旋转角度交换。
//!
//! 此模块需要系统安装 ffmpeg 命令行工具。

use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Instant;

use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::{
  config::SourceKind,
  frame::Frame,
  input::{FrameSource, SourceError},
  settings::ToolPaths,
};

/// `ffprobe` 报告的视频流信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
  pub width: u32,
  pub height: u32,
  pub fps: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
  #[serde(default)]
  streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
  width: Option<u32>,
  height: Option<u32>,
  avg_frame_rate: Option<String>,
  r_frame_rate: Option<String>,
  #[serde(default)]
  tags: ProbeTags,
  #[serde(default)]
  side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeTags {
  rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
  rotation: Option<f64>,
}

impl ProbeStream {
  /// 显示矩阵给出的旋转角度，旧文件使用 `rotate` 标签
  fn rotation(&self) -> i64 {
    self
      .side_data_list
      .iter()
      .find_map(|data| data.rotation)
      .or_else(|| {
        self
          .tags
          .rotate
          .as_deref()
          .and_then(|rotate| rotate.trim().parse::<f64>().ok())
      })
      .map(|degrees| degrees.round() as i64)
      .unwrap_or(0)
  }
}

/// 解析 `30000/1001` 形式的帧率，`0/0` 视为未知
fn parse_rate(rate: &str) -> Option<f64> {
  let (num, den) = match rate.split_once('/') {
    Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
    None => (rate.trim().parse::<f64>().ok()?, 1.0),
  };
  if num <= 0.0 || den <= 0.0 {
    return None;
  }
  Some(num / den)
}

fn parse_probe(json: &[u8]) -> Result<StreamInfo, String> {
  let output: ProbeOutput =
    serde_json::from_slice(json).map_err(|e| format!("无法解析 ffprobe 输出: {}", e))?;
  let stream = output
    .streams
    .into_iter()
    .find(|s| s.width.is_some() && s.height.is_some())
    .ok_or_else(|| "没有视频流".to_string())?;

  let quarter_turn = stream.rotation().rem_euclid(180) == 90;
  let (width, height) = match (stream.width, stream.height) {
    (Some(w), Some(h)) if w > 0 && h > 0 && quarter_turn => (h, w),
    (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
    _ => return Err("视频流分辨率无效".to_string()),
  };
  let fps = stream
    .avg_frame_rate
    .as_deref()
    .and_then(parse_rate)
    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate));

  Ok(StreamInfo { width, height, fps })
}

/// 不同输入类型在 `-i` 之前需要的参数
fn input_args(kind: SourceKind) -> Vec<&'static str> {
  match kind {
    SourceKind::Webcam if cfg!(target_os = "linux") => vec!["-f", "v4l2"],
    SourceKind::Webcam if cfg!(target_os = "macos") => vec!["-f", "avfoundation"],
    SourceKind::Rtsp => vec!["-rtsp_transport", "tcp"],
    _ => Vec::new(),
  }
}

/// 用 `ffprobe` 探测视频流，失败即视为输入源不可用
pub fn probe_stream(
  ffprobe: &Path,
  kind: SourceKind,
  location: &str,
) -> Result<StreamInfo, SourceError> {
  debug!("探测视频流: {} ({})", location, kind);
  let output = Command::new(ffprobe)
    .args(["-v", "error", "-select_streams", "v:0"])
    .args([
      "-show_entries",
      "stream=width,height,avg_frame_rate,r_frame_rate:stream_tags=rotate:stream_side_data=rotation",
    ])
    .args(["-of", "json"])
    .args(input_args(kind))
    .arg(location)
    .stdin(Stdio::null())
    .output()
    .map_err(|e| {
      SourceError::unavailable(
        location,
        format!("无法执行 {} (请确保已安装): {}", ffprobe.display(), e),
      )
    })?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    return Err(SourceError::unavailable(location, stderr.trim()));
  }

  parse_probe(&output.stdout).map_err(|reason| SourceError::unavailable(location, reason))
}

/// `ffmpeg` 子进程解码得到的帧来源
pub struct FfmpegSource {
  kind: SourceKind,
  location: String,
  info: StreamInfo,
  child: Option<Child>,
  stdout: Option<ChildStdout>,
  stderr: Option<JoinHandle<String>>,
  frame_index: u64,
  started: Instant,
}

impl FfmpegSource {
  pub fn open(kind: SourceKind, location: &str, tools: &ToolPaths) -> Result<Self, SourceError> {
    let info = probe_stream(&tools.ffprobe, kind, location)?;
    info!(
      "视频流: {}x{} fps={:?} ({})",
      info.width, info.height, info.fps, location
    );

    let mut child = Command::new(&tools.ffmpeg)
      .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
      .args(input_args(kind))
      .arg("-i")
      .arg(location)
      .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|e| {
        SourceError::unavailable(
          location,
          format!("无法执行 {} (请确保已安装): {}", tools.ffmpeg.display(), e),
        )
      })?;

    let stdout = child.stdout.take();
    // 持续读取错误输出，防止管道写满阻塞解码进程
    let stderr = child.stderr.take().map(|mut pipe| {
      std::thread::spawn(move || {
        let mut text = String::new();
        let _ = pipe.read_to_string(&mut text);
        text
      })
    });

    Ok(Self {
      kind,
      location: location.to_string(),
      info,
      child: Some(child),
      stdout,
      stderr,
      frame_index: 0,
      started: Instant::now(),
    })
  }

  pub fn info(&self) -> StreamInfo {
    self.info
  }

  fn frame_size(&self) -> usize {
    self.info.width as usize * self.info.height as usize * 3
  }

  fn timestamp_ms(&self) -> u64 {
    match (self.kind, self.info.fps) {
      (SourceKind::Video | SourceKind::YouTube, Some(fps)) => {
        (self.frame_index as f64 * 1000.0 / fps) as u64
      }
      _ => self.started.elapsed().as_millis() as u64,
    }
  }

  /// 结束解码进程，返回其是否正常退出以及错误输出
  fn finish(&mut self) -> (bool, String) {
    self.stdout.take();
    let success = match self.child.take() {
      Some(mut child) => match child.wait() {
        Ok(status) => status.success(),
        Err(e) => {
          warn!("等待 ffmpeg 退出失败: {}", e);
          false
        }
      },
      None => true,
    };
    let stderr = self.join_stderr();
    (success, stderr)
  }

  fn join_stderr(&mut self) -> String {
    self
      .stderr
      .take()
      .and_then(|handle| handle.join().ok())
      .unwrap_or_default()
  }

  // 读不到完整的一帧时决定是正常结束还是读取失败
  fn end_of_stream(&mut self, cause: Option<std::io::Error>) -> Result<Option<Frame>, SourceError> {
    let (success, stderr) = self.finish();
    debug!("解码进程退出: success={} ({})", success, self.location);

    if self.kind == SourceKind::Webcam {
      if !success || cause.is_some() {
        warn!("摄像头读取失败，结束播放: {}", stderr.trim());
      }
      return Ok(None);
    }

    match cause {
      Some(e) => Err(SourceError::ReadFailure(format!("{}: {}", self.location, e))),
      None if success => Ok(None),
      None => {
        error!("ffmpeg 解码失败: {}", stderr.trim());
        Err(SourceError::ReadFailure(format!(
          "{}: {}",
          self.location,
          stderr.trim()
        )))
      }
    }
  }
}

impl FrameSource for FfmpegSource {
  fn read(&mut self) -> Result<Option<Frame>, SourceError> {
    let size = self.frame_size();
    let stdout = match self.stdout.as_mut() {
      Some(stdout) => stdout,
      None => return Ok(None),
    };

    let mut buffer = vec![0u8; size];
    match stdout.read_exact(&mut buffer) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => return self.end_of_stream(None),
      Err(e) => return self.end_of_stream(Some(e)),
    }

    let image = match RgbImage::from_raw(self.info.width, self.info.height, buffer) {
      Some(image) => image,
      None => {
        self.close();
        return Err(SourceError::ReadFailure(format!(
          "{}: 无法创建 RGB 图像",
          self.location
        )));
      }
    };
    let frame = Frame::new(image, self.frame_index, self.timestamp_ms());
    self.frame_index += 1;
    Ok(Some(frame))
  }

  fn close(&mut self) {
    self.stdout.take();
    if let Some(mut child) = self.child.take() {
      let _ = child.kill();
      let _ = child.wait();
      debug!("释放视频输入: {}", self.location);
    }
    self.join_stderr();
  }

  fn is_open(&self) -> bool {
    self.child.is_some()
  }

  fn kind(&self) -> SourceKind {
    self.kind
  }

  fn width(&self) -> u32 {
    self.info.width
  }

  fn height(&self) -> u32 {
    self.info.height
  }

  fn fps(&self) -> Option<f64> {
    self.info.fps
  }
}

impl Drop for FfmpegSource {
  fn drop(&mut self) {
    self.close();
  }
}
