// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/gstreamer_source.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 与 ffmpeg 输入源相同的契约，底层换成 `appsink` 管道：
//! - 视频文件：`filesrc ! decodebin`
//! - 摄像头：`v4l2src`
//! - RTSP：`rtspsrc protocols=tcp ! decodebin`
//! - 其他地址（解析后的 YouTube 流）：`uridecodebin`
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! 由默认启用的 `gstreamer_input` 特性提供。

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::SourceKind,
  frame::Frame,
  input::{FrameSource, SourceError},
};

/// 等待第一帧时检查总线的间隔
const PREROLL_POLL_SECS: u64 = 1;

#[derive(Error, Debug)]
pub enum GStreamerSourceError {
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("状态切换失败: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("不支持的视频格式")]
  UnsupportedFormat,
  #[error("缓冲区大小不匹配: 期望 {expected} 字节，实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
}

fn pipeline_description(kind: SourceKind, location: &str) -> String {
  let source = match kind {
    SourceKind::Video | SourceKind::Image => {
      format!("filesrc location=\"{}\" ! decodebin", location)
    }
    SourceKind::Webcam => format!("v4l2src device=\"{}\"", location),
    SourceKind::Rtsp => format!(
      "rtspsrc location=\"{}\" protocols=tcp latency=200 ! decodebin",
      location
    ),
    SourceKind::YouTube => format!("uridecodebin uri=\"{}\"", location),
  };
  // 文件逐帧读取，实时流只保留最新的帧
  let sink = match kind {
    SourceKind::Video | SourceKind::Image | SourceKind::YouTube => {
      "appsink name=sink sync=false max-buffers=4"
    }
    SourceKind::Webcam | SourceKind::Rtsp => "appsink name=sink max-buffers=2 drop=true",
  };
  format!(
    "{} ! videoconvert ! video/x-raw,format=RGB ! {}",
    source, sink
  )
}

/// 从 RGB 样本中取出紧密排列的图像，去掉行尾填充
fn sample_to_image(sample: &gst::Sample) -> Result<(RgbImage, Option<u64>), GStreamerSourceError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有 caps".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(GStreamerSourceError::UnsupportedFormat);
  }

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerSourceError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * (height - 1) + width * 3;
  if data.len() < expected {
    return Err(GStreamerSourceError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(width * height * 3);
  for row in 0..height {
    let start = row * stride;
    pixels.extend_from_slice(&data[start..start + width * 3]);
  }
  let image = RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| GStreamerSourceError::PipelineError("无法创建 RGB 图像".to_string()))?;

  Ok((image, buffer.pts().map(|pts| pts.mseconds())))
}

/// GStreamer 管道帧来源
pub struct GStreamerSource {
  kind: SourceKind,
  location: String,
  pipeline: Option<gst::Pipeline>,
  appsink: gst_app::AppSink,
  width: u32,
  height: u32,
  fps: Option<f64>,
  frame_index: u64,
}

impl GStreamerSource {
  pub fn open(kind: SourceKind, location: &str) -> Result<Self, SourceError> {
    Self::build(kind, location).map_err(|e| SourceError::unavailable(location, e))
  }

  fn build(kind: SourceKind, location: &str) -> Result<Self, GStreamerSourceError> {
    gst::init()?;

    let description = pipeline_description(kind, location);
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerSourceError::PipelineError("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerSourceError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerSourceError::AppSinkNotFound)?;

    // 打开失败的各条路径上都要把管道切回 Null
    pipeline
      .set_state(gst::State::Playing)
      .inspect_err(|_| {
        let _ = pipeline.set_state(gst::State::Null);
      })?;
    let (width, height, fps) = match preroll(&pipeline, &appsink) {
      Ok(info) => info,
      Err(e) => {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(e);
      }
    };

    Ok(Self {
      kind,
      location: location.to_string(),
      width,
      height,
      fps,
      pipeline: Some(pipeline),
      appsink,
      frame_index: 0,
    })
  }
}

/// 等待第一帧以确定分辨率与帧率。
///
/// 不设总时限；管道报错或在第一帧之前结束时返回错误。
fn preroll(
  pipeline: &gst::Pipeline,
  appsink: &gst_app::AppSink,
) -> Result<(u32, u32, Option<f64>), GStreamerSourceError> {
  let sample = loop {
    if let Some(sample) = appsink.try_pull_preroll(gst::ClockTime::from_seconds(PREROLL_POLL_SECS)) {
      break sample;
    }
    if let Some(reason) = bus_error(pipeline) {
      return Err(GStreamerSourceError::PipelineError(reason));
    }
    if appsink.is_eos() {
      return Err(GStreamerSourceError::PipelineError(
        "输入在第一帧之前结束".to_string(),
      ));
    }
    debug!("等待第一帧");
  };

  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有 caps".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)?;
  let rate = video_info.fps();
  let fps = if rate.numer() > 0 && rate.denom() > 0 {
    Some(rate.numer() as f64 / rate.denom() as f64)
  } else {
    None
  };
  Ok((video_info.width(), video_info.height(), fps))
}

fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
  let bus = pipeline.bus()?;
  let message = bus.pop_filtered(&[gst::MessageType::Error])?;
  match message.view() {
    gst::MessageView::Error(err) => Some(err.error().to_string()),
    _ => None,
  }
}

impl FrameSource for GStreamerSource {
  fn read(&mut self) -> Result<Option<Frame>, SourceError> {
    if self.pipeline.is_none() {
      return Ok(None);
    }

    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) => {
        let eos = self.appsink.is_eos();
        let reason = self.pipeline.as_ref().and_then(bus_error);
        self.close();
        return match (eos, reason) {
          (true, _) => Ok(None),
          (false, _) if self.kind == SourceKind::Webcam => {
            warn!("摄像头读取失败，结束播放");
            Ok(None)
          }
          (false, reason) => Err(SourceError::ReadFailure(format!(
            "{}: {}",
            self.location,
            reason.unwrap_or_else(|| "管道已停止".to_string())
          ))),
        };
      }
    };

    let (image, pts) = match sample_to_image(&sample) {
      Ok(decoded) => decoded,
      Err(e) => {
        self.close();
        return Err(SourceError::ReadFailure(format!("{}: {}", self.location, e)));
      }
    };
    let timestamp_ms = pts.unwrap_or_else(|| match self.fps {
      Some(fps) => (self.frame_index as f64 * 1000.0 / fps) as u64,
      None => 0,
    });
    let frame = Frame::new(image, self.frame_index, timestamp_ms);
    self.frame_index += 1;
    Ok(Some(frame))
  }

  fn close(&mut self) {
    if let Some(pipeline) = self.pipeline.take() {
      if let Err(e) = pipeline.set_state(gst::State::Null) {
        warn!("无法停止 GStreamer 管道: {}", e);
      }
      debug!("释放 GStreamer 输入: {}", self.location);
    }
  }

  fn is_open(&self) -> bool {
    self.pipeline.is_some()
  }

  fn kind(&self) -> SourceKind {
    self.kind
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    self.fps
  }
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    self.close();
  }
}
