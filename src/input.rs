// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, config::SourceKind, frame::Frame, settings::ToolPaths, task::CancelToken, url_file_path,
};

mod ffmpeg_source;
mod image_source;
mod youtube;

pub use self::ffmpeg_source::{FfmpegSource, StreamInfo, probe_stream};
pub use self::image_source::ImageSource;
pub use self::youtube::{
  ResolveError, ResolvedStream, StreamFormat, StreamResolver, YtDlpResolver, is_youtube_url,
  select_progressive_stream,
};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_source;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_source::{GStreamerSource, GStreamerSourceError};

#[cfg(feature = "v4l_input")]
mod v4l2_source;
#[cfg(feature = "v4l_input")]
pub use self::v4l2_source::V4l2Source;

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("无法打开输入源 {name}: {reason}")]
  Unavailable { name: String, reason: String },
  #[error("读取帧失败: {0}")]
  ReadFailure(String),
  #[error("不支持的图片格式: {0}")]
  UnsupportedFormat(String),
  #[error("无法解析视频流: {0}")]
  Resolve(#[from] ResolveError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl SourceError {
  pub fn unavailable(name: impl fmt::Display, reason: impl fmt::Display) -> Self {
    SourceError::Unavailable {
      name: name.to_string(),
      reason: reason.to_string(),
    }
  }
}

/// 帧来源。
///
/// `read` 返回 `Ok(None)` 表示输入结束。读到结束或出错后，来源必须已经
/// 释放底层资源（`is_open` 为 `false`）；`close` 可重复调用。
pub trait FrameSource {
  fn read(&mut self) -> Result<Option<Frame>, SourceError>;
  fn close(&mut self);
  fn is_open(&self) -> bool;

  fn kind(&self) -> SourceKind;
  fn width(&self) -> u32;
  fn height(&self) -> u32;
  fn fps(&self) -> Option<f64>;

  fn frames(&mut self, cancel: CancelToken) -> Frames<'_>
  where
    Self: Sized,
  {
    Frames::new(self, cancel)
  }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn read(&mut self) -> Result<Option<Frame>, SourceError> {
    (**self).read()
  }

  fn close(&mut self) {
    (**self).close()
  }

  fn is_open(&self) -> bool {
    (**self).is_open()
  }

  fn kind(&self) -> SourceKind {
    (**self).kind()
  }

  fn width(&self) -> u32 {
    (**self).width()
  }

  fn height(&self) -> u32 {
    (**self).height()
  }

  fn fps(&self) -> Option<f64> {
    (**self).fps()
  }
}

pub type BoxedSource = Box<dyn FrameSource + Send>;

/// 逐帧迭代，取消令牌触发后停止
pub struct Frames<'a> {
  source: &'a mut dyn FrameSource,
  cancel: CancelToken,
  done: bool,
}

impl<'a> Frames<'a> {
  pub fn new(source: &'a mut dyn FrameSource, cancel: CancelToken) -> Self {
    Self {
      source,
      cancel,
      done: false,
    }
  }
}

impl Iterator for Frames<'_> {
  type Item = Result<Frame, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done || self.cancel.is_cancelled() {
      return None;
    }
    match self.source.read() {
      Ok(Some(frame)) => Some(Ok(frame)),
      Ok(None) => {
        self.done = true;
        None
      }
      Err(e) => {
        self.done = true;
        Some(Err(e))
      }
    }
  }
}

/// 要打开的输入源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
  Image(PathBuf),
  VideoFile(PathBuf),
  Webcam(String),
  Rtsp(String),
  /// YouTube 页面地址，打开前需要解析出视频流
  YouTube(String),
}

impl SourceDescriptor {
  pub fn kind(&self) -> SourceKind {
    match self {
      SourceDescriptor::Image(_) => SourceKind::Image,
      SourceDescriptor::VideoFile(_) => SourceKind::Video,
      SourceDescriptor::Webcam(_) => SourceKind::Webcam,
      SourceDescriptor::Rtsp(_) => SourceKind::Rtsp,
      SourceDescriptor::YouTube(_) => SourceKind::YouTube,
    }
  }
}

impl fmt::Display for SourceDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceDescriptor::Image(path) | SourceDescriptor::VideoFile(path) => {
        write!(f, "{}", path.display())
      }
      SourceDescriptor::Webcam(location)
      | SourceDescriptor::Rtsp(location)
      | SourceDescriptor::YouTube(location) => write!(f, "{}", location),
    }
  }
}

impl FromUrl for SourceDescriptor {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "image" => Ok(SourceDescriptor::Image(PathBuf::from(url_file_path(url)))),
      "video" => Ok(SourceDescriptor::VideoFile(PathBuf::from(url_file_path(
        url,
      )))),
      "webcam" => Ok(SourceDescriptor::Webcam(url_file_path(url))),
      "rtsp" | "rtsps" => Ok(SourceDescriptor::Rtsp(url.to_string())),
      "youtube" => Ok(SourceDescriptor::YouTube(youtube_page(url))),
      "http" | "https" if is_youtube_url(url) => Ok(SourceDescriptor::YouTube(url.to_string())),
      scheme => Err(SourceError::SchemeMismatch(scheme.to_string())),
    }
  }
}

/// `youtube:` 之后的全部内容；只给出视频 ID 时补全为观看页地址
fn youtube_page(url: &Url) -> String {
  let rest = url.as_str().trim_start_matches("youtube:");
  if rest.contains("://") {
    rest.to_string()
  } else if let Some(rest) = rest.strip_prefix("//") {
    format!("https://{}", rest)
  } else {
    format!("https://www.youtube.com/watch?v={}", rest)
  }
}

/// 打开输入源使用的后端。
///
/// 启用 `gstreamer_input` 特性（默认启用）时使用 GStreamer 解码，
/// 否则退回到 ffmpeg 命令行工具。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
  Ffmpeg,
  #[cfg(feature = "gstreamer_input")]
  GStreamer,
  #[cfg(feature = "v4l_input")]
  V4l2,
}

impl Default for Backend {
  #[cfg(feature = "gstreamer_input")]
  fn default() -> Self {
    Backend::GStreamer
  }

  #[cfg(not(feature = "gstreamer_input"))]
  fn default() -> Self {
    Backend::Ffmpeg
  }
}

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
  pub tools: ToolPaths,
  pub backend: Backend,
}

impl OpenOptions {
  pub fn new(tools: ToolPaths) -> Self {
    Self {
      tools,
      backend: Backend::default(),
    }
  }

  pub fn with_backend(mut self, backend: Backend) -> Self {
    self.backend = backend;
    self
  }
}

/// 打开输入源；YouTube 地址通过 `yt-dlp` 解析
pub fn open_source(
  descriptor: &SourceDescriptor,
  options: &OpenOptions,
) -> Result<BoxedSource, SourceError> {
  let resolver = YtDlpResolver::new(options.tools.yt_dlp.clone());
  open_source_with(descriptor, options, &resolver)
}

pub fn open_source_with(
  descriptor: &SourceDescriptor,
  options: &OpenOptions,
  resolver: &dyn StreamResolver,
) -> Result<BoxedSource, SourceError> {
  info!("打开输入源 ({}): {}", descriptor.kind(), descriptor);
  let source: BoxedSource = match descriptor {
    SourceDescriptor::Image(path) => Box::new(ImageSource::open(path)?),
    SourceDescriptor::YouTube(page) => {
      let stream = resolver.resolve(page)?;
      debug!("YouTube 视频流: {:?}", stream.title);
      open_stream(SourceKind::YouTube, &stream.url, options)?
    }
    SourceDescriptor::VideoFile(path) => {
      if !path.is_file() {
        return Err(SourceError::unavailable(path.display(), "文件不存在"));
      }
      open_stream(SourceKind::Video, &path.to_string_lossy(), options)?
    }
    SourceDescriptor::Webcam(device) => open_stream(SourceKind::Webcam, device, options)?,
    SourceDescriptor::Rtsp(location) => open_stream(SourceKind::Rtsp, location, options)?,
  };
  info!(
    "输入源已打开: {}x{} fps={:?}",
    source.width(),
    source.height(),
    source.fps()
  );
  Ok(source)
}

fn open_stream(
  kind: SourceKind,
  location: &str,
  options: &OpenOptions,
) -> Result<BoxedSource, SourceError> {
  match options.backend {
    Backend::Ffmpeg => Ok(Box::new(FfmpegSource::open(kind, location, &options.tools)?)),
    #[cfg(feature = "gstreamer_input")]
    Backend::GStreamer => Ok(Box::new(GStreamerSource::open(kind, location)?)),
    #[cfg(feature = "v4l_input")]
    Backend::V4l2 if kind == SourceKind::Webcam => Ok(Box::new(V4l2Source::open(location)?)),
    #[cfg(feature = "v4l_input")]
    Backend::V4l2 => Ok(Box::new(FfmpegSource::open(kind, location, &options.tools)?)),
  }
}
