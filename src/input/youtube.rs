// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/youtube.rs - YouTube 视频流解析
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

use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

const YOUTUBE_HOSTS: [&str; 5] = [
  "youtube.com",
  "www.youtube.com",
  "m.youtube.com",
  "music.youtube.com",
  "youtu.be",
];

/// 默认选择 720p 的 mp4 流
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_EXTENSION: &str = "mp4";

#[derive(Error, Debug)]
pub enum ResolveError {
  #[error("无效的 YouTube 地址: {0}")]
  InvalidUrl(String),
  #[error("视频信息提取失败: {0}")]
  Extractor(String),
  #[error("没有 {height}p {extension} 格式的视频流")]
  NoMatchingStream { height: u32, extension: String },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// `yt-dlp -J` 报告的一种格式
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamFormat {
  #[serde(default)]
  pub format_id: String,
  pub url: Option<String>,
  pub ext: Option<String>,
  pub width: Option<u32>,
  pub height: Option<u32>,
  pub fps: Option<f64>,
  pub vcodec: Option<String>,
  pub acodec: Option<String>,
  pub protocol: Option<String>,
}

impl StreamFormat {
  pub fn has_video(&self) -> bool {
    matches!(self.vcodec.as_deref(), Some(codec) if codec != "none")
  }

  pub fn has_audio(&self) -> bool {
    matches!(self.acodec.as_deref(), Some(codec) if codec != "none")
  }

  /// 音视频合一的流
  pub fn is_progressive(&self) -> bool {
    self.has_video() && self.has_audio()
  }

  fn is_plain_http(&self) -> bool {
    matches!(self.protocol.as_deref(), None | Some("http") | Some("https"))
  }

  fn matches(&self, height: u32, extension: &str) -> bool {
    self.url.is_some()
      && self.height == Some(height)
      && self.ext.as_deref() == Some(extension)
      && self.has_video()
      && self.is_plain_http()
  }
}

/// 选择第一个满足分辨率与容器格式的流，音视频合一的流优先
pub fn select_progressive_stream<'a>(
  formats: &'a [StreamFormat],
  height: u32,
  extension: &str,
) -> Option<&'a StreamFormat> {
  let candidates = formats
    .iter()
    .filter(|f| f.matches(height, extension))
    .collect::<Vec<_>>();
  candidates
    .iter()
    .copied()
    .find(|f| f.is_progressive())
    .or_else(|| candidates.first().copied())
}

pub fn is_youtube_url(url: &Url) -> bool {
  matches!(url.scheme(), "http" | "https")
    && url
      .host_str()
      .map(|host| YOUTUBE_HOSTS.contains(&host))
      .unwrap_or(false)
}

/// 解析得到的可播放视频流
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
  pub url: String,
  pub title: Option<String>,
  pub format: StreamFormat,
}

pub trait StreamResolver {
  fn resolve(&self, page_url: &str) -> Result<ResolvedStream, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct VideoInfo {
  title: Option<String>,
  #[serde(default)]
  formats: Vec<StreamFormat>,
}

fn parse_video_info(
  json: &[u8],
  height: u32,
  extension: &str,
) -> Result<ResolvedStream, ResolveError> {
  let info: VideoInfo = serde_json::from_slice(json)
    .map_err(|e| ResolveError::Extractor(format!("无法解析视频信息: {}", e)))?;
  debug!("视频共有 {} 种格式", info.formats.len());

  let format = select_progressive_stream(&info.formats, height, extension).ok_or_else(|| {
    ResolveError::NoMatchingStream {
      height,
      extension: extension.to_string(),
    }
  })?;
  let url = format
    .url
    .clone()
    .ok_or_else(|| ResolveError::Extractor("格式缺少地址".to_string()))?;

  Ok(ResolvedStream {
    url,
    title: info.title,
    format: format.clone(),
  })
}

/// 通过 `yt-dlp` 命令行工具解析视频流
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
  program: PathBuf,
  height: u32,
  extension: String,
}

impl YtDlpResolver {
  pub fn new(program: PathBuf) -> Self {
    Self {
      program,
      height: DEFAULT_HEIGHT,
      extension: DEFAULT_EXTENSION.to_string(),
    }
  }

  pub fn with_format(mut self, height: u32, extension: &str) -> Self {
    self.height = height;
    self.extension = extension.to_string();
    self
  }
}

impl StreamResolver for YtDlpResolver {
  fn resolve(&self, page_url: &str) -> Result<ResolvedStream, ResolveError> {
    let url = Url::parse(page_url.trim())
      .map_err(|e| ResolveError::InvalidUrl(format!("{}: {}", page_url, e)))?;
    if !is_youtube_url(&url) {
      return Err(ResolveError::InvalidUrl(page_url.to_string()));
    }

    info!("解析 YouTube 视频: {}", url);
    let output = Command::new(&self.program)
      .args(["-J", "--no-playlist", "--no-warnings"])
      .arg(url.as_str())
      .stdin(Stdio::null())
      .output()?;
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(ResolveError::Extractor(stderr.trim().to_string()));
    }

    let stream = parse_video_info(&output.stdout, self.height, &self.extension)?;
    info!(
      "选择视频流 {} ({:?}p {:?})",
      stream.format.format_id, stream.format.height, stream.format.ext
    );
    Ok(stream)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn format(id: &str, height: u32, ext: &str, vcodec: &str, acodec: &str) -> StreamFormat {
    StreamFormat {
      format_id: id.to_string(),
      url: Some(format!("https://cdn.example/{}", id)),
      ext: Some(ext.to_string()),
      width: None,
      height: Some(height),
      fps: None,
      vcodec: Some(vcodec.to_string()),
      acodec: Some(acodec.to_string()),
      protocol: Some("https".to_string()),
    }
  }

  #[test]
  fn progressive_720p_mp4_is_preferred() {
    let formats = vec![
      format("18", 360, "mp4", "avc1", "mp4a"),
      format("136", 720, "mp4", "avc1", "none"),
      format("247", 720, "webm", "vp9", "none"),
      format("22", 720, "mp4", "avc1", "mp4a"),
    ];
    let chosen = select_progressive_stream(&formats, 720, "mp4").unwrap();
    assert_eq!(chosen.format_id, "22");
  }

  #[test]
  fn video_only_stream_is_the_fallback() {
    let formats = vec![
      format("136", 720, "mp4", "avc1", "none"),
      format("140", 0, "m4a", "none", "mp4a"),
    ];
    let chosen = select_progressive_stream(&formats, 720, "mp4").unwrap();
    assert_eq!(chosen.format_id, "136");
  }

  #[test]
  fn no_matching_stream() {
    let formats = vec![format("18", 360, "mp4", "avc1", "mp4a")];
    assert!(select_progressive_stream(&formats, 720, "mp4").is_none());

    let json = br#"{ "title": "demo", "formats": [] }"#;
    assert!(matches!(
      parse_video_info(json, 720, "mp4"),
      Err(ResolveError::NoMatchingStream { height: 720, .. })
    ));
  }

  #[test]
  fn segmented_streams_are_skipped() {
    let mut hls = format("95", 720, "mp4", "avc1", "mp4a");
    hls.protocol = Some("m3u8_native".to_string());
    assert!(select_progressive_stream(&[hls], 720, "mp4").is_none());
  }

  #[test]
  fn video_info_json() {
    let json = br#"{
      "title": "demo",
      "formats": [
        { "format_id": "22", "url": "https://cdn.example/22", "ext": "mp4",
          "height": 720, "vcodec": "avc1.64001F", "acodec": "mp4a.40.2", "protocol": "https" }
      ]
    }"#;
    let stream = parse_video_info(json, 720, "mp4").unwrap();
    assert_eq!(stream.url, "https://cdn.example/22");
    assert_eq!(stream.title.as_deref(), Some("demo"));
  }

  #[test]
  fn youtube_hosts() {
    assert!(is_youtube_url(&Url::parse("https://www.youtube.com/watch?v=x").unwrap()));
    assert!(is_youtube_url(&Url::parse("https://youtu.be/x").unwrap()));
    assert!(!is_youtube_url(&Url::parse("https://example.com/watch?v=x").unwrap()));
    assert!(!is_youtube_url(&Url::parse("rtsp://www.youtube.com/x").unwrap()));
  }

  #[test]
  fn non_youtube_address_is_rejected_before_running_the_tool() {
    let resolver = YtDlpResolver::new(PathBuf::from("/nonexistent/tanjing/yt-dlp"));
    assert!(matches!(
      resolver.resolve("not a url"),
      Err(ResolveError::InvalidUrl(_))
    ));
    assert!(matches!(
      resolver.resolve("https://example.com/video"),
      Err(ResolveError::InvalidUrl(_))
    ));
  }

  #[test]
  fn missing_tool_is_an_io_error() {
    let resolver = YtDlpResolver::new(PathBuf::from("/nonexistent/tanjing/yt-dlp"));
    assert!(matches!(
      resolver.resolve("https://www.youtube.com/watch?v=abc"),
      Err(ResolveError::Io(_))
    ));
  }
}
