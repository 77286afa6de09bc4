// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/save_video_file.rs - 保存视频到文件
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

//! # 视频文件输出
//!
//! 播放过程中把标注后的帧缓存为 PNG，播放结束时交给 `ffmpeg` 编码为 H.264。
//!
//! # URL 格式
//!
//! - `video:///path/to/output.mp4` - 指定输出视频路径，默认 25 fps
//! - `video:///path/to/output.mp4?fps=30` - 指定输出视频路径和帧率
//!
//! # 依赖
//!
//! 此模块需要系统安装 ffmpeg 命令行工具来编码视频。

use std::path::{Path, PathBuf};
use std::process::Command;

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  inference::AnnotatedFrame,
  output::{OutputError, Render},
  url_file_path,
};

#[derive(Error, Debug)]
pub enum SaveVideoFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("视频编码错误: {0}")]
  EncodingError(String),
  #[error("参数验证错误: {0}")]
  ValidationError(String),
}

const DEFAULT_FPS: u32 = 25;
const MIN_FPS: u32 = 1;
const MAX_FPS: u32 = 120;

/// 视频帧缓存
struct FrameBuffer {
  temp_dir: PathBuf,
  frames: usize,
  size: Option<(u32, u32)>,
}

impl FrameBuffer {
  fn new(output_path: &Path) -> Result<Self, SaveVideoFileError> {
    // 在输出文件旁边创建临时目录
    let mut temp_dir = output_path.as_os_str().to_owned();
    temp_dir.push(".frames");
    let temp_dir = PathBuf::from(temp_dir);
    std::fs::create_dir_all(&temp_dir)?;

    Ok(FrameBuffer {
      temp_dir,
      frames: 0,
      size: None,
    })
  }

  fn add_frame(&mut self, image: &RgbImage) -> Result<(), SaveVideoFileError> {
    let (width, height) = *self.size.get_or_insert(image.dimensions());

    let frame_path = self.temp_dir.join(format!("frame_{:06}.png", self.frames));
    // 编码器要求所有帧尺寸一致
    if image.dimensions() == (width, height) {
      image.save(&frame_path)?;
    } else {
      image::imageops::resize(image, width, height, FilterType::Triangle).save(&frame_path)?;
    }
    self.frames += 1;

    Ok(())
  }

  fn encode_to_video(
    &self,
    ffmpeg: &Path,
    output_path: &Path,
    fps: u32,
  ) -> Result<(), SaveVideoFileError> {
    if self.frames == 0 {
      info!("没有帧可以编码为视频，跳过编码过程");
      return Ok(());
    }

    info!(
      "开始编码视频: {} 帧 @ {} fps -> {}",
      self.frames,
      fps,
      output_path.display()
    );

    if let Some(parent) = output_path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    // yuv420p 要求宽高为偶数
    let output = Command::new(ffmpeg)
      .args(["-y", "-loglevel", "error"])
      .arg("-framerate")
      .arg(fps.to_string())
      .arg("-i")
      .arg(self.temp_dir.join("frame_%06d.png"))
      .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
      .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
      .args(["-preset", "fast", "-crf", "23"])
      .arg(output_path)
      .output()
      .map_err(|e| {
        SaveVideoFileError::EncodingError(format!(
          "无法执行 {} (请确保已安装): {}",
          ffmpeg.display(),
          e
        ))
      })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      error!("ffmpeg 错误: {}", stderr);
      return Err(SaveVideoFileError::EncodingError(format!(
        "ffmpeg 失败: {}",
        stderr.trim()
      )));
    }
    info!("视频编码成功: {}", output_path.display());
    Ok(())
  }

  fn cleanup(&self) {
    if let Err(e) = std::fs::remove_dir_all(&self.temp_dir) {
      warn!("清理临时目录失败: {}", e);
    }
  }
}

/// RAII 守卫确保清理总是执行
struct CleanupGuard<'a>(&'a FrameBuffer);

impl Drop for CleanupGuard<'_> {
  fn drop(&mut self) {
    self.0.cleanup();
  }
}

pub struct SaveVideoFileOutput {
  path: PathBuf,
  fps: u32,
  ffmpeg: PathBuf,
  buffer: Option<FrameBuffer>,
}

impl FromUrlWithScheme for SaveVideoFileOutput {
  const SCHEME: &'static str = "video";
}

impl FromUrl for SaveVideoFileOutput {
  type Error = SaveVideoFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveVideoFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let fps = match uri.query_pairs().find(|(k, _)| k == "fps") {
      Some((_, v)) => v
        .parse::<u32>()
        .map_err(|_| SaveVideoFileError::ValidationError(format!("无效的 FPS: {}", v)))?,
      None => DEFAULT_FPS,
    };

    Self::new(url_file_path(uri), fps)
  }
}

impl SaveVideoFileOutput {
  pub fn new(path: impl Into<PathBuf>, fps: u32) -> Result<Self, SaveVideoFileError> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
      return Err(SaveVideoFileError::ValidationError(format!(
        "FPS {} 超出有效范围 [{}, {}]",
        fps, MIN_FPS, MAX_FPS
      )));
    }
    Ok(Self {
      path: path.into(),
      fps,
      ffmpeg: PathBuf::from("ffmpeg"),
      buffer: None,
    })
  }

  pub fn with_ffmpeg(mut self, ffmpeg: PathBuf) -> Self {
    self.ffmpeg = ffmpeg;
    self
  }

  pub fn fps(&self) -> u32 {
    self.fps
  }

  fn add_frame(&mut self, image: &RgbImage) -> Result<(), SaveVideoFileError> {
    if self.buffer.is_none() {
      self.buffer = Some(FrameBuffer::new(&self.path)?);
      info!("初始化视频帧缓冲区: {}", self.path.display());
    }
    match self.buffer.as_mut() {
      Some(buffer) => buffer.add_frame(image),
      None => Ok(()),
    }
  }

  fn encode(&mut self) -> Result<(), SaveVideoFileError> {
    match self.buffer.take() {
      Some(buffer) => {
        let _cleanup = CleanupGuard(&buffer);
        buffer.encode_to_video(&self.ffmpeg, &self.path, self.fps)
      }
      None => Ok(()),
    }
  }
}

impl Render for SaveVideoFileOutput {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    Ok(self.add_frame(&frame.display())?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(self.encode()?)
  }
}

impl Drop for SaveVideoFileOutput {
  fn drop(&mut self) {
    // 未经 finish 收尾时在销毁前完成编码
    if let Err(e) = self.encode() {
      error!("编码视频时出错: {}", e);
    }
  }
}
