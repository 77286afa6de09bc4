// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/save_image_file.rs - 保存图像到文件
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  inference::AnnotatedFrame,
  output::{OutputError, Render},
  url_file_path,
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("缺少文件路径")]
  MissingPath,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 把最新一帧写到同一个文件，每帧覆盖上一帧
#[derive(Debug)]
pub struct SaveImageFileOutput {
  path: PathBuf,
  saved: u64,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch);
    }
    let path = url_file_path(url);
    if path.is_empty() || path.ends_with('/') {
      return Err(SaveImageFileError::MissingPath);
    }
    Ok(Self::new(path))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      saved: 0,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save(&mut self, frame: &AnnotatedFrame) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    frame.display().save(&self.path)?;
    self.saved += 1;
    debug!("保存图像到文件: {} (第 {} 帧)", self.path.display(), frame.index);
    Ok(())
  }
}

impl Render for SaveImageFileOutput {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    Ok(self.save(frame)?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    if self.saved > 0 {
      info!("图像已保存到文件: {}", self.path.display());
    }
    Ok(())
  }
}
