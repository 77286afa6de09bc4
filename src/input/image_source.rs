// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/image_source.rs - 图片输入源
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use tracing::debug;

use crate::{
  config::SourceKind,
  frame::Frame,
  input::{FrameSource, SourceError},
};

/// 允许上传的图片扩展名
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// 图片输入源：只产生一帧
pub struct ImageSource {
  /// 图片数据，读出后为空
  image: Option<RgbImage>,
  width: u32,
  height: u32,
  open: bool,
}

impl ImageSource {
  pub fn open(path: &Path) -> Result<Self, SourceError> {
    let extension = path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(str::to_lowercase)
      .unwrap_or_default();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
      return Err(SourceError::UnsupportedFormat(path.display().to_string()));
    }

    let image = ImageReader::open(path)
      .map_err(|e| SourceError::unavailable(path.display(), e))?
      .with_guessed_format()
      .map_err(|e| SourceError::unavailable(path.display(), e))?
      .decode()
      .map_err(|e| SourceError::unavailable(path.display(), format!("无法解码图片: {}", e)))?
      .to_rgb8();
    debug!(
      "读取图片 {}: {}x{}",
      path.display(),
      image.width(),
      image.height()
    );

    Ok(Self::from_image(image))
  }

  pub fn from_image(image: RgbImage) -> Self {
    Self {
      width: image.width(),
      height: image.height(),
      image: Some(image),
      open: true,
    }
  }
}

impl FrameSource for ImageSource {
  fn read(&mut self) -> Result<Option<Frame>, SourceError> {
    match self.image.take() {
      Some(image) => Ok(Some(Frame::new(image, 0, 0))),
      None => {
        self.close();
        Ok(None)
      }
    }
  }

  fn close(&mut self) {
    self.image = None;
    self.open = false;
  }

  fn is_open(&self) -> bool {
    self.open
  }

  fn kind(&self) -> SourceKind {
    SourceKind::Image
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    None
  }
}
