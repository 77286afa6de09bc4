// 该文件是 Tanjing （探镜） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::{RgbImage, imageops::FilterType};

/// 显示宽度（像素）
pub const DISPLAY_WIDTH: u32 = 720;
/// 显示高度，按 16:9 由宽度推出
pub const DISPLAY_HEIGHT: u32 = DISPLAY_WIDTH * 9 / 16;

/// 帧数据
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }
}

/// 把图像缩放到固定显示尺寸 720x405。
///
/// 不保持原始宽高比：非 16:9 的输入会被拉伸。已是显示尺寸的图像原样返回。
pub fn fit_display(image: &RgbImage) -> RgbImage {
  if is_display_sized(image) {
    return image.clone();
  }
  image::imageops::resize(image, DISPLAY_WIDTH, DISPLAY_HEIGHT, FilterType::Triangle)
}

pub fn is_display_sized(image: &RgbImage) -> bool {
  image.dimensions() == (DISPLAY_WIDTH, DISPLAY_HEIGHT)
}
