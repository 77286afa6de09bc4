// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontVec, PxScale};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use tracing::debug;

use crate::{
  model::{DetectItem, DetectResult},
  output::OutputError,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const MASK_ALPHA: f32 = 0.5;

// 按类别（或跟踪 ID）循环使用的调色板
const PALETTE: [[u8; 3]; 20] = [
  [0xFF, 0x38, 0x38],
  [0xFF, 0x9D, 0x97],
  [0xFF, 0x70, 0x1F],
  [0xFF, 0xB2, 0x1D],
  [0xCF, 0xD2, 0x31],
  [0x48, 0xF9, 0x0A],
  [0x92, 0xCC, 0x17],
  [0x3D, 0xDB, 0x86],
  [0x1A, 0x93, 0x34],
  [0x00, 0xD4, 0xBB],
  [0x2C, 0x99, 0xA8],
  [0x00, 0xC2, 0xFF],
  [0x34, 0x45, 0x93],
  [0x64, 0x73, 0xFF],
  [0x00, 0x18, 0xEC],
  [0x84, 0x38, 0xFF],
  [0x52, 0x00, 0x85],
  [0xCB, 0x38, 0xFF],
  [0xFF, 0x95, 0xC8],
  [0xFF, 0x37, 0xC7],
];

pub fn palette(index: u64) -> [u8; 3] {
  PALETTE[(index % PALETTE.len() as u64) as usize]
}

fn item_color(item: &DetectItem) -> [u8; 3] {
  match item.track_id {
    Some(id) => palette(id),
    None => palette(item.class_id as u64),
  }
}

/// 标签文本，跟踪时带上 ID
pub fn label_text(item: &DetectItem) -> String {
  match item.track_id {
    Some(id) => format!("id:{} {} {:.2}", id, item.label, item.score),
    None => format!("{} {:.2}", item.label, item.score),
  }
}

/// 在帧上画出检测框、分割掩码和标签。没有配置字体时只画框和掩码。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  label_text_vertical_padding: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new()
  }
}

impl Draw {
  pub fn new() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
    }
  }

  pub fn with_font_file(path: &Path) -> Result<Self, OutputError> {
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data)
      .map_err(|e| OutputError::Font(format!("{}: {}", path.display(), e)))?;
    debug!("加载标签字体: {}", path.display());
    Ok(Self {
      font: Some(font),
      ..Self::new()
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 在副本上绘制，原图保持不变
  pub fn annotate(&self, image: &RgbImage, result: &DetectResult) -> RgbImage {
    let mut canvas = image.clone();
    self.draw_detections(&mut canvas, result);
    canvas
  }

  pub fn draw_detections(&self, image: &mut RgbImage, result: &DetectResult) {
    // 先画掩码，避免覆盖边框
    for item in result {
      if let Some(mask) = item.mask.as_ref() {
        blend_mask(image, mask, item_color(item));
      }
    }
    for item in result {
      self.draw_bbox_with_label(image, item);
    }
  }

  // bbox 为帧像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }
    let color = item_color(item);

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for thickness in 0..BOX_THICKNESS {
      let x0 = (x_min + thickness).min(x_max);
      let y0 = (y_min + thickness).min(y_max);
      let x1 = (x_max - thickness).max(x0);
      let y1 = (y_max - thickness).max(y0);

      for x in x0..=x1 {
        image.put_pixel(x as u32, y0 as u32, Rgb(color));
        image.put_pixel(x as u32, y1 as u32, Rgb(color));
      }
      for y in y0..=y1 {
        image.put_pixel(x0 as u32, y as u32, Rgb(color));
        image.put_pixel(x1 as u32, y as u32, Rgb(color));
      }
    }

    let font = match self.font.as_ref() {
      Some(font) => font,
      None => return,
    };

    let label = label_text(item);
    let scale = PxScale::from(self.font_size);
    let (text_width, text_height) = text_size(scale, font, &label);
    let label_height = text_height as i32 + 2 * self.label_text_vertical_padding;

    // 标签背景放在边框上方，空间不足时放到框内
    let label_x = x_min;
    let label_y = if y_min >= label_height {
      y_min - label_height
    } else {
      y_min
    };
    let label_width = (text_width as i32 + 4).min(w - label_x);
    if label_width <= 0 {
      return;
    }

    let rect = imageproc::rect::Rect::at(label_x, label_y)
      .of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, Rgb(color));
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      label_x + 2,
      label_y + self.label_text_vertical_padding,
      scale,
      font,
      &label,
    );
  }
}

fn blend_mask(image: &mut RgbImage, mask: &GrayImage, color: [u8; 3]) {
  if mask.dimensions() != image.dimensions() {
    return;
  }
  for (pixel, m) in image.pixels_mut().zip(mask.pixels()) {
    if m[0] == 0 {
      continue;
    }
    for c in 0..3 {
      pixel[c] =
        (pixel[c] as f32 * (1.0 - MASK_ALPHA) + color[c] as f32 * MASK_ALPHA).round() as u8;
    }
  }
}

/// 左右并排显示两张图，高度不同时按较高的补黑边
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
  let width = left.width() + right.width();
  let height = left.height().max(right.height());
  let mut canvas = RgbImage::new(width, height);
  image::imageops::replace(&mut canvas, left, 0, 0);
  image::imageops::replace(&mut canvas, right, left.width() as i64, 0);
  canvas
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(bbox: [f32; 4]) -> DetectItem {
    DetectItem::new(0, "person", 0.87, bbox)
  }

  #[test]
  fn boxes_are_drawn_on_a_copy() {
    let image = RgbImage::new(64, 48);
    let result = DetectResult::new(vec![item([10.0, 10.0, 30.0, 40.0])]);
    let annotated = Draw::new().annotate(&image, &result);

    assert_eq!(image.get_pixel(10, 10), &Rgb([0, 0, 0]));
    assert_eq!(annotated.get_pixel(10, 10), &Rgb(palette(0)));
    assert_eq!(annotated.get_pixel(20, 25), &Rgb([0, 0, 0]));
  }

  #[test]
  fn out_of_frame_boxes_are_clamped() {
    let image = RgbImage::new(32, 32);
    let result = DetectResult::new(vec![item([-20.0, -5.0, 100.0, 100.0])]);
    let annotated = Draw::new().annotate(&image, &result);
    assert_eq!(annotated.get_pixel(0, 0), &Rgb(palette(0)));
    assert_eq!(annotated.get_pixel(31, 31), &Rgb(palette(0)));
  }

  #[test]
  fn masks_are_blended() {
    let image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
    let mut with_mask = item([0.0, 0.0, 7.0, 7.0]);
    let mut mask = GrayImage::new(8, 8);
    mask.put_pixel(4, 4, image::Luma([255]));
    with_mask.mask = Some(mask);

    let annotated = Draw::new().annotate(&image, &DetectResult::new(vec![with_mask]));
    let expected = palette(0).map(|c| (c as f32 * MASK_ALPHA).round() as u8);
    assert_eq!(annotated.get_pixel(4, 4), &Rgb(expected));
    assert_eq!(annotated.get_pixel(3, 3), &Rgb([0, 0, 0]));
  }

  #[test]
  fn labels_carry_track_ids() {
    let mut tracked = item([0.0, 0.0, 1.0, 1.0]);
    assert_eq!(label_text(&tracked), "person 0.87");
    tracked.track_id = Some(3);
    assert_eq!(label_text(&tracked), "id:3 person 0.87");
  }

  #[test]
  fn side_by_side_places_images_next_to_each_other() {
    let left = RgbImage::from_pixel(4, 3, Rgb([255, 0, 0]));
    let right = RgbImage::from_pixel(2, 5, Rgb([0, 255, 0]));
    let canvas = side_by_side(&left, &right);
    assert_eq!(canvas.dimensions(), (6, 5));
    assert_eq!(canvas.get_pixel(0, 0), &Rgb([255, 0, 0]));
    assert_eq!(canvas.get_pixel(4, 4), &Rgb([0, 255, 0]));
    assert_eq!(canvas.get_pixel(0, 4), &Rgb([0, 0, 0]));
  }
}
