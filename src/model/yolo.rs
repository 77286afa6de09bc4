// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/yolo.rs - YOLO 检测/分割模型（ONNX）
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

use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use tracing::{debug, info};
use tract_onnx::prelude::*;

use crate::{
  config::TaskKind,
  model::{DetectItem, DetectResult, InferOptions, Labels, Model, ModelError, non_max_suppression},
};

type Plan = TypedRunnableModel<TypedModel>;

const YOLO_BOX_CHANNELS: usize = 4;
const YOLO_MAX_DET: usize = 300;

/// 模型加载参数
#[derive(Debug, Clone)]
pub struct ModelOptions {
  /// 网络输入边长（正方形）
  pub input_size: u32,
  pub labels: Labels,
}

impl Default for ModelOptions {
  fn default() -> Self {
    Self {
      input_size: 640,
      labels: Labels::coco(),
    }
  }
}

/// YOLOv8 风格的 ONNX 模型，检测输出 `[1, 4 + nc, N]`，
/// 分割模型额外输出 `[1, nm, mh, mw]` 的原型掩码。
pub struct YoloModel {
  plan: Plan,
  task: TaskKind,
  input_size: u32,
  labels: Labels,
  path: PathBuf,
}

struct Candidate {
  class_id: u32,
  score: f32,
  bbox: [f32; 4],
  coefs: Vec<f32>,
}

impl YoloModel {
  pub fn load(path: &Path, task: TaskKind, options: &ModelOptions) -> Result<Self, ModelError> {
    info!("加载模型文件: {}", path.display());
    let metadata = std::fs::metadata(path).map_err(|e| ModelError::load(path, e))?;
    if !metadata.is_file() {
      return Err(ModelError::load(path, "不是文件"));
    }
    debug!(
      "模型文件大小: {:.2} MB",
      metadata.len() as f64 / (1024.0 * 1024.0)
    );

    let size = options.input_size as usize;
    let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
    let plan = tract_onnx::onnx()
      .model_for_path(path)
      .and_then(|model| model.with_input_fact(0, input_fact))
      .and_then(|model| model.into_optimized())
      .and_then(|model| model.into_runnable())
      .map_err(|e| ModelError::load(path, e))?;
    info!("模型加载完成 ({})", task);

    Ok(Self {
      plan,
      task,
      input_size: options.input_size,
      labels: options.labels.clone(),
      path: path.to_path_buf(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn preprocess(&self, image: &RgbImage) -> Tensor {
    let size = self.input_size;
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    tract_ndarray::Array4::from_shape_fn(
      (1, 3, size as usize, size as usize),
      |(_, c, y, x)| resized[(x as u32, y as u32)][c] as f32 / 255.0,
    )
    .into()
  }

  fn postprocess(
    &self,
    outputs: &TVec<TValue>,
    frame_width: u32,
    frame_height: u32,
    options: &InferOptions,
  ) -> Result<DetectResult, ModelError> {
    let preds = outputs
      .first()
      .ok_or_else(|| ModelError::IncompatibleOutput("模型没有输出".to_string()))?
      .to_array_view::<f32>()
      .map_err(|e| ModelError::Inference(e.to_string()))?;
    let preds = preds
      .into_dimensionality::<tract_ndarray::Ix3>()
      .map_err(|e| ModelError::IncompatibleOutput(format!("预期检测输出形状为 [1, C, N]: {}", e)))?;

    let shape = preds.shape().to_vec();
    if shape[0] != 1 {
      return Err(ModelError::IncompatibleOutput(format!(
        "预期批大小为 1，实际为 {}",
        shape[0]
      )));
    }

    let protos = match self.task {
      TaskKind::Detection => None,
      TaskKind::Segmentation => {
        let protos = outputs
          .get(1)
          .ok_or_else(|| ModelError::IncompatibleOutput("分割模型缺少原型掩码输出".to_string()))?
          .to_array_view::<f32>()
          .map_err(|e| ModelError::Inference(e.to_string()))?
          .into_dimensionality::<tract_ndarray::Ix4>()
          .map_err(|e| {
            ModelError::IncompatibleOutput(format!("预期原型掩码形状为 [1, nm, mh, mw]: {}", e))
          })?;
        Some(protos)
      }
    };
    let num_masks = protos.as_ref().map(|p| p.shape()[1]).unwrap_or(0);

    // 兼容 [1, C, N] 与转置后的 [1, N, C]
    let channels_first = shape[1] < shape[2];
    let (channels, anchors) = if channels_first {
      (shape[1], shape[2])
    } else {
      (shape[2], shape[1])
    };
    if channels <= YOLO_BOX_CHANNELS + num_masks {
      return Err(ModelError::IncompatibleOutput(format!(
        "输出通道数 {} 不足以容纳框、类别与 {} 个掩码系数",
        channels, num_masks
      )));
    }
    let num_classes = channels - YOLO_BOX_CHANNELS - num_masks;
    let at = |c: usize, i: usize| {
      if channels_first {
        preds[(0, c, i)]
      } else {
        preds[(0, i, c)]
      }
    };

    let scale_x = frame_width as f32 / self.input_size as f32;
    let scale_y = frame_height as f32 / self.input_size as f32;
    let max_x = frame_width as f32;
    let max_y = frame_height as f32;

    let mut candidates = Vec::new();
    for i in 0..anchors {
      let mut class_id = 0usize;
      let mut score = f32::MIN;
      for c in 0..num_classes {
        let value = at(YOLO_BOX_CHANNELS + c, i);
        if value > score {
          score = value;
          class_id = c;
        }
      }

      if !options.confidence.admits(score) {
        continue;
      }

      let cx = at(0, i) * scale_x;
      let cy = at(1, i) * scale_y;
      let w = at(2, i) * scale_x;
      let h = at(3, i) * scale_y;
      let bbox = [
        (cx - w / 2.0).clamp(0.0, max_x),
        (cy - h / 2.0).clamp(0.0, max_y),
        (cx + w / 2.0).clamp(0.0, max_x),
        (cy + h / 2.0).clamp(0.0, max_y),
      ];

      let coefs = (0..num_masks)
        .map(|k| at(YOLO_BOX_CHANNELS + num_classes + k, i))
        .collect();

      candidates.push(Candidate {
        class_id: class_id as u32,
        score,
        bbox,
        coefs,
      });
    }
    debug!("置信度筛选后候选框: {}", candidates.len());

    let kept = non_max_suppression(candidates, options.iou_threshold, YOLO_MAX_DET, |c| {
      (c.class_id, c.score, c.bbox)
    });

    let items = kept
      .into_iter()
      .map(|candidate| {
        let mut item = DetectItem::new(
          candidate.class_id,
          self.labels.name(candidate.class_id),
          candidate.score,
          candidate.bbox,
        );
        if let Some(protos) = protos.as_ref() {
          item.mask = Some(decode_mask(
            protos,
            &candidate.coefs,
            &candidate.bbox,
            frame_width,
            frame_height,
          ));
        }
        item
      })
      .collect::<Vec<_>>();

    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult::new(items))
  }
}

impl Model for YoloModel {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn task(&self) -> TaskKind {
    self.task
  }

  fn infer(&self, input: &Self::Input, options: &InferOptions) -> Result<Self::Output, Self::Error> {
    debug!("设置模型输入");
    let tensor = self.preprocess(input);

    debug!("执行模型推理");
    let outputs = self
      .plan
      .run(tvec!(tensor.into()))
      .map_err(|e| ModelError::Inference(e.to_string()))?;

    debug!("后处理模型输出");
    self.postprocess(&outputs, input.width(), input.height(), options)
  }
}

/// 由掩码系数与原型掩码合成单个目标的掩码，裁剪到检测框内
fn decode_mask(
  protos: &tract_ndarray::ArrayView4<f32>,
  coefs: &[f32],
  bbox: &[f32; 4],
  frame_width: u32,
  frame_height: u32,
) -> GrayImage {
  let (_, num_masks, mask_h, mask_w) = protos.dim();

  let mut logits = vec![0f32; mask_h * mask_w];
  for (k, &coef) in coefs.iter().enumerate().take(num_masks) {
    for y in 0..mask_h {
      for x in 0..mask_w {
        logits[y * mask_w + x] += coef * protos[(0, k, y, x)];
      }
    }
  }

  let mut mask = GrayImage::new(frame_width, frame_height);
  let x_start = bbox[0].floor().max(0.0) as u32;
  let y_start = bbox[1].floor().max(0.0) as u32;
  let x_end = (bbox[2].ceil() as u32).min(frame_width);
  let y_end = (bbox[3].ceil() as u32).min(frame_height);

  let ratio_x = mask_w as f32 / frame_width as f32;
  let ratio_y = mask_h as f32 / frame_height as f32;
  for y in y_start..y_end {
    for x in x_start..x_end {
      let fx = (x as f32 + 0.5) * ratio_x - 0.5;
      let fy = (y as f32 + 0.5) * ratio_y - 0.5;
      // sigmoid(v) > 0.5 等价于 v > 0
      if bilinear(&logits, mask_w, mask_h, fx, fy) > 0.0 {
        mask.put_pixel(x, y, Luma([255]));
      }
    }
  }
  mask
}

fn bilinear(data: &[f32], width: usize, height: usize, fx: f32, fy: f32) -> f32 {
  let fx = fx.clamp(0.0, (width - 1) as f32);
  let fy = fy.clamp(0.0, (height - 1) as f32);
  let x0 = fx.floor() as usize;
  let y0 = fy.floor() as usize;
  let x1 = (x0 + 1).min(width - 1);
  let y1 = (y0 + 1).min(height - 1);
  let dx = fx - x0 as f32;
  let dy = fy - y0 as f32;

  let top = data[y0 * width + x0] * (1.0 - dx) + data[y0 * width + x1] * dx;
  let bottom = data[y1 * width + x0] * (1.0 - dx) + data[y1 * width + x1] * dx;
  top * (1.0 - dy) + bottom * dy
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bilinear_interpolates_between_cells() {
    let data = [0.0, 1.0, 2.0, 3.0];
    assert_eq!(bilinear(&data, 2, 2, 0.0, 0.0), 0.0);
    assert_eq!(bilinear(&data, 2, 2, 1.0, 1.0), 3.0);
    assert!((bilinear(&data, 2, 2, 0.5, 0.5) - 1.5).abs() < 1e-6);
    // 越界坐标被收敛到边缘
    assert_eq!(bilinear(&data, 2, 2, -3.0, 9.0), 2.0);
  }

  #[test]
  fn mask_is_cropped_to_bbox() {
    // 单个原型掩码，全部为正
    let protos = tract_ndarray::Array4::from_elem((1, 1, 4, 4), 1.0f32);
    let mask = decode_mask(&protos.view(), &[1.0], &[2.0, 2.0, 6.0, 5.0], 10, 10);
    assert_eq!(mask.dimensions(), (10, 10));
    assert_eq!(mask.get_pixel(3, 3)[0], 255);
    assert_eq!(mask.get_pixel(0, 0)[0], 0);
    assert_eq!(mask.get_pixel(8, 8)[0], 0);
    let area = mask.pixels().filter(|p| p[0] > 0).count();
    assert_eq!(area, 4 * 3);
  }

  #[test]
  fn negative_coefficients_give_empty_mask() {
    let protos = tract_ndarray::Array4::from_elem((1, 1, 4, 4), 1.0f32);
    let mask = decode_mask(&protos.view(), &[-1.0], &[0.0, 0.0, 10.0, 10.0], 10, 10);
    assert!(mask.pixels().all(|p| p[0] == 0));
  }
}
