// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model.rs - 模型
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

use image::GrayImage;
use thiserror::Error;

use crate::config::{Confidence, TaskKind};

mod labels;
mod nms;
mod yolo;

pub use self::labels::Labels;
pub use self::nms::{iou, non_max_suppression};
pub use self::yolo::{ModelOptions, YoloModel};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn task(&self) -> TaskKind;
  fn infer(&self, input: &Self::Input, options: &InferOptions)
  -> Result<Self::Output, Self::Error>;
}

impl<M: Model + ?Sized> Model for &M {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn task(&self) -> TaskKind {
    (**self).task()
  }

  fn infer(
    &self,
    input: &Self::Input,
    options: &InferOptions,
  ) -> Result<Self::Output, Self::Error> {
    (**self).infer(input, options)
  }
}

/// 单次推理的参数
#[derive(Debug, Clone, Copy)]
pub struct InferOptions {
  pub confidence: Confidence,
  pub iou_threshold: f32,
}

impl Default for InferOptions {
  fn default() -> Self {
    Self {
      confidence: Confidence::default(),
      iou_threshold: 0.7,
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("无法加载模型 {path}: {reason}")]
  Load { path: PathBuf, reason: String },
  #[error("模型推理错误: {0}")]
  Inference(String),
  #[error("模型输出不兼容: {0}")]
  IncompatibleOutput(String),
}

impl ModelError {
  pub fn load(path: &Path, reason: impl ToString) -> Self {
    ModelError::Load {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct DetectItem {
  pub class_id: u32,
  pub label: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，帧像素坐标
  /// 分割掩码，与帧同尺寸，255 为前景
  pub mask: Option<GrayImage>,
  /// 跟踪 ID，仅在启用跟踪且轨迹已确认时存在
  pub track_id: Option<u64>,
}

impl DetectItem {
  pub fn new(class_id: u32, label: impl Into<String>, score: f32, bbox: [f32; 4]) -> Self {
    Self {
      class_id,
      label: label.into(),
      score,
      bbox,
      mask: None,
      track_id: None,
    }
  }

  pub fn width(&self) -> f32 {
    (self.bbox[2] - self.bbox[0]).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.bbox[3] - self.bbox[1]).max(0.0)
  }

  pub fn mask_area(&self) -> Option<u64> {
    self
      .mask
      .as_ref()
      .map(|mask| mask.pixels().filter(|p| p[0] > 0).count() as u64)
  }
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Vec<DetectItem>,
}

impl DetectResult {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self { items }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem> {
    self.items.iter()
  }

  /// 丢弃低于阈值的检测
  pub fn retain_confident(&mut self, confidence: Confidence) {
    self.items.retain(|item| confidence.admits(item.score));
  }
}

impl<'a> IntoIterator for &'a DetectResult {
  type Item = &'a DetectItem;
  type IntoIter = std::slice::Iter<'a, DetectItem>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

/// 按任务类型加载模型
pub fn load_model(
  task: TaskKind,
  path: &Path,
  options: &ModelOptions,
) -> Result<YoloModel, ModelError> {
  YoloModel::load(path, task, options)
}
