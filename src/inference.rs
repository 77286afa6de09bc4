// 该文件是 Tanjing （探镜） 项目的一部分。
// src/inference.rs - 单帧推理与渲染
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

use std::borrow::Cow;

use image::RgbImage;
use tracing::{debug, info};

use crate::{
  frame::{Frame, fit_display},
  model::{DetectResult, InferOptions, Model, ModelError},
  output::draw::{Draw, side_by_side},
  track::{Tracker, TrackerKind, create_tracker},
};

/// 检测/分割模型的统一对象类型
pub type DynModel = dyn Model<Input = RgbImage, Output = DetectResult, Error = ModelError>;

/// 帧的展示方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
  /// 只展示标注后的帧
  #[default]
  Single,
  /// 原图与标注结果左右并排
  SideBySide,
}

/// 推理并绘制后的帧
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
  pub index: u64,
  pub timestamp_ms: u64,
  pub source: RgbImage,
  pub annotated: RgbImage,
  pub result: DetectResult,
  pub layout: Layout,
  /// 是否经过模型推理；预览与默认图片为 `false`
  pub inferred: bool,
}

impl AnnotatedFrame {
  /// 不做推理，原样展示
  pub fn passthrough(frame: Frame) -> Self {
    Self {
      index: frame.index,
      timestamp_ms: frame.timestamp_ms,
      annotated: frame.image.clone(),
      source: frame.image,
      result: DetectResult::default(),
      layout: Layout::Single,
      inferred: false,
    }
  }

  /// 预先准备好的原图与标注图并排展示，不做推理
  pub fn precomputed(source: RgbImage, annotated: RgbImage) -> Self {
    Self {
      index: 0,
      timestamp_ms: 0,
      source,
      annotated,
      result: DetectResult::default(),
      layout: Layout::SideBySide,
      inferred: false,
    }
  }

  /// 按布局合成最终展示的图像
  pub fn display(&self) -> Cow<'_, RgbImage> {
    match self.layout {
      Layout::Single => Cow::Borrowed(&self.annotated),
      Layout::SideBySide => Cow::Owned(side_by_side(&self.source, &self.annotated)),
    }
  }
}

/// 推理与渲染步骤。
///
/// 启用跟踪时，跟踪器随 `Predictor` 一起创建，只在一次播放会话内保留目标身份。
pub struct Predictor<M> {
  model: M,
  options: InferOptions,
  tracker: Option<Box<dyn Tracker + Send>>,
  draw: Draw,
}

impl<M> Predictor<M>
where
  M: Model<Input = RgbImage, Output = DetectResult, Error = ModelError>,
{
  pub fn new(model: M, options: InferOptions) -> Self {
    Self {
      model,
      options,
      tracker: None,
      draw: Draw::new(),
    }
  }

  pub fn with_tracker(mut self, kind: Option<TrackerKind>) -> Self {
    if let Some(kind) = kind {
      info!("启用跟踪: {}", kind);
    }
    self.tracker = kind.map(create_tracker);
    self
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn options(&self) -> &InferOptions {
    &self.options
  }

  pub fn is_tracking(&self) -> bool {
    self.tracker.is_some()
  }

  /// 推理并按阈值过滤，启用跟踪时补上跟踪 ID
  pub fn predict(&mut self, image: &RgbImage) -> Result<DetectResult, ModelError> {
    let mut result = self.model.infer(image, &self.options)?;
    result.retain_confident(self.options.confidence);
    if let Some(tracker) = self.tracker.as_mut() {
      tracker.update(&mut result);
      debug!("活跃轨迹: {}", tracker.active_tracks());
    }
    Ok(result)
  }

  /// 视频帧：先缩放到显示尺寸，再推理、绘制
  pub fn step(&mut self, frame: Frame) -> Result<AnnotatedFrame, ModelError> {
    let image = fit_display(&frame.image);
    let result = self.predict(&image)?;
    let annotated = self.draw.annotate(&image, &result);
    Ok(AnnotatedFrame {
      index: frame.index,
      timestamp_ms: frame.timestamp_ms,
      source: image,
      annotated,
      result,
      layout: Layout::Single,
      inferred: true,
    })
  }

  /// 单张图片：保持原尺寸推理，结果与原图并排展示
  pub fn detect(&mut self, frame: Frame) -> Result<AnnotatedFrame, ModelError> {
    let result = self.predict(&frame.image)?;
    let annotated = self.draw.annotate(&frame.image, &result);
    Ok(AnnotatedFrame {
      index: frame.index,
      timestamp_ms: frame.timestamp_ms,
      source: frame.image,
      annotated,
      result,
      layout: Layout::SideBySide,
      inferred: true,
    })
  }
}
