// 该文件是 Tanjing （探镜） 项目的一部分。
// src/dispatch.rs - 按用户选择分派播放流程
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

//! 每次触发都从 [`Request`] 与 [`Settings`] 重新决定：加载哪个模型、打开哪个输入源、
//! 走哪条流程。分派器本身不保存任何跨触发的状态。

use std::path::Path;

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::{
  config::{Action, Request, SourceKind, SourceSelection, TaskKind},
  inference::{AnnotatedFrame, DynModel, Predictor},
  input::{BoxedSource, FrameSource, OpenOptions, SourceDescriptor, SourceError, open_source},
  model::{InferOptions, Labels, ModelError, ModelOptions, load_model},
  output::{Render, draw::Draw},
  settings::Settings,
  task::{CancelToken, OneShotTask, PlaybackError, PlaybackReport, PlaybackTask, Task},
};

/// 模型加载
pub trait ModelLoader {
  fn load(&self, task: TaskKind, path: &Path) -> Result<Box<DynModel>, ModelError>;
}

/// ONNX 模型加载器
#[derive(Debug, Clone, Default)]
pub struct OnnxModelLoader {
  options: ModelOptions,
}

impl OnnxModelLoader {
  pub fn new(options: ModelOptions) -> Self {
    Self { options }
  }

  /// 按设置读取标签文件与输入尺寸
  pub fn from_settings(settings: &Settings) -> Result<Self, ModelError> {
    let labels = match settings.labels.as_deref() {
      Some(path) => Labels::from_file(path).map_err(|e| ModelError::load(path, e))?,
      None => Labels::coco(),
    };
    Ok(Self::new(ModelOptions {
      input_size: settings.input_size,
      labels,
    }))
  }
}

impl ModelLoader for OnnxModelLoader {
  fn load(&self, task: TaskKind, path: &Path) -> Result<Box<DynModel>, ModelError> {
    Ok(Box::new(load_model(task, path, &self.options)?))
  }
}

/// 输入源打开
pub trait SourceOpener {
  fn open(&self, descriptor: &SourceDescriptor) -> Result<BoxedSource, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemSourceOpener {
  options: OpenOptions,
}

impl SystemSourceOpener {
  pub fn new(options: OpenOptions) -> Self {
    Self { options }
  }
}

impl SourceOpener for SystemSourceOpener {
  fn open(&self, descriptor: &SourceDescriptor) -> Result<BoxedSource, SourceError> {
    open_source(descriptor, &self.options)
  }
}

/// 一次触发的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// 展示默认图片及其预先标注的结果，未做推理
  DefaultImage,
  /// 只查看了输入源
  Previewed {
    kind: SourceKind,
    width: u32,
    height: u32,
    fps: Option<f64>,
  },
  /// 完成了推理播放
  Played(PlaybackReport),
}

pub struct Dispatcher<'a> {
  settings: &'a Settings,
  models: &'a dyn ModelLoader,
  sources: &'a dyn SourceOpener,
  cancel: CancelToken,
}

impl<'a> Dispatcher<'a> {
  pub fn new(
    settings: &'a Settings,
    models: &'a dyn ModelLoader,
    sources: &'a dyn SourceOpener,
  ) -> Self {
    Self {
      settings,
      models,
      sources,
      cancel: CancelToken::new(),
    }
  }

  pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// 把用户选择映射为要打开的输入源；上传图片为空时返回 `None`
  pub fn descriptor(
    &self,
    selection: &SourceSelection,
  ) -> Result<Option<SourceDescriptor>, PlaybackError> {
    let descriptor = match selection {
      SourceSelection::Image(None) => return Ok(None),
      SourceSelection::Image(Some(path)) => SourceDescriptor::Image(path.clone()),
      SourceSelection::Video(name) => {
        let path = self
          .settings
          .video_path(name)
          .ok_or_else(|| PlaybackError::UnknownVideo(name.clone()))?;
        SourceDescriptor::VideoFile(path.to_path_buf())
      }
      SourceSelection::Webcam(device) => SourceDescriptor::Webcam(device.clone()),
      SourceSelection::Rtsp(url) => SourceDescriptor::Rtsp(url.trim().to_string()),
      SourceSelection::YouTube(url) => SourceDescriptor::YouTube(url.trim().to_string()),
    };
    Ok(Some(descriptor))
  }

  pub fn dispatch(
    &self,
    request: &Request,
    output: &mut dyn Render,
  ) -> Result<Outcome, PlaybackError> {
    info!(
      "任务: {}，输入: {}，置信度: {}",
      request.task,
      request.source.kind(),
      request.confidence
    );

    let descriptor = match self.descriptor(&request.source)? {
      Some(descriptor) => descriptor,
      None => return self.show_default_image(output),
    };

    match (request.action, descriptor.kind()) {
      (Action::Preview, _) => self.preview(request, &descriptor, output),
      (Action::Detect, SourceKind::Image) => self.detect_image(request, &descriptor, output),
      (Action::Detect, _) => self.play(request, &descriptor, output),
    }
  }

  /// 没有上传图片：并排展示默认图片与预先标注好的结果
  fn show_default_image(&self, output: &mut dyn Render) -> Result<Outcome, PlaybackError> {
    let default_image = load_rgb(&self.settings.default_image)?;
    let default_detected = load_rgb(&self.settings.default_detect_image)?;
    debug!("展示默认图片: {}", self.settings.default_image.display());

    let frame = AnnotatedFrame::precomputed(default_image, default_detected);
    let rendered = output.render(&frame);
    output.finish()?;
    rendered?;
    Ok(Outcome::DefaultImage)
  }

  /// 只打开输入源查看，不做推理
  fn preview(
    &self,
    request: &Request,
    descriptor: &SourceDescriptor,
    output: &mut dyn Render,
  ) -> Result<Outcome, PlaybackError> {
    let mut source = self.sources.open(descriptor)?;
    let outcome = Outcome::Previewed {
      kind: source.kind(),
      width: source.width(),
      height: source.height(),
      fps: source.fps(),
    };

    // 图片展示原图，视频文件原样播放一遍；实时流只报告元数据
    let rendered = match descriptor.kind() {
      SourceKind::Image => source
        .read()
        .map_err(PlaybackError::from)
        .and_then(|frame| match frame {
          Some(frame) => Ok(output.render(&AnnotatedFrame::passthrough(frame))?),
          None => Err(PlaybackError::NoFrame),
        }),
      SourceKind::Video => self.replay(&mut source, output, request.max_frames),
      _ => Ok(()),
    };
    source.close();
    output.finish()?;
    rendered?;

    info!("预览输入源: {:?}", outcome);
    Ok(outcome)
  }

  fn replay(
    &self,
    source: &mut BoxedSource,
    output: &mut dyn Render,
    max_frames: Option<u64>,
  ) -> Result<(), PlaybackError> {
    let limit = max_frames.unwrap_or(u64::MAX);
    let mut shown = 0;
    for frame in source.frames(self.cancel.clone()) {
      if shown >= limit {
        break;
      }
      output.render(&AnnotatedFrame::passthrough(frame?))?;
      shown += 1;
    }
    debug!("预览播放 {} 帧", shown);
    Ok(())
  }

  fn predictor<'m>(&self, request: &Request, model: &'m DynModel) -> Predictor<&'m DynModel> {
    let options = InferOptions {
      confidence: request.confidence,
      iou_threshold: self.settings.iou_threshold,
    };
    Predictor::new(model, options).with_draw(self.draw())
  }

  fn draw(&self) -> Draw {
    match self.settings.font.as_deref() {
      Some(path) => Draw::with_font_file(path).unwrap_or_else(|e| {
        warn!("无法加载字体，标签文字将不会绘制: {}", e);
        Draw::new()
      }),
      None => Draw::new(),
    }
  }

  fn load_model(&self, task: TaskKind) -> Result<Box<DynModel>, PlaybackError> {
    let path = self.settings.model_path(task);
    info!("加载{}模型: {}", task, path.display());
    Ok(self.models.load(task, path)?)
  }

  /// 上传图片：单帧推理，原图与结果并排展示
  fn detect_image(
    &self,
    request: &Request,
    descriptor: &SourceDescriptor,
    output: &mut dyn Render,
  ) -> Result<Outcome, PlaybackError> {
    let model = self.load_model(request.task)?;
    let source = self.sources.open(descriptor)?;
    let mut predictor = self.predictor(request, model.as_ref());
    let report = OneShotTask.run_task(source, &mut predictor, output)?;
    Ok(Outcome::Played(report))
  }

  /// 视频、摄像头、RTSP、YouTube：连续播放直到结束；失败不重试
  fn play(
    &self,
    request: &Request,
    descriptor: &SourceDescriptor,
    output: &mut dyn Render,
  ) -> Result<Outcome, PlaybackError> {
    let model = self.load_model(request.task)?;
    let source = self.sources.open(descriptor)?;
    // 跟踪器随本次播放创建，播放结束即丢弃
    let mut predictor = self
      .predictor(request, model.as_ref())
      .with_tracker(request.tracker);
    let report = PlaybackTask::new(self.cancel.clone())
      .with_max_frames(request.max_frames)
      .run_task(source, &mut predictor, output)?;
    Ok(Outcome::Played(report))
  }
}

fn load_rgb(path: &Path) -> Result<RgbImage, SourceError> {
  image::open(path)
    .map(|image| image.to_rgb8())
    .map_err(|e| SourceError::unavailable(path.display(), e))
}
