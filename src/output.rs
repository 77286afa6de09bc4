// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output.rs - 输出定义
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

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, inference::AnnotatedFrame, settings::ToolPaths};

pub mod draw;

mod directory_record;
mod results;
mod save_image_file;
mod save_video_file;

pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError, Record};
pub use self::results::{DetectionRecord, NOTHING_TO_SHOW, ResultsPanel};
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};
pub use self::save_video_file::{SaveVideoFileError, SaveVideoFileOutput};

/// 渲染目标。每次播放结束（无论成功或出错）都会调用一次 `finish`。
pub trait Render {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError>;

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(())
  }
}

impl<R: Render + ?Sized> Render for Box<R> {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    (**self).render(frame)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }
}

impl<R: Render + ?Sized> Render for &mut R {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    (**self).render(frame)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("视频文件输出错误: {0}")]
  SaveVideoFileError(#[from] SaveVideoFileError),
  #[error("结果输出错误: {0}")]
  ResultsError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体加载错误: {0}")]
  Font(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 丢弃所有帧，只计数
#[derive(Debug, Default)]
pub struct NullOutput {
  frames: u64,
}

impl NullOutput {
  pub fn frames(&self) -> u64 {
    self.frames
  }
}

impl FromUrlWithScheme for NullOutput {
  const SCHEME: &'static str = "null";
}

impl FromUrl for NullOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(NullOutput::default())
  }
}

impl Render for NullOutput {
  fn render(&mut self, _frame: &AnnotatedFrame) -> Result<(), OutputError> {
    self.frames += 1;
    Ok(())
  }
}

/// 把同一帧交给多个输出
#[derive(Default)]
pub struct RenderGroup {
  outputs: Vec<Box<dyn Render + Send>>,
}

impl RenderGroup {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, output: impl Render + Send + 'static) -> Self {
    self.outputs.push(Box::new(output));
    self
  }

  pub fn push(&mut self, output: Box<dyn Render + Send>) {
    self.outputs.push(output);
  }

  pub fn len(&self) -> usize {
    self.outputs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.outputs.is_empty()
  }
}

impl Render for RenderGroup {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    for output in self.outputs.iter_mut() {
      output.render(frame)?;
    }
    Ok(())
  }

  /// 所有输出都会被收尾，返回第一个错误
  fn finish(&mut self) -> Result<(), OutputError> {
    let mut first_error = None;
    for output in self.outputs.iter_mut() {
      if let Err(e) = output.finish() {
        first_error.get_or_insert(e);
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

pub enum OutputWrapper {
  SaveImageFileOutput(SaveImageFileOutput),
  DirectoryRecordOutput(DirectoryRecordOutput),
  SaveVideoFileOutput(SaveVideoFileOutput),
  NullOutput(NullOutput),
}

impl OutputWrapper {
  /// 使用设置中的外部工具路径
  pub fn with_tools(self, tools: &ToolPaths) -> Self {
    match self {
      OutputWrapper::SaveVideoFileOutput(output) => {
        OutputWrapper::SaveVideoFileOutput(output.with_ffmpeg(tools.ffmpeg.clone()))
      }
      other => other,
    }
  }
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    debug!("创建输出: {}", url);
    match url.scheme() {
      SaveImageFileOutput::SCHEME => Ok(OutputWrapper::SaveImageFileOutput(
        SaveImageFileOutput::from_url(url)?,
      )),
      DirectoryRecordOutput::SCHEME => Ok(OutputWrapper::DirectoryRecordOutput(
        DirectoryRecordOutput::from_url(url)?,
      )),
      SaveVideoFileOutput::SCHEME => Ok(OutputWrapper::SaveVideoFileOutput(
        SaveVideoFileOutput::from_url(url)?,
      )),
      NullOutput::SCHEME => Ok(OutputWrapper::NullOutput(NullOutput::from_url(url)?)),
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl Render for OutputWrapper {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.render(frame),
      OutputWrapper::DirectoryRecordOutput(output) => output.render(frame),
      OutputWrapper::SaveVideoFileOutput(output) => output.render(frame),
      OutputWrapper::NullOutput(output) => output.render(frame),
    }
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output.finish(),
      OutputWrapper::DirectoryRecordOutput(output) => output.finish(),
      OutputWrapper::SaveVideoFileOutput(output) => output.finish(),
      OutputWrapper::NullOutput(output) => output.finish(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::Frame;
  use image::RgbImage;

  struct Failing;

  impl Render for Failing {
    fn render(&mut self, _frame: &AnnotatedFrame) -> Result<(), OutputError> {
      Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
      Err(OutputError::Font("boom".into()))
    }
  }

  #[test]
  fn wrapper_dispatches_on_scheme() {
    let parse = |s: &str| OutputWrapper::from_url(&Url::parse(s).unwrap());
    assert!(matches!(
      parse("image:///tmp/out.png"),
      Ok(OutputWrapper::SaveImageFileOutput(_))
    ));
    assert!(matches!(
      parse("folder:///tmp/records?record=id"),
      Ok(OutputWrapper::DirectoryRecordOutput(_))
    ));
    assert!(matches!(
      parse("video:///tmp/out.mp4?fps=30"),
      Ok(OutputWrapper::SaveVideoFileOutput(_))
    ));
    assert!(matches!(parse("null:"), Ok(OutputWrapper::NullOutput(_))));
    assert!(matches!(
      parse("rtsp://localhost/live"),
      Err(OutputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn group_renders_to_every_output_and_finishes_all() {
    let mut group = RenderGroup::new().with(NullOutput::default()).with(Failing);
    assert_eq!(group.len(), 2);
    let frame = AnnotatedFrame::passthrough(Frame::new(RgbImage::new(2, 2), 0, 0));
    group.render(&frame).unwrap();
    assert!(group.finish().is_err());
  }
}
