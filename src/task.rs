// 该文件是 Tanjing （探镜） 项目的一部分。
// src/task.rs - 播放任务
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

use std::fmt;
use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};
use std::{thread, time::Duration, time::Instant};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  input::{FrameSource, SourceError},
  inference::Predictor,
  model::{DetectResult, Model, ModelError},
  output::{OutputError, Render},
};

/// 中断信号到达后强制退出前的等待时间
const FORCED_EXIT_SECS: u64 = 30;

/// 取消令牌，克隆后共享同一个标志
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// 安装 Ctrl-C 处理函数：收到中断后触发令牌，30 秒后仍未退出则强制退出
  pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
    let token = self.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      token.cancel();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(FORCED_EXIT_SECS));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
  }
}

/// 播放状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
  Idle,
  SourceOpened,
  Reading,
  Rendering,
  Closed,
  Error,
}

impl PlaybackState {
  pub fn is_terminal(self) -> bool {
    matches!(self, PlaybackState::Closed | PlaybackState::Error)
  }
}

/// 播放结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  EndOfStream,
  FrameLimit,
  Cancelled,
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StopReason::EndOfStream => write!(f, "输入结束"),
      StopReason::FrameLimit => write!(f, "达到指定帧数"),
      StopReason::Cancelled => write!(f, "已取消"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
  pub frames: u64,
  pub detections: u64,
  pub state: PlaybackState,
  pub stop: StopReason,
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  ModelLoad,
  SourceUnavailable,
  StreamResolution,
  ReadFailure,
  Inference,
  Render,
}

#[derive(Error, Debug)]
pub enum PlaybackError {
  #[error("{0}")]
  Model(#[from] ModelError),
  #[error("{0}")]
  Source(#[from] SourceError),
  #[error("{0}")]
  Output(#[from] OutputError),
  #[error("视频目录中没有名为 {0} 的视频")]
  UnknownVideo(String),
  #[error("输入源没有产生任何帧")]
  NoFrame,
}

impl PlaybackError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PlaybackError::Model(ModelError::Load { .. }) => ErrorKind::ModelLoad,
      PlaybackError::Model(_) => ErrorKind::Inference,
      PlaybackError::Source(SourceError::Resolve(_)) => ErrorKind::StreamResolution,
      PlaybackError::Source(SourceError::ReadFailure(_)) => ErrorKind::ReadFailure,
      PlaybackError::Source(_) | PlaybackError::UnknownVideo(_) => ErrorKind::SourceUnavailable,
      PlaybackError::NoFrame => ErrorKind::ReadFailure,
      PlaybackError::Output(_) => ErrorKind::Render,
    }
  }
}

pub trait Task<S, P, O>: Sized {
  type Error;
  fn run_task(self, source: S, predictor: P, output: O) -> Result<PlaybackReport, Self::Error>;
}

/// 连续播放：逐帧读取、推理、渲染，直到输入结束、达到帧数或被取消
#[derive(Debug, Default)]
pub struct PlaybackTask {
  max_frames: Option<u64>,
  cancel: CancelToken,
  state: Option<PlaybackState>,
}

impl PlaybackTask {
  pub fn new(cancel: CancelToken) -> Self {
    Self {
      cancel,
      ..Self::default()
    }
  }

  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  fn transition(&mut self, next: PlaybackState) {
    let prev = self.state.replace(next).unwrap_or(PlaybackState::Idle);
    if prev != next {
      debug!("播放状态: {:?} -> {:?}", prev, next);
    }
  }

  fn run_loop<M, O>(
    &mut self,
    source: &mut dyn FrameSource,
    predictor: &mut Predictor<M>,
    output: &mut O,
    report: &mut PlaybackReport,
  ) -> Result<StopReason, PlaybackError>
  where
    M: Model<Input = RgbImage, Output = DetectResult, Error = ModelError>,
    O: Render + ?Sized,
  {
    loop {
      if self.cancel.is_cancelled() {
        warn!("中断信号接收，退出任务循环");
        return Ok(StopReason::Cancelled);
      }
      if self.max_frames.is_some_and(|n| report.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", report.frames);
        return Ok(StopReason::FrameLimit);
      }
      if !source.is_open() {
        return Ok(StopReason::EndOfStream);
      }

      self.transition(PlaybackState::Reading);
      let frame = match source.read()? {
        Some(frame) => frame,
        None => return Ok(StopReason::EndOfStream),
      };

      self.transition(PlaybackState::Rendering);
      let now = Instant::now();
      let annotated = predictor.step(frame)?;
      let elapsed_a = now.elapsed();
      output.render(&annotated)?;
      let elapsed_b = now.elapsed();

      report.frames += 1;
      report.detections += annotated.result.len() as u64;
      info!(
        "第 {} 帧: {} 个目标，推理 {:.2?} / 渲染 {:.2?}",
        annotated.index,
        annotated.result.len(),
        elapsed_a,
        elapsed_b
      );
    }
  }
}

impl<'p, 'o, S, M, O> Task<S, &'p mut Predictor<M>, &'o mut O> for PlaybackTask
where
  S: FrameSource,
  M: Model<Input = RgbImage, Output = DetectResult, Error = ModelError>,
  O: Render + ?Sized,
{
  type Error = PlaybackError;

  fn run_task(
    mut self,
    mut source: S,
    predictor: &'p mut Predictor<M>,
    output: &'o mut O,
  ) -> Result<PlaybackReport, Self::Error> {
    info!("开始播放 ({})...", source.kind());
    self.transition(PlaybackState::SourceOpened);

    let mut report = PlaybackReport {
      frames: 0,
      detections: 0,
      state: PlaybackState::SourceOpened,
      stop: StopReason::EndOfStream,
    };
    let outcome = self.run_loop(&mut source, predictor, output, &mut report);

    // 无论正常结束还是出错，都释放输入源并收尾输出
    source.close();
    let finished = output.finish();

    match outcome.and_then(|stop| finished.map(|_| stop).map_err(PlaybackError::from)) {
      Ok(stop) => {
        self.transition(PlaybackState::Closed);
        info!("播放结束 ({}): 共 {} 帧", stop, report.frames);
        report.state = PlaybackState::Closed;
        report.stop = stop;
        Ok(report)
      }
      Err(e) => {
        self.transition(PlaybackState::Error);
        error!("播放出错，已处理 {} 帧: {}", report.frames, e);
        Err(e)
      }
    }
  }
}

/// 单帧任务：读取一帧，不缩放直接推理，与原图并排渲染
#[derive(Debug, Default)]
pub struct OneShotTask;

impl<'p, 'o, S, M, O> Task<S, &'p mut Predictor<M>, &'o mut O> for OneShotTask
where
  S: FrameSource,
  M: Model<Input = RgbImage, Output = DetectResult, Error = ModelError>,
  O: Render + ?Sized,
{
  type Error = PlaybackError;

  fn run_task(
    self,
    mut source: S,
    predictor: &'p mut Predictor<M>,
    output: &'o mut O,
  ) -> Result<PlaybackReport, Self::Error> {
    info!("开始任务...");
    let read = source.read();
    source.close();

    let outcome = read.map_err(PlaybackError::from).and_then(|frame| {
      let frame = frame.ok_or(PlaybackError::NoFrame)?;
      info!("输入帧获取成功，开始推理...");
      let now = Instant::now();
      let annotated = predictor.detect(frame)?;
      info!("推理完成，耗时: {:.2?}", now.elapsed());
      output.render(&annotated)?;
      Ok(annotated.result.len() as u64)
    });
    let finished = output.finish();

    let detections = outcome?;
    finished?;
    Ok(PlaybackReport {
      frames: 1,
      detections,
      state: PlaybackState::Closed,
      stop: StopReason::EndOfStream,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{input::ResolveError, model::ModelError};
  use std::path::Path;

  #[test]
  fn cancel_token_is_shared_between_clones() {
    let token = CancelToken::new();
    let other = token.clone();
    assert!(!other.is_cancelled());
    token.cancel();
    assert!(other.is_cancelled());
  }

  #[test]
  fn errors_map_to_their_kind() {
    let load = PlaybackError::from(ModelError::load(Path::new("m.onnx"), "missing"));
    assert_eq!(load.kind(), ErrorKind::ModelLoad);
    let infer = PlaybackError::from(ModelError::Inference("boom".into()));
    assert_eq!(infer.kind(), ErrorKind::Inference);
    let resolve = PlaybackError::from(SourceError::from(ResolveError::NoMatchingStream {
      height: 720,
      extension: "mp4".into(),
    }));
    assert_eq!(resolve.kind(), ErrorKind::StreamResolution);
    let unavailable = PlaybackError::from(SourceError::unavailable("rtsp://cam", "refused"));
    assert_eq!(unavailable.kind(), ErrorKind::SourceUnavailable);
    let read = PlaybackError::from(SourceError::ReadFailure("dropped".into()));
    assert_eq!(read.kind(), ErrorKind::ReadFailure);
    assert_eq!(
      PlaybackError::UnknownVideo("video_9".into()).kind(),
      ErrorKind::SourceUnavailable
    );
  }

  #[test]
  fn terminal_states() {
    assert!(PlaybackState::Closed.is_terminal());
    assert!(PlaybackState::Error.is_terminal());
    assert!(!PlaybackState::Reading.is_terminal());
  }
}
