// 该文件是 Tanjing （探镜） 项目的一部分。
// src/config.rs - 单次请求的配置
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

//! 每次外部触发（一次命令行调用）都从当前输入值重新构建 [`Request`]，
//! 除一次播放会话内的跟踪器记忆外，不保留任何跨触发的状态。

use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;

use crate::track::TrackerKind;

/// 推理任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TaskKind {
  /// 目标检测
  #[default]
  Detection,
  /// 实例分割
  Segmentation,
}

impl fmt::Display for TaskKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskKind::Detection => write!(f, "检测"),
      TaskKind::Segmentation => write!(f, "分割"),
    }
  }
}

/// 输入源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SourceKind {
  /// 单张图片
  #[default]
  Image,
  /// 本地视频文件
  Video,
  /// 摄像头
  Webcam,
  /// RTSP 网络流
  Rtsp,
  /// YouTube 视频
  #[value(name = "youtube")]
  YouTube,
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceKind::Image => write!(f, "图片"),
      SourceKind::Video => write!(f, "视频"),
      SourceKind::Webcam => write!(f, "摄像头"),
      SourceKind::Rtsp => write!(f, "RTSP"),
      SourceKind::YouTube => write!(f, "YouTube"),
    }
  }
}

/// 跟踪器选择，`None` 表示不启用跟踪
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TrackerChoice {
  #[default]
  None,
  #[value(name = "bytetrack")]
  ByteTrack,
  #[value(name = "botsort")]
  BotSort,
}

impl From<TrackerChoice> for Option<TrackerKind> {
  fn from(choice: TrackerChoice) -> Self {
    match choice {
      TrackerChoice::None => None,
      TrackerChoice::ByteTrack => Some(TrackerKind::ByteTrack),
      TrackerChoice::BotSort => Some(TrackerKind::BotSort),
    }
  }
}

/// 置信度阈值，始终位于 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Confidence(f32);

impl Confidence {
  pub const MIN_PERCENT: u8 = 25;
  pub const MAX_PERCENT: u8 = 100;
  pub const DEFAULT_PERCENT: u8 = 40;

  /// 任意浮点值都被收敛到 [0, 1]，NaN 视为 0
  pub fn new(value: f32) -> Self {
    if value.is_nan() {
      Confidence(0.0)
    } else {
      Confidence(value.clamp(0.0, 1.0))
    }
  }

  /// 滑块上的百分比（25 - 100）换算为阈值
  pub fn from_percent(percent: u8) -> Self {
    Self::new(percent as f32 / 100.0)
  }

  pub fn value(self) -> f32 {
    self.0
  }

  pub fn admits(self, score: f32) -> bool {
    score >= self.0
  }
}

impl Default for Confidence {
  fn default() -> Self {
    Self::from_percent(Self::DEFAULT_PERCENT)
  }
}

impl fmt::Display for Confidence {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:.0}%", self.0 * 100.0)
  }
}

/// 用户选择的输入源及其参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
  /// 上传的图片；`None` 时展示默认图片
  Image(Option<PathBuf>),
  /// 视频目录中的名称
  Video(String),
  /// 摄像头设备
  Webcam(String),
  /// RTSP 地址
  Rtsp(String),
  /// YouTube 视频地址
  YouTube(String),
}

impl SourceSelection {
  pub fn kind(&self) -> SourceKind {
    match self {
      SourceSelection::Image(_) => SourceKind::Image,
      SourceSelection::Video(_) => SourceKind::Video,
      SourceSelection::Webcam(_) => SourceKind::Webcam,
      SourceSelection::Rtsp(_) => SourceKind::Rtsp,
      SourceSelection::YouTube(_) => SourceKind::YouTube,
    }
  }
}

/// 用户触发的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
  /// 按下“检测”按钮
  #[default]
  Detect,
  /// 只查看输入，不做推理
  Preview,
}

/// 一次触发的完整配置
#[derive(Debug, Clone)]
pub struct Request {
  pub task: TaskKind,
  pub confidence: Confidence,
  pub source: SourceSelection,
  /// 只有启用跟踪时才有意义
  pub tracker: Option<TrackerKind>,
  pub action: Action,
  /// 最大处理帧数，`None` 表示直到输入结束
  pub max_frames: Option<u64>,
}

impl Request {
  pub fn new(task: TaskKind, confidence: Confidence, source: SourceSelection) -> Self {
    Self {
      task,
      confidence,
      source,
      tracker: None,
      action: Action::Detect,
      max_frames: None,
    }
  }

  pub fn with_tracker(mut self, tracker: Option<TrackerKind>) -> Self {
    self.tracker = tracker;
    self
  }

  pub fn with_action(mut self, action: Action) -> Self {
    self.action = action;
    self
  }

  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  pub fn is_tracking(&self) -> bool {
    self.tracker.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn confidence_is_normalised() {
    assert_eq!(Confidence::new(1.7).value(), 1.0);
    assert_eq!(Confidence::new(-0.2).value(), 0.0);
    assert_eq!(Confidence::new(f32::NAN).value(), 0.0);
    assert_eq!(Confidence::from_percent(40).value(), 0.4);
    assert_eq!(Confidence::from_percent(100).value(), 1.0);
  }

  #[test]
  fn confidence_admits_scores_at_threshold() {
    let conf = Confidence::new(0.4);
    assert!(conf.admits(0.4));
    assert!(conf.admits(0.9));
    assert!(!conf.admits(0.39));
  }

  #[test]
  fn tracker_choice_maps_to_kind() {
    assert_eq!(Option::<TrackerKind>::from(TrackerChoice::None), None);
    assert_eq!(
      Option::<TrackerKind>::from(TrackerChoice::ByteTrack),
      Some(TrackerKind::ByteTrack)
    );
    assert_eq!(
      Option::<TrackerKind>::from(TrackerChoice::BotSort),
      Some(TrackerKind::BotSort)
    );
  }

  #[test]
  fn selection_reports_its_kind() {
    assert_eq!(SourceSelection::Image(None).kind(), SourceKind::Image);
    assert_eq!(
      SourceSelection::Rtsp("rtsp://camera/stream".into()).kind(),
      SourceKind::Rtsp
    );
  }
}
