// 该文件是 Tanjing （探镜） 项目的一部分。
// src/track.rs - 多目标跟踪
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

use crate::model::DetectResult;

mod bytetrack;
mod kalman;

pub use self::bytetrack::{ByteTracker, TrackerParams};
pub use self::kalman::{BoxEncoding, KalmanFilter};

/// 跨帧维持目标身份。
///
/// 每次播放会话创建一个新的跟踪器，会话内的每帧检测结果依次交给
/// [`Tracker::update`]，已确认轨迹的 ID 写回 `DetectItem::track_id`。
pub trait Tracker {
  fn update(&mut self, result: &mut DetectResult);
  /// 当前已确认且处于跟踪状态的轨迹数
  fn active_tracks(&self) -> usize;
  fn reset(&mut self);
}

impl<T: Tracker + ?Sized> Tracker for Box<T> {
  fn update(&mut self, result: &mut DetectResult) {
    (**self).update(result)
  }

  fn active_tracks(&self) -> usize {
    (**self).active_tracks()
  }

  fn reset(&mut self) {
    (**self).reset()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
  ByteTrack,
  BotSort,
}

impl fmt::Display for TrackerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TrackerKind::ByteTrack => write!(f, "bytetrack"),
      TrackerKind::BotSort => write!(f, "botsort"),
    }
  }
}

pub fn create_tracker(kind: TrackerKind) -> Box<dyn Tracker + Send> {
  Box::new(ByteTracker::new(kind))
}
