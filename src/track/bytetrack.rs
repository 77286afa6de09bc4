// 该文件是 Tanjing （探镜） 项目的一部分。
// src/track/bytetrack.rs - ByteTrack / BoT-SORT 多目标跟踪
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

//! 两阶段关联：
//! 1. 高分检测框与已跟踪、已丢失轨迹匹配（IoU 融合置信度）
//! 2. 低分检测框救援第一阶段未匹配的已跟踪轨迹
//! 3. 剩余高分框与未确认轨迹匹配，否则新建轨迹

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::{
  model::{DetectResult, iou},
  track::{
    Tracker, TrackerKind,
    kalman::{BoxEncoding, Covariance, KalmanFilter, State},
  },
};

/// 跟踪器参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerParams {
  /// 第一阶段关联的分数阈值
  pub high_threshold: f32,
  /// 低于该分数的检测框完全忽略
  pub low_threshold: f32,
  /// 新建轨迹需要的最低分数
  pub new_track_threshold: f32,
  /// 第一阶段与未确认轨迹的代价上限
  pub match_threshold: f32,
  /// 第二阶段的代价上限
  pub second_match_threshold: f32,
  /// 未确认轨迹的代价上限
  pub unconfirmed_match_threshold: f32,
  /// 丢失多少帧后删除轨迹
  pub max_time_lost: u64,
  /// 第一阶段代价是否融合检测分数
  pub fuse_score: bool,
}

impl Default for TrackerParams {
  fn default() -> Self {
    Self {
      high_threshold: 0.25,
      low_threshold: 0.1,
      new_track_threshold: 0.25,
      match_threshold: 0.8,
      second_match_threshold: 0.5,
      unconfirmed_match_threshold: 0.7,
      max_time_lost: 30,
      fuse_score: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
  Tracked,
  Lost,
}

#[derive(Debug, Clone)]
struct Detection {
  index: usize,
  bbox: [f32; 4],
  score: f32,
}

#[derive(Debug, Clone)]
struct STrack {
  track_id: u64,
  mean: State,
  covariance: Covariance,
  state: TrackState,
  is_activated: bool,
  /// 最近一次被观测到的帧
  frame_id: u64,
  start_frame: u64,
  /// 本帧关联到的检测序号
  det_index: Option<usize>,
}

impl STrack {
  fn activate(kalman: &KalmanFilter, det: &Detection, track_id: u64, frame_id: u64) -> Self {
    let (mean, covariance) = kalman.initiate(&det.bbox);
    Self {
      track_id,
      mean,
      covariance,
      state: TrackState::Tracked,
      // 第一帧的轨迹直接确认
      is_activated: frame_id == 1,
      frame_id,
      start_frame: frame_id,
      det_index: Some(det.index),
    }
  }

  fn predict(&mut self, kalman: &KalmanFilter) {
    if self.state != TrackState::Tracked {
      kalman.freeze_scale(&mut self.mean);
    }
    kalman.predict(&mut self.mean, &mut self.covariance);
  }

  /// 用观测校正轨迹；已丢失的轨迹由此重新找回
  fn update(&mut self, kalman: &KalmanFilter, det: &Detection, frame_id: u64) {
    kalman.update(&mut self.mean, &mut self.covariance, &det.bbox);
    self.state = TrackState::Tracked;
    self.is_activated = true;
    self.frame_id = frame_id;
    self.det_index = Some(det.index);
  }

  fn mark_lost(&mut self) {
    self.state = TrackState::Lost;
    self.det_index = None;
  }

  fn bbox(&self, encoding: BoxEncoding) -> [f32; 4] {
    encoding.decode(&self.mean)
  }

  fn age(&self) -> u64 {
    self.frame_id - self.start_frame
  }
}

/// 贪心匹配结果：每条轨迹对应的检测序号，以及每个检测是否被匹配
struct Assignment {
  track_to_det: Vec<Option<usize>>,
  det_matched: Vec<bool>,
}

/// 按代价从小到大贪心匹配，代价超过 `threshold` 的组合不匹配
fn greedy_assignment(costs: &[Vec<f32>], num_dets: usize, threshold: f32) -> Assignment {
  let mut pairs = Vec::new();
  for (t, row) in costs.iter().enumerate() {
    for (d, cost) in row.iter().enumerate() {
      if *cost <= threshold {
        pairs.push((*cost, t, d));
      }
    }
  }
  pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

  let mut track_to_det = vec![None; costs.len()];
  let mut det_matched = vec![false; num_dets];
  for (_, t, d) in pairs {
    if track_to_det[t].is_none() && !det_matched[d] {
      track_to_det[t] = Some(d);
      det_matched[d] = true;
    }
  }

  Assignment {
    track_to_det,
    det_matched,
  }
}

/// ByteTrack 跟踪器；以 xywh 编码的卡尔曼滤波运行时即为不带相机运动补偿与
/// 外观特征的 BoT-SORT
pub struct ByteTracker {
  params: TrackerParams,
  kalman: KalmanFilter,
  tracked: Vec<STrack>,
  lost: Vec<STrack>,
  frame_id: u64,
  next_id: u64,
}

impl ByteTracker {
  pub fn new(kind: TrackerKind) -> Self {
    Self::with_params(kind, TrackerParams::default())
  }

  pub fn with_params(kind: TrackerKind, params: TrackerParams) -> Self {
    let encoding = match kind {
      TrackerKind::ByteTrack => BoxEncoding::Xyah,
      TrackerKind::BotSort => BoxEncoding::Xywh,
    };
    Self {
      params,
      kalman: KalmanFilter::new(encoding),
      tracked: Vec::new(),
      lost: Vec::new(),
      frame_id: 0,
      next_id: 1,
    }
  }

  fn next_id(&mut self) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  fn costs(&self, tracks: &[STrack], dets: &[Detection], fuse_score: bool) -> Vec<Vec<f32>> {
    let encoding = self.kalman.encoding();
    tracks
      .iter()
      .map(|track| {
        let bbox = track.bbox(encoding);
        dets
          .iter()
          .map(|det| {
            let similarity = iou(&bbox, &det.bbox);
            if fuse_score {
              1.0 - similarity * det.score
            } else {
              1.0 - similarity
            }
          })
          .collect()
      })
      .collect()
  }

  // 已跟踪与已丢失轨迹高度重叠时，保留存在时间更长的一条
  fn remove_duplicates(&mut self) {
    let encoding = self.kalman.encoding();
    let mut drop_tracked = vec![false; self.tracked.len()];
    let mut drop_lost = vec![false; self.lost.len()];
    for (p, tracked) in self.tracked.iter().enumerate() {
      for (q, lost) in self.lost.iter().enumerate() {
        if 1.0 - iou(&tracked.bbox(encoding), &lost.bbox(encoding)) < 0.15 {
          if tracked.age() > lost.age() {
            drop_lost[q] = true;
          } else {
            drop_tracked[p] = true;
          }
        }
      }
    }

    let mut flags = drop_tracked.into_iter();
    self.tracked.retain(|_| !flags.next().unwrap_or(false));
    let mut flags = drop_lost.into_iter();
    self.lost.retain(|_| !flags.next().unwrap_or(false));
  }
}

impl Tracker for ByteTracker {
  fn update(&mut self, result: &mut DetectResult) {
    self.frame_id += 1;
    let frame_id = self.frame_id;
    let params = self.params;

    let mut high = Vec::new();
    let mut low = Vec::new();
    for (index, item) in result.items.iter_mut().enumerate() {
      item.track_id = None;
      let det = Detection {
        index,
        bbox: item.bbox,
        score: item.score,
      };
      if item.score >= params.high_threshold {
        high.push(det);
      } else if item.score > params.low_threshold {
        low.push(det);
      }
    }

    let (confirmed, unconfirmed): (Vec<STrack>, Vec<STrack>) = std::mem::take(&mut self.tracked)
      .into_iter()
      .partition(|track| track.is_activated);
    let mut pool = confirmed;
    pool.extend(std::mem::take(&mut self.lost));
    for track in pool.iter_mut() {
      track.det_index = None;
      track.predict(&self.kalman);
    }

    let mut activated = Vec::new();
    let mut refound = Vec::new();
    let mut kept_lost = Vec::new();
    let mut newly_lost = Vec::new();

    // 第一阶段：高分框
    let costs = self.costs(&pool, &high, params.fuse_score);
    let first = greedy_assignment(&costs, high.len(), params.match_threshold);
    let mut remaining = Vec::new();
    for (mut track, det) in pool.into_iter().zip(first.track_to_det) {
      match det {
        Some(d) if track.state == TrackState::Tracked => {
          track.update(&self.kalman, &high[d], frame_id);
          activated.push(track);
        }
        Some(d) => {
          track.update(&self.kalman, &high[d], frame_id);
          refound.push(track);
        }
        None => remaining.push(track),
      }
    }
    let high_left = high
      .into_iter()
      .zip(first.det_matched)
      .filter(|(_, matched)| !matched)
      .map(|(det, _)| det)
      .collect::<Vec<_>>();

    // 第二阶段：低分框只救援仍处于跟踪状态的轨迹
    let (r_tracked, still_lost): (Vec<STrack>, Vec<STrack>) = remaining
      .into_iter()
      .partition(|track| track.state == TrackState::Tracked);
    kept_lost.extend(still_lost);
    let costs = self.costs(&r_tracked, &low, false);
    let second = greedy_assignment(&costs, low.len(), params.second_match_threshold);
    for (mut track, det) in r_tracked.into_iter().zip(second.track_to_det) {
      match det {
        Some(d) => {
          track.update(&self.kalman, &low[d], frame_id);
          activated.push(track);
        }
        None => {
          track.mark_lost();
          newly_lost.push(track);
        }
      }
    }

    // 第三阶段：未确认轨迹只有一次机会
    let costs = self.costs(&unconfirmed, &high_left, params.fuse_score);
    let third = greedy_assignment(&costs, high_left.len(), params.unconfirmed_match_threshold);
    let mut removed = 0usize;
    for (mut track, det) in unconfirmed.into_iter().zip(third.track_to_det) {
      match det {
        Some(d) => {
          track.update(&self.kalman, &high_left[d], frame_id);
          activated.push(track);
        }
        None => removed += 1,
      }
    }

    for (det, matched) in high_left.iter().zip(third.det_matched) {
      if matched || det.score < params.new_track_threshold {
        continue;
      }
      let track_id = self.next_id();
      trace!("新建轨迹 {} (第 {} 帧)", track_id, frame_id);
      activated.push(STrack::activate(&self.kalman, det, track_id, frame_id));
    }

    let before = kept_lost.len();
    kept_lost.retain(|track| frame_id - track.frame_id <= params.max_time_lost);
    removed += before - kept_lost.len();

    self.tracked = activated;
    self.tracked.extend(refound);
    self.lost = kept_lost;
    self.lost.extend(newly_lost);
    self.remove_duplicates();

    for track in self.tracked.iter().filter(|track| track.is_activated) {
      if let Some(item) = track.det_index.and_then(|index| result.items.get_mut(index)) {
        item.track_id = Some(track.track_id);
      }
    }

    debug!(
      "第 {} 帧跟踪: {} 条跟踪中, {} 条丢失, {} 条删除",
      frame_id,
      self.tracked.len(),
      self.lost.len(),
      removed
    );
  }

  fn active_tracks(&self) -> usize {
    self
      .tracked
      .iter()
      .filter(|track| track.is_activated)
      .count()
  }

  fn reset(&mut self) {
    self.tracked.clear();
    self.lost.clear();
    self.frame_id = 0;
    self.next_id = 1;
  }
}
