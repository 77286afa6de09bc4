// 该文件是 Tanjing （探镜） 项目的一部分。
// src/track/kalman.rs - 匀速卡尔曼滤波
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

use nalgebra::{SMatrix, SVector};

/// 状态向量：4 维观测 + 4 维速度
pub type State = SVector<f32, 8>;
pub type Covariance = SMatrix<f32, 8, 8>;
type Measurement = SVector<f32, 4>;

const EPSILON: f32 = 1.0e-5;

/// 观测空间中框的编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxEncoding {
  /// 中心点、宽高比、高
  Xyah,
  /// 中心点、宽、高
  Xywh,
}

impl BoxEncoding {
  pub fn encode(self, bbox: &[f32; 4]) -> [f32; 4] {
    let w = (bbox[2] - bbox[0]).max(EPSILON);
    let h = (bbox[3] - bbox[1]).max(EPSILON);
    let cx = (bbox[0] + bbox[2]) / 2.0;
    let cy = (bbox[1] + bbox[3]) / 2.0;
    match self {
      BoxEncoding::Xyah => [cx, cy, w / h, h],
      BoxEncoding::Xywh => [cx, cy, w, h],
    }
  }

  pub fn decode(self, state: &State) -> [f32; 4] {
    let (cx, cy) = (state[0], state[1]);
    let (w, h) = match self {
      BoxEncoding::Xyah => (state[2] * state[3], state[3]),
      BoxEncoding::Xywh => (state[2], state[3]),
    };
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
  }

  /// 停止更新时需要归零的速度分量
  fn frozen_velocity(self) -> &'static [usize] {
    match self {
      BoxEncoding::Xyah => &[7],
      BoxEncoding::Xywh => &[6, 7],
    }
  }
}

/// 图像空间中的匀速模型，状态为 `[观测, 观测速度]`
#[derive(Debug, Clone)]
pub struct KalmanFilter {
  encoding: BoxEncoding,
  motion: Covariance,
  observation: SMatrix<f32, 4, 8>,
  std_weight_position: f32,
  std_weight_velocity: f32,
}

impl KalmanFilter {
  pub fn new(encoding: BoxEncoding) -> Self {
    let mut motion = Covariance::identity();
    for i in 0..4 {
      motion[(i, 4 + i)] = 1.0;
    }
    Self {
      encoding,
      motion,
      observation: SMatrix::<f32, 4, 8>::identity(),
      std_weight_position: 1.0 / 20.0,
      std_weight_velocity: 1.0 / 160.0,
    }
  }

  pub fn encoding(&self) -> BoxEncoding {
    self.encoding
  }

  // 位置噪声的尺度：xyah 以高为基准（宽高比用常数），xywh 以各自的宽高为基准
  fn position_std(&self, state: &[f32], aspect: f32) -> [f32; 4] {
    let p = self.std_weight_position;
    match self.encoding {
      BoxEncoding::Xyah => [p * state[3], p * state[3], aspect, p * state[3]],
      BoxEncoding::Xywh => [
        p * state[2],
        p * state[3],
        p * state[2],
        p * state[3],
      ],
    }
  }

  fn velocity_std(&self, state: &[f32], aspect: f32) -> [f32; 4] {
    let v = self.std_weight_velocity;
    match self.encoding {
      BoxEncoding::Xyah => [v * state[3], v * state[3], aspect, v * state[3]],
      BoxEncoding::Xywh => [
        v * state[2],
        v * state[3],
        v * state[2],
        v * state[3],
      ],
    }
  }

  /// 由一次观测建立新轨迹的状态
  pub fn initiate(&self, bbox: &[f32; 4]) -> (State, Covariance) {
    let measurement = self.encoding.encode(bbox);
    let mut mean = State::zeros();
    for (i, value) in measurement.iter().enumerate() {
      mean[i] = *value;
    }

    let position = self.position_std(&measurement, 1.0e-2);
    let velocity = self.velocity_std(&measurement, 1.0e-5);
    let mut std = [0.0f32; 8];
    for i in 0..4 {
      std[i] = 2.0 * position[i];
      std[4 + i] = 10.0 * velocity[i];
    }
    // 宽高比维度保持常数噪声
    if self.encoding == BoxEncoding::Xyah {
      std[2] = 1.0e-2;
      std[6] = 1.0e-5;
    }

    (mean, diagonal_squared(&std))
  }

  pub fn predict(&self, mean: &mut State, covariance: &mut Covariance) {
    let state = mean.as_slice().to_vec();
    let position = self.position_std(&state, 1.0e-2);
    let velocity = self.velocity_std(&state, 1.0e-5);
    let mut std = [0.0f32; 8];
    std[..4].copy_from_slice(&position);
    std[4..].copy_from_slice(&velocity);
    let process_noise = diagonal_squared(&std);

    *mean = self.motion * *mean;
    *covariance = self.motion * *covariance * self.motion.transpose() + process_noise;
  }

  /// 冻结未被跟踪轨迹的尺度速度
  pub fn freeze_scale(&self, mean: &mut State) {
    for index in self.encoding.frozen_velocity() {
      mean[*index] = 0.0;
    }
  }

  fn project(&self, mean: &State, covariance: &Covariance) -> (Measurement, SMatrix<f32, 4, 4>) {
    let position = self.position_std(mean.as_slice(), 1.0e-1);
    let mut noise = SMatrix::<f32, 4, 4>::zeros();
    for i in 0..4 {
      noise[(i, i)] = position[i] * position[i];
    }

    let projected_mean = self.observation * mean;
    let projected_cov = self.observation * covariance * self.observation.transpose() + noise;
    (projected_mean, projected_cov)
  }

  /// 用观测校正状态；协方差奇异时保持原状
  pub fn update(&self, mean: &mut State, covariance: &mut Covariance, bbox: &[f32; 4]) {
    let (projected_mean, projected_cov) = self.project(mean, covariance);
    let measurement = Measurement::from(self.encoding.encode(bbox));

    let cross = self.observation * *covariance; // 4x8
    let gain_t = match projected_cov.cholesky() {
      Some(cholesky) => cholesky.solve(&cross),
      None => match projected_cov.try_inverse() {
        Some(inverse) => inverse * cross,
        None => return,
      },
    };
    let gain = gain_t.transpose(); // 8x4

    let innovation = measurement - projected_mean;
    *mean += gain * innovation;
    *covariance -= gain * projected_cov * gain.transpose();
  }
}

fn diagonal_squared(std: &[f32; 8]) -> Covariance {
  let mut matrix = Covariance::zeros();
  for (i, value) in std.iter().enumerate() {
    matrix[(i, i)] = value * value;
  }
  matrix
}

#[cfg(test)]
mod tests {
  use super::*;

  fn close(a: &[f32; 4], b: &[f32; 4], tol: f32) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() < tol)
  }

  #[test]
  fn encode_decode_matches_for_both_encodings() {
    let bbox = [10.0, 20.0, 50.0, 100.0];
    for encoding in [BoxEncoding::Xyah, BoxEncoding::Xywh] {
      let kf = KalmanFilter::new(encoding);
      let (mean, _) = kf.initiate(&bbox);
      assert!(close(&encoding.decode(&mean), &bbox, 1e-3));
    }
  }

  #[test]
  fn predict_without_velocity_keeps_position() {
    let kf = KalmanFilter::new(BoxEncoding::Xyah);
    let bbox = [0.0, 0.0, 40.0, 80.0];
    let (mut mean, mut cov) = kf.initiate(&bbox);
    let before = cov[(0, 0)];
    kf.predict(&mut mean, &mut cov);
    assert!(close(&BoxEncoding::Xyah.decode(&mean), &bbox, 1e-3));
    assert!(cov[(0, 0)] > before);
  }

  #[test]
  fn update_follows_a_moving_box() {
    let kf = KalmanFilter::new(BoxEncoding::Xywh);
    let (mut mean, mut cov) = kf.initiate(&[0.0, 0.0, 20.0, 20.0]);
    for step in 1..=5 {
      kf.predict(&mut mean, &mut cov);
      let x = step as f32 * 4.0;
      kf.update(&mut mean, &mut cov, &[x, 0.0, x + 20.0, 20.0]);
    }
    // 中心向右移动，速度为正
    assert!(mean[0] > 25.0);
    assert!(mean[4] > 0.0);
  }
}
