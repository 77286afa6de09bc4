// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

/// 防止除零
const EPS: f32 = 1.0e-7;

/// 两个 `[x_min, y_min, x_max, y_max]` 框的交并比
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let overlap = [
    a[0].max(b[0]),
    a[1].max(b[1]),
    a[2].min(b[2]),
    a[3].min(b[3]),
  ];
  let overlap_area = area(&overlap);
  overlap_area / (area(a) + area(b) - overlap_area + EPS)
}

fn area(bbox: &[f32; 4]) -> f32 {
  let width = bbox[2] - bbox[0];
  let height = bbox[3] - bbox[1];
  if width < 0.0 || height < 0.0 {
    return 0.0;
  }
  width * height
}

/// 按类别做贪心 NMS。
///
/// 候选框按置信度从高到低处理，同类别中与已保留框 IoU 超过 `iou_threshold`
/// 的候选被丢弃，最多保留 `max_det` 个。`key` 取出 (类别, 置信度, 框)。
pub fn non_max_suppression<T, F>(
  mut candidates: Vec<T>,
  iou_threshold: f32,
  max_det: usize,
  key: F,
) -> Vec<T>
where
  F: Fn(&T) -> (u32, f32, [f32; 4]),
{
  candidates.sort_by(|a, b| {
    let (_, sa, _) = key(a);
    let (_, sb, _) = key(b);
    sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
  });

  let mut selected: Vec<T> = Vec::new();
  'candidates: for candidate in candidates {
    if selected.len() >= max_det {
      break;
    }
    let (class_id, _, bbox) = key(&candidate);
    for kept in &selected {
      let (kept_class, _, kept_bbox) = key(kept);
      if kept_class == class_id && iou(&bbox, &kept_bbox) > iou_threshold {
        continue 'candidates;
      }
    }
    selected.push(candidate);
  }

  selected
}
