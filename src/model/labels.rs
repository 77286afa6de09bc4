// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/labels.rs - 类别标签
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

use std::path::Path;

// COCO 80 类别名称
const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 类别 ID 到名称的映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
  names: Vec<String>,
}

impl Default for Labels {
  fn default() -> Self {
    Self::coco()
  }
}

impl Labels {
  pub fn coco() -> Self {
    Self {
      names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
    }
  }

  /// 每行一个类别名，空行忽略
  pub fn from_file(path: &Path) -> std::io::Result<Self> {
    let text = std::fs::read_to_string(path)?;
    Ok(Self::from_lines(&text))
  }

  pub fn from_lines(text: &str) -> Self {
    Self {
      names: text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn name(&self, class_id: u32) -> String {
    self
      .names
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| format!("class_{}", class_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_has_80_classes() {
    let labels = Labels::coco();
    assert_eq!(labels.len(), 80);
    assert_eq!(labels.name(0), "person");
    assert_eq!(labels.name(79), "toothbrush");
  }

  #[test]
  fn unknown_id_gets_placeholder() {
    assert_eq!(Labels::from_lines("a\n\n b \n").name(5), "class_5");
    assert_eq!(Labels::from_lines("a\n\n b \n").name(1), "b");
  }
}
