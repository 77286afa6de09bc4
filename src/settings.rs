// 该文件是 Tanjing （探镜） 项目的一部分。
// src/settings.rs - 项目设置
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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::TaskKind;

#[derive(Error, Debug)]
pub enum SettingsError {
  #[error("无法读取设置文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("设置文件格式错误 {path}: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
}

/// 外部工具路径
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
  pub ffmpeg: PathBuf,
  pub ffprobe: PathBuf,
  pub yt_dlp: PathBuf,
}

impl Default for ToolPaths {
  fn default() -> Self {
    Self {
      ffmpeg: PathBuf::from("ffmpeg"),
      ffprobe: PathBuf::from("ffprobe"),
      yt_dlp: PathBuf::from("yt-dlp"),
    }
  }
}

/// 项目设置：模型路径、默认图片、视频目录等
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// 检测模型（ONNX）
  pub detection_model: PathBuf,
  /// 分割模型（ONNX）
  pub segmentation_model: PathBuf,
  /// 默认图片
  pub default_image: PathBuf,
  /// 默认图片对应的预先标注结果
  pub default_detect_image: PathBuf,
  /// 视频目录：名称 -> 路径
  pub videos: BTreeMap<String, PathBuf>,
  /// 默认摄像头设备
  pub webcam: String,
  /// 标签文件，每行一个类别名；为空时使用内置 COCO 标签
  pub labels: Option<PathBuf>,
  /// 标签文字使用的字体文件；为空时只画框
  pub font: Option<PathBuf>,
  /// NMS IoU 阈值
  pub iou_threshold: f32,
  /// 模型输入边长
  pub input_size: u32,
  pub tools: ToolPaths,
}

impl Default for Settings {
  fn default() -> Self {
    let videos = (1..=3)
      .map(|i| {
        (
          format!("video_{}", i),
          PathBuf::from(format!("videos/video_{}.mp4", i)),
        )
      })
      .collect();

    Self {
      detection_model: PathBuf::from("weights/yolov8n.onnx"),
      segmentation_model: PathBuf::from("weights/yolov8n-seg.onnx"),
      default_image: PathBuf::from("images/office_4.jpg"),
      default_detect_image: PathBuf::from("images/office_4_detected.jpg"),
      videos,
      webcam: String::from("/dev/video0"),
      labels: None,
      font: None,
      iou_threshold: 0.7,
      input_size: 640,
      tools: ToolPaths::default(),
    }
  }
}

impl Settings {
  /// 从 JSON 文件加载设置，未给出的字段使用默认值
  pub fn load(path: &Path) -> Result<Self, SettingsError> {
    info!("加载设置文件: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let settings: Settings = serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    debug!("设置: {:?}", settings);
    Ok(settings)
  }

  /// 有文件则加载，否则使用默认设置
  pub fn load_or_default(path: Option<&Path>) -> Result<Self, SettingsError> {
    match path {
      Some(path) => Self::load(path),
      None => Ok(Self::default()),
    }
  }

  pub fn model_path(&self, task: TaskKind) -> &Path {
    match task {
      TaskKind::Detection => &self.detection_model,
      TaskKind::Segmentation => &self.segmentation_model,
    }
  }

  pub fn video_path(&self, name: &str) -> Option<&Path> {
    self.videos.get(name).map(PathBuf::as_path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_file_keeps_defaults() {
    let dir = std::env::temp_dir().join(format!("tanjing-settings-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("settings.json");
    std::fs::write(
      &path,
      r#"{ "detection_model": "m/det.onnx", "videos": { "street": "v/street.mp4" } }"#,
    )
    .unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.detection_model, PathBuf::from("m/det.onnx"));
    assert_eq!(settings.segmentation_model, Settings::default().segmentation_model);
    assert_eq!(settings.video_path("street"), Some(Path::new("v/street.mp4")));
    assert_eq!(settings.video_path("video_1"), None);
    assert_eq!(settings.tools, ToolPaths::default());

    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn malformed_file_is_an_error() {
    let dir = std::env::temp_dir().join(format!("tanjing-settings-bad-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(Settings::load(&path), Err(SettingsError::Parse { .. })));
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn model_path_follows_task() {
    let settings = Settings::default();
    assert_eq!(
      settings.model_path(TaskKind::Segmentation),
      Path::new("weights/yolov8n-seg.onnx")
    );
    assert_eq!(
      settings.model_path(TaskKind::Detection),
      Path::new("weights/yolov8n.onnx")
    );
  }
}
