// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/directory_record.rs - 按日期目录逐帧记录
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

//! `folder:///dir` 把每帧保存为 `dir/YYYY/MM/DD/HH-MM-SS-XXXX.png`。
//!
//! - `?record` 或 `?record=name`：保存未标注的原图，旁边写一份 `.txt` 记录，每行
//!   `标签, 置信度, x1, y1, x2, y2`
//! - `?record=id`：同上，但记录类别编号
//! - `?always`：没有检测结果的帧也保存

use std::path::{Path, PathBuf};

use chrono::{Datelike, Local};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  inference::AnnotatedFrame,
  model::DetectResult,
  output::{OutputError, Render},
  url_file_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 检测结果的文本记录
#[derive(Debug, Clone, Copy)]
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn lines(&self, result: &DetectResult) -> Vec<String> {
    result
      .iter()
      .map(|item| {
        let name = if self.label_with_name {
          item.label.clone()
        } else {
          item.class_id.to_string()
        };
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          name, item.score, item.bbox[0], item.bbox[1], item.bbox[2], item.bbox[3]
        )
      })
      .collect()
  }

  pub fn record(&self, result: &DetectResult, path: &Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.lines(result).join("\n"))
  }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
  Draw,
  Record(Record),
}

#[derive(Debug)]
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  mode: Mode,
  frame_counter: u16,
  always: bool,
  saved: u64,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let mode = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| {
        Mode::Record(Record {
          label_with_name: v != "id",
        })
      })
      .unwrap_or(Mode::Draw);
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_file_path(uri)),
      mode,
      frame_counter: 0,
      always,
      saved: 0,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      mode: Mode::Draw,
      frame_counter: 0,
      always: false,
      saved: 0,
    }
  }

  pub fn with_record(mut self, record: Option<Record>) -> Self {
    self.mode = record.map(Mode::Record).unwrap_or(Mode::Draw);
    self
  }

  pub fn with_always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  fn frame_path(&mut self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let filename = format!("{}-{:04X}.png", now.format("%H-%M-%S"), self.frame_id());
    Ok(directory.join(filename))
  }

  fn save(&mut self, frame: &AnnotatedFrame) -> Result<(), DirectoryRecordOutputError> {
    if !self.always && frame.result.is_empty() {
      return Ok(());
    }

    let path = self.frame_path()?;
    match self.mode {
      Mode::Draw => frame.display().save(&path)?,
      Mode::Record(record) => {
        frame.source.save(&path)?;
        record.record(&frame.result, &path)?;
      }
    }
    self.saved += 1;
    debug!("记录第 {} 帧: {}", frame.index, path.display());
    Ok(())
  }
}

impl Render for DirectoryRecordOutput {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    Ok(self.save(frame)?)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    info!("共记录 {} 帧到 {}", self.saved, self.directory.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{frame::Frame, model::DetectItem};
  use image::RgbImage;

  fn frame_with(items: Vec<DetectItem>) -> AnnotatedFrame {
    let mut frame = AnnotatedFrame::passthrough(Frame::new(RgbImage::new(8, 8), 0, 0));
    frame.result = DetectResult::new(items);
    frame
  }

  fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
      for entry in std::fs::read_dir(&dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          pending.push(path);
        } else {
          files.push(path);
        }
      }
    }
    files.sort();
    files
  }

  #[test]
  fn record_lines() {
    let result = DetectResult::new(vec![DetectItem::new(
      2,
      "car",
      0.5,
      [1.0, 2.0, 3.0, 4.0],
    )]);
    let by_name = Record { label_with_name: true };
    let by_id = Record { label_with_name: false };
    assert_eq!(
      by_name.lines(&result),
      vec!["car, 0.5000, 1.0000, 2.0000, 3.0000, 4.0000"]
    );
    assert_eq!(
      by_id.lines(&result),
      vec!["2, 0.5000, 1.0000, 2.0000, 3.0000, 4.0000"]
    );
  }

  #[test]
  fn query_selects_mode() {
    let url = url::Url::parse("folder:///tmp/rec?record=id&always").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert!(output.always);
    assert!(matches!(
      output.mode,
      Mode::Record(Record {
        label_with_name: false
      })
    ));

    let url = url::Url::parse("folder:///tmp/rec").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert!(!output.always);
    assert!(matches!(output.mode, Mode::Draw));
  }

  #[test]
  fn empty_frames_are_skipped_unless_always() {
    let dir = std::env::temp_dir().join(format!("tanjing-folder-{}", std::process::id()));
    let mut output = DirectoryRecordOutput::new(&dir).with_record(Some(Record {
      label_with_name: true,
    }));

    output.render(&frame_with(Vec::new())).unwrap();
    output
      .render(&frame_with(vec![DetectItem::new(
        0,
        "person",
        0.9,
        [0.0, 0.0, 4.0, 4.0],
      )]))
      .unwrap();
    output.finish().unwrap();

    let files = files_under(&dir);
    assert_eq!(files.len(), 2);
    assert!(files.iter().any(|f| f.extension().is_some_and(|e| e == "png")));
    assert!(files.iter().any(|f| f.extension().is_some_and(|e| e == "txt")));

    let always_dir = dir.join("always");
    let mut always = DirectoryRecordOutput::new(&always_dir).with_always(true);
    always.render(&frame_with(Vec::new())).unwrap();
    assert_eq!(files_under(&always_dir).len(), 1);

    std::fs::remove_dir_all(&dir).ok();
  }
}
