// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/results.rs - 检测结果明细
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

use std::io::Write;

use serde::Serialize;

use crate::{
  inference::AnnotatedFrame,
  model::DetectItem,
  output::{OutputError, Render},
};

/// 还没有处理过任何图片时的提示
pub const NOTHING_TO_SHOW: &str = "还没有处理任何图片！";

/// 一条检测记录，JSON 行输出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord<'a> {
  pub frame: u64,
  pub class_id: u32,
  pub label: &'a str,
  pub confidence: f32,
  pub xyxy: [f32; 4],
  #[serde(skip_serializing_if = "Option::is_none")]
  pub track_id: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mask_area: Option<u64>,
}

impl<'a> DetectionRecord<'a> {
  pub fn new(frame: u64, item: &'a DetectItem) -> Self {
    Self {
      frame,
      class_id: item.class_id,
      label: &item.label,
      confidence: item.score,
      xyxy: item.bbox,
      track_id: item.track_id,
      mask_area: item.mask_area(),
    }
  }
}

/// 检测结果面板：逐条写出推理得到的检测，预览帧不记录
pub struct ResultsPanel<W> {
  writer: W,
  frames: u64,
  records: u64,
}

impl ResultsPanel<std::io::Stdout> {
  pub fn stdout() -> Self {
    Self::new(std::io::stdout())
  }
}

impl<W: Write> ResultsPanel<W> {
  pub fn new(writer: W) -> Self {
    Self {
      writer,
      frames: 0,
      records: 0,
    }
  }

  pub fn records(&self) -> u64 {
    self.records
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: Write> Render for ResultsPanel<W> {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    if !frame.inferred {
      return Ok(());
    }
    self.frames += 1;
    for item in frame.result.iter() {
      serde_json::to_writer(&mut self.writer, &DetectionRecord::new(frame.index, item))?;
      writeln!(self.writer)?;
      self.records += 1;
    }
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    if self.frames == 0 {
      writeln!(self.writer, "{}", NOTHING_TO_SHOW)?;
    }
    self.writer.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{frame::Frame, model::DetectResult};
  use image::RgbImage;

  #[test]
  fn inferred_detections_are_written_as_json_lines() {
    let mut frame = AnnotatedFrame::passthrough(Frame::new(RgbImage::new(4, 4), 3, 0));
    frame.inferred = true;
    let mut tracked = DetectItem::new(0, "person", 0.75, [1.0, 2.0, 3.0, 4.0]);
    tracked.track_id = Some(5);
    frame.result = DetectResult::new(vec![
      tracked,
      DetectItem::new(2, "car", 0.5, [0.0, 0.0, 1.0, 1.0]),
    ]);

    let mut panel = ResultsPanel::new(Vec::new());
    panel.render(&frame).unwrap();
    panel.finish().unwrap();
    assert_eq!(panel.records(), 2);

    let text = String::from_utf8(panel.into_inner()).unwrap();
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["frame"], 3);
    assert_eq!(first["label"], "person");
    assert_eq!(first["track_id"], 5);
    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert!(second.get("track_id").is_none());
  }

  #[test]
  fn nothing_to_show_before_any_inference() {
    let preview = AnnotatedFrame::passthrough(Frame::new(RgbImage::new(4, 4), 0, 0));
    let mut panel = ResultsPanel::new(Vec::new());
    panel.render(&preview).unwrap();
    panel.finish().unwrap();
    assert_eq!(panel.records(), 0);
    let text = String::from_utf8(panel.into_inner()).unwrap();
    assert_eq!(text.trim(), NOTHING_TO_SHOW);
  }
}
