// 该文件是 Tanjing （探镜） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的模拟模型、输入源与输出
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

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{
  Arc,
  atomic::{AtomicBool, AtomicUsize, Ordering},
};

use image::{Rgb, RgbImage};

use tanjing::{
  config::{SourceKind, TaskKind},
  dispatch::{ModelLoader, SourceOpener},
  frame::{DISPLAY_HEIGHT, DISPLAY_WIDTH, Frame},
  inference::{AnnotatedFrame, DynModel},
  input::{BoxedSource, FrameSource, SourceDescriptor, SourceError},
  model::{DetectItem, DetectResult, InferOptions, Model, ModelError},
  output::{OutputError, Render},
};

/// 每次调用按固定步长平移同一组检测框
pub struct ScriptedModel {
  items: Vec<DetectItem>,
  step: f32,
  calls: Cell<usize>,
}

impl ScriptedModel {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self {
      items,
      step: 0.0,
      calls: Cell::new(0),
    }
  }

  pub fn moving(mut self, step: f32) -> Self {
    self.step = step;
    self
  }
}

impl Model for ScriptedModel {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn task(&self) -> TaskKind {
    TaskKind::Detection
  }

  fn infer(&self, _input: &RgbImage, _options: &InferOptions) -> Result<DetectResult, ModelError> {
    let offset = self.calls.get() as f32 * self.step;
    self.calls.set(self.calls.get() + 1);
    let items = self
      .items
      .iter()
      .cloned()
      .map(|mut item| {
        item.bbox[0] += offset;
        item.bbox[2] += offset;
        item
      })
      .collect();
    Ok(DetectResult::new(items))
  }
}

/// 记录加载次数，每次加载都返回新的脚本模型
pub struct ScriptedLoader {
  items: Vec<DetectItem>,
  step: f32,
  pub loads: AtomicUsize,
}

impl ScriptedLoader {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self {
      items,
      step: 0.0,
      loads: AtomicUsize::new(0),
    }
  }

  pub fn moving(mut self, step: f32) -> Self {
    self.step = step;
    self
  }

  pub fn loads(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }
}

impl ModelLoader for ScriptedLoader {
  fn load(&self, _task: TaskKind, _path: &Path) -> Result<Box<DynModel>, ModelError> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(
      ScriptedModel::new(self.items.clone()).moving(self.step),
    ))
  }
}

/// 内存中的帧序列，可以在指定位置注入读取失败
pub struct VecSource {
  frames: VecDeque<RgbImage>,
  fail_after: Option<usize>,
  index: u64,
  open: bool,
  released: Arc<AtomicBool>,
}

impl VecSource {
  pub fn new(count: usize) -> Self {
    let frames = (0..count)
      .map(|i| RgbImage::from_pixel(DISPLAY_WIDTH, DISPLAY_HEIGHT, Rgb([(i * 40 % 256) as u8, 0, 0])))
      .collect();
    Self {
      frames,
      fail_after: None,
      index: 0,
      open: true,
      released: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn failing_after(mut self, frames: usize) -> Self {
    self.fail_after = Some(frames);
    self
  }

  pub fn released_flag(&self) -> Arc<AtomicBool> {
    self.released.clone()
  }
}

impl FrameSource for VecSource {
  fn read(&mut self) -> Result<Option<Frame>, SourceError> {
    if !self.open {
      return Ok(None);
    }
    if self.fail_after == Some(self.index as usize) {
      self.close();
      return Err(SourceError::ReadFailure("连接中断".into()));
    }
    match self.frames.pop_front() {
      Some(image) => {
        let frame = Frame::new(image, self.index, self.index * 40);
        self.index += 1;
        Ok(Some(frame))
      }
      None => {
        self.close();
        Ok(None)
      }
    }
  }

  fn close(&mut self) {
    self.open = false;
    self.released.store(true, Ordering::SeqCst);
  }

  fn is_open(&self) -> bool {
    self.open
  }

  fn kind(&self) -> SourceKind {
    SourceKind::Video
  }

  fn width(&self) -> u32 {
    DISPLAY_WIDTH
  }

  fn height(&self) -> u32 {
    DISPLAY_HEIGHT
  }

  fn fps(&self) -> Option<f64> {
    Some(25.0)
  }
}

/// 每次打开都给出一个新的 `VecSource`，并记录打开次数与释放情况
pub struct VecOpener {
  frames: usize,
  fail_after: Option<usize>,
  pub opens: AtomicUsize,
  pub released: std::sync::Mutex<Vec<Arc<AtomicBool>>>,
}

impl VecOpener {
  pub fn new(frames: usize) -> Self {
    Self {
      frames,
      fail_after: None,
      opens: AtomicUsize::new(0),
      released: std::sync::Mutex::new(Vec::new()),
    }
  }

  pub fn failing_after(mut self, frames: usize) -> Self {
    self.fail_after = Some(frames);
    self
  }

  pub fn opens(&self) -> usize {
    self.opens.load(Ordering::SeqCst)
  }

  pub fn all_released(&self) -> bool {
    self
      .released
      .lock()
      .unwrap()
      .iter()
      .all(|flag| flag.load(Ordering::SeqCst))
  }
}

impl SourceOpener for VecOpener {
  fn open(&self, _descriptor: &SourceDescriptor) -> Result<BoxedSource, SourceError> {
    self.opens.fetch_add(1, Ordering::SeqCst);
    let mut source = VecSource::new(self.frames);
    if let Some(n) = self.fail_after {
      source = source.failing_after(n);
    }
    self.released.lock().unwrap().push(source.released_flag());
    Ok(Box::new(source))
  }
}

/// 记录每一帧渲染结果
#[derive(Default)]
pub struct Recorder {
  pub frames: Vec<AnnotatedFrame>,
  pub finished: usize,
}

impl Recorder {
  pub fn track_ids(&self) -> Vec<Vec<Option<u64>>> {
    self
      .frames
      .iter()
      .map(|frame| frame.result.iter().map(|item| item.track_id).collect())
      .collect()
  }
}

impl Render for Recorder {
  fn render(&mut self, frame: &AnnotatedFrame) -> Result<(), OutputError> {
    self.frames.push(frame.clone());
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.finished += 1;
    Ok(())
  }
}

pub fn person(score: f32, bbox: [f32; 4]) -> DetectItem {
  DetectItem::new(0, "person", score, bbox)
}

pub fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("tanjing-{}-{}", name, std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  dir
}
