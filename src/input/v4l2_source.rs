// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
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

use std::pin::Pin;
use std::time::Instant;

use image::RgbImage;
use tracing::{debug, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use crate::{
  config::SourceKind,
  frame::Frame,
  input::{FrameSource, SourceError},
};

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const CAPTURE_BUFFERS: u32 = 4;

/// V4L2 摄像头输入源
///
/// `Stream` 需要引用 `Device`，设备放在 `Pin<Box>` 里保证地址稳定，
/// 流总是先于设备释放。
pub struct V4l2Source {
  device_path: String,
  stream: Option<Stream<'static>>,
  device: Option<Pin<Box<Device>>>,
  frame_index: u64,
  width: u32,
  height: u32,
  started: Instant,
}

impl V4l2Source {
  pub fn open(device_path: &str) -> Result<Self, SourceError> {
    let unavailable = |e: std::io::Error| SourceError::unavailable(device_path, e);

    let device = Box::pin(Device::with_path(device_path).map_err(unavailable)?);

    let mut format = device.format().map_err(unavailable)?;
    format.width = CAPTURE_WIDTH;
    format.height = CAPTURE_HEIGHT;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format).map_err(unavailable)?;
    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(SourceError::unavailable(device_path, "设备不支持 YUYV 格式"));
    }
    debug!("摄像头格式: {}x{} {}", format.width, format.height, format.fourcc);

    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；stream 与 device
    // 存放在同一结构体中，close 时先释放 stream 再释放 device
    let device_ref: &Device = &device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, CAPTURE_BUFFERS)
        .map_err(unavailable)?
    };

    Ok(Self {
      device_path: device_path.to_string(),
      stream: Some(stream),
      device: Some(device),
      frame_index: 0,
      width: format.width,
      height: format.height,
      started: Instant::now(),
    })
  }
}

/// YUYV 转 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl FrameSource for V4l2Source {
  fn read(&mut self) -> Result<Option<Frame>, SourceError> {
    let stream = match self.stream.as_mut() {
      Some(stream) => stream,
      None => return Ok(None),
    };

    let rgb = match stream.next() {
      Ok((buffer, _meta)) => yuyv_to_rgb(buffer, self.width, self.height),
      Err(e) => {
        // 摄像头读取失败即视为播放结束
        warn!("无法捕获帧: {}", e);
        self.close();
        return Ok(None);
      }
    };

    let image = match RgbImage::from_raw(self.width, self.height, rgb) {
      Some(image) => image,
      None => {
        self.close();
        return Err(SourceError::ReadFailure(format!(
          "{}: 无法创建 RGB 图像",
          self.device_path
        )));
      }
    };
    let frame = Frame::new(
      image,
      self.frame_index,
      self.started.elapsed().as_millis() as u64,
    );
    self.frame_index += 1;
    Ok(Some(frame))
  }

  fn close(&mut self) {
    self.stream.take();
    if self.device.take().is_some() {
      debug!("释放摄像头: {}", self.device_path);
    }
  }

  fn is_open(&self) -> bool {
    self.stream.is_some()
  }

  fn kind(&self) -> SourceKind {
    SourceKind::Webcam
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    None
  }
}

impl Drop for V4l2Source {
  fn drop(&mut self) {
    self.close();
  }
}
