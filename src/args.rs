// 该文件是 Tanjing （探镜） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use tanjing::{
  config::{Action, Confidence, Request, SourceKind, SourceSelection, TaskKind, TrackerChoice},
  input::Backend,
  settings::Settings,
};

/// Tanjing 目标检测与分割演示
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 任务类型
  #[arg(long, value_enum, default_value = "detection")]
  pub task: TaskKind,

  /// 置信度（百分比）
  #[arg(
    long,
    value_name = "PERCENT",
    default_value_t = Confidence::DEFAULT_PERCENT,
    value_parser = clap::value_parser!(u8).range(Confidence::MIN_PERCENT as i64..=Confidence::MAX_PERCENT as i64)
  )]
  pub confidence: u8,

  /// 输入源类型
  #[arg(long, value_enum, default_value = "image")]
  pub source: SourceKind,

  /// 跟踪器（仅对视频类输入有效）
  #[arg(long, value_enum, default_value = "none")]
  pub tracker: TrackerChoice,

  /// 上传的图片；不给出时展示默认图片
  #[arg(long, value_name = "FILE")]
  pub image: Option<PathBuf>,

  /// 视频目录中的名称；默认使用目录中的第一个
  #[arg(long, value_name = "NAME")]
  pub video: Option<String>,

  /// 摄像头设备；默认使用设置中的设备
  #[arg(long, value_name = "DEVICE")]
  pub webcam: Option<String>,

  /// RTSP 地址
  #[arg(long, value_name = "URL")]
  pub rtsp: Option<String>,

  /// YouTube 视频地址
  #[arg(long, value_name = "URL")]
  pub youtube: Option<String>,

  /// 输出地址，例如 image:///tmp/latest.png、folder:///tmp/records、
  /// video:///tmp/out.mp4?fps=25、null:
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  /// 检测结果明细，`-` 表示标准输出
  #[arg(long, value_name = "PATH")]
  pub results: Option<String>,

  /// 设置文件（JSON）
  #[arg(long, value_name = "FILE")]
  pub settings: Option<PathBuf>,

  /// 最大处理帧数
  #[arg(long, value_name = "COUNT")]
  pub max_frames: Option<u64>,

  /// 只查看输入源，不做推理
  #[arg(long)]
  pub preview: bool,

  /// 改用 ffmpeg 命令行工具解码
  #[arg(long)]
  pub ffmpeg: bool,

  /// 摄像头使用 V4L2 直接采集
  #[cfg(feature = "v4l_input")]
  #[arg(long)]
  pub v4l2: bool,
}

impl Args {
  /// 从当前参数重新构建本次请求
  pub fn request(&self, settings: &Settings) -> Result<Request> {
    let source = match self.source {
      SourceKind::Image => SourceSelection::Image(self.image.clone()),
      SourceKind::Video => {
        let name = match self.video.clone().or_else(|| settings.videos.keys().next().cloned()) {
          Some(name) => name,
          None => bail!("视频目录为空"),
        };
        SourceSelection::Video(name)
      }
      SourceKind::Webcam => {
        SourceSelection::Webcam(self.webcam.clone().unwrap_or_else(|| settings.webcam.clone()))
      }
      SourceKind::Rtsp => match self.rtsp.clone() {
        Some(url) => SourceSelection::Rtsp(url),
        None => bail!("请通过 --rtsp 指定 RTSP 地址"),
      },
      SourceKind::YouTube => match self.youtube.clone() {
        Some(url) => SourceSelection::YouTube(url),
        None => bail!("请通过 --youtube 指定 YouTube 视频地址"),
      },
    };

    let action = if self.preview {
      Action::Preview
    } else {
      Action::Detect
    };

    Ok(
      Request::new(self.task, Confidence::from_percent(self.confidence), source)
        .with_tracker(self.tracker.into())
        .with_action(action)
        .with_max_frames(self.max_frames),
    )
  }

  pub fn backend(&self) -> Backend {
    if self.ffmpeg {
      return Backend::Ffmpeg;
    }
    #[cfg(feature = "v4l_input")]
    if self.v4l2 {
      return Backend::V4l2;
    }
    Backend::default()
  }
}
