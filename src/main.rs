// 该文件是 Tanjing （探镜） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use tanjing::{
  FromUrl,
  dispatch::{Dispatcher, OnnxModelLoader, Outcome, SystemSourceOpener},
  input::OpenOptions,
  output::{OutputWrapper, RenderGroup, ResultsPanel},
  settings::Settings,
  task::CancelToken,
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();
  let settings = Settings::load_or_default(args.settings.as_deref()).context("加载设置失败")?;
  let request = args.request(&settings)?;

  let cancel = CancelToken::new();
  cancel
    .install_ctrlc_handler()
    .context("无法设置 Ctrl-C 处理函数")?;

  let mut output = RenderGroup::new();
  match args.output.as_ref() {
    Some(url) => {
      info!("输出路径: {}", url);
      output.push(Box::new(
        OutputWrapper::from_url(url)?.with_tools(&settings.tools),
      ));
    }
    None => warn!("未指定 --output，标注结果不会保存"),
  }
  match args.results.as_deref() {
    Some("-") => output.push(Box::new(ResultsPanel::stdout())),
    Some(path) => {
      let file = File::create(path).with_context(|| format!("无法创建结果文件 {}", path))?;
      output.push(Box::new(ResultsPanel::new(BufWriter::new(file))));
    }
    None => {}
  }

  let models = OnnxModelLoader::from_settings(&settings)?;
  let sources = SystemSourceOpener::new(OpenOptions::new(settings.tools.clone()).with_backend(args.backend()));
  let dispatcher = Dispatcher::new(&settings, &models, &sources).with_cancel(cancel);

  match dispatcher.dispatch(&request, &mut output) {
    Ok(Outcome::DefaultImage) => info!("已展示默认图片"),
    Ok(Outcome::Previewed {
      kind,
      width,
      height,
      fps,
    }) => info!("{}: {}x{} fps={:?}", kind, width, height, fps),
    Ok(Outcome::Played(report)) => info!(
      "处理完成 ({}): 共 {} 帧，{} 个目标",
      report.stop, report.frames, report.detections
    ),
    Err(e) => {
      error!("[{:?}] {}", e.kind(), e);
      return Err(e.into());
    }
  }

  Ok(())
}
