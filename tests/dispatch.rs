// 该文件是 Tanjing （探镜） 项目的一部分。
// tests/dispatch.rs - 按用户选择分派的各条流程
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

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{Rgb, RgbImage};

use common::{Recorder, ScriptedLoader, VecOpener, person};
use tanjing::{
  config::{Action, Confidence, Request, SourceSelection, TaskKind},
  dispatch::{Dispatcher, Outcome, SourceOpener, SystemSourceOpener},
  input::{
    Backend, BoxedSource, OpenOptions, ResolveError, ResolvedStream, SourceDescriptor, SourceError,
    StreamResolver, open_source_with,
  },
  output::{NOTHING_TO_SHOW, ResultsPanel},
  settings::{Settings, ToolPaths},
  task::{CancelToken, ErrorKind, StopReason},
  track::TrackerKind,
};

fn request(source: SourceSelection) -> Request {
  Request::new(TaskKind::Detection, Confidence::from_percent(40), source)
}

fn scores_model() -> ScriptedLoader {
  ScriptedLoader::new(vec![
    person(0.93, [10.0, 10.0, 50.0, 90.0]),
    person(0.62, [60.0, 10.0, 100.0, 90.0]),
    person(0.40, [110.0, 10.0, 150.0, 90.0]),
    person(0.39, [160.0, 10.0, 200.0, 90.0]),
    person(0.26, [210.0, 10.0, 250.0, 90.0]),
  ])
}

#[test]
fn default_image_is_shown_without_inference() {
  let dir = common::temp_dir("default-image");
  let settings = Settings {
    default_image: dir.join("office.png"),
    default_detect_image: dir.join("office_detected.png"),
    ..Settings::default()
  };
  RgbImage::from_pixel(40, 30, Rgb([200, 0, 0]))
    .save(&settings.default_image)
    .unwrap();
  RgbImage::from_pixel(40, 30, Rgb([0, 200, 0]))
    .save(&settings.default_detect_image)
    .unwrap();

  let models = scores_model();
  let sources = VecOpener::new(1);
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut output = Recorder::default();

  let outcome = dispatcher
    .dispatch(&request(SourceSelection::Image(None)), &mut output)
    .unwrap();

  assert_eq!(outcome, Outcome::DefaultImage);
  assert_eq!(models.loads(), 0);
  assert_eq!(sources.opens(), 0);
  assert_eq!(output.frames.len(), 1);
  let frame = &output.frames[0];
  assert!(!frame.inferred);
  let shown = frame.display();
  assert_eq!(shown.dimensions(), (80, 30));
  assert_eq!(shown.get_pixel(0, 0), &Rgb([200, 0, 0]));
  assert_eq!(shown.get_pixel(79, 0), &Rgb([0, 200, 0]));

  let mut panel = ResultsPanel::new(Vec::new());
  dispatcher
    .dispatch(&request(SourceSelection::Image(None)), &mut panel)
    .unwrap();
  let text = String::from_utf8(panel.into_inner()).unwrap();
  assert_eq!(text.trim(), NOTHING_TO_SHOW);

  std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn uploaded_image_lists_only_confident_detections() {
  let dir = common::temp_dir("upload");
  let upload = dir.join("upload.jpg");
  RgbImage::new(320, 240).save(&upload).unwrap();

  let settings = Settings::default();
  let models = scores_model();
  let sources = SystemSourceOpener::default();
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut panel = ResultsPanel::new(Vec::new());

  let outcome = dispatcher
    .dispatch(&request(SourceSelection::Image(Some(upload))), &mut panel)
    .unwrap();
  assert!(matches!(outcome, Outcome::Played(report) if report.frames == 1 && report.detections == 3));

  let text = String::from_utf8(panel.into_inner()).unwrap();
  let confidences = text
    .lines()
    .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["confidence"].as_f64().unwrap())
    .collect::<Vec<_>>();
  assert_eq!(confidences.len(), 3);
  assert!(confidences.iter().all(|&c| c >= 0.4 - 1e-6));

  std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn uploaded_image_is_shown_beside_its_detections() {
  let dir = common::temp_dir("upload-side-by-side");
  let upload = dir.join("upload.png");
  RgbImage::new(64, 48).save(&upload).unwrap();

  let settings = Settings::default();
  let models = scores_model();
  let sources = SystemSourceOpener::default();
  let dispatcher = Dispatcher::new(&settings, &models, &sources);

  let mut output = Recorder::default();
  dispatcher
    .dispatch(&request(SourceSelection::Image(Some(upload.clone()))), &mut output)
    .unwrap();
  assert_eq!(output.frames[0].display().dimensions(), (128, 48));

  let mut preview = Recorder::default();
  let outcome = dispatcher
    .dispatch(
      &request(SourceSelection::Image(Some(upload))).with_action(Action::Preview),
      &mut preview,
    )
    .unwrap();
  assert!(matches!(outcome, Outcome::Previewed { width: 64, height: 48, .. }));
  assert!(!preview.frames[0].inferred);
  assert_eq!(preview.frames[0].display().dimensions(), (64, 48));
  assert_eq!(models.loads(), 1);

  std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn stored_video_preview_plays_every_frame_without_a_model() {
  let settings = Settings::default();
  let models = scores_model();
  let sources = VecOpener::new(4);
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut output = Recorder::default();

  let outcome = dispatcher
    .dispatch(
      &request(SourceSelection::Video("video_1".into())).with_action(Action::Preview),
      &mut output,
    )
    .unwrap();

  assert!(matches!(outcome, Outcome::Previewed { .. }));
  assert_eq!(output.frames.len(), 4);
  assert!(output.frames.iter().all(|frame| !frame.inferred && frame.result.is_empty()));
  assert_eq!(
    output.frames.iter().map(|frame| frame.index).collect::<Vec<_>>(),
    vec![0, 1, 2, 3]
  );
  assert_eq!(output.finished, 1);
  assert_eq!(models.loads(), 0);
  assert!(sources.all_released());
}

#[test]
fn stored_video_preview_stops_on_a_broken_file() {
  let settings = Settings::default();
  let models = scores_model();
  let sources = VecOpener::new(4).failing_after(2);
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut output = Recorder::default();

  let err = dispatcher
    .dispatch(
      &request(SourceSelection::Video("video_1".into())).with_action(Action::Preview),
      &mut output,
    )
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::ReadFailure);
  assert_eq!(output.frames.len(), 2);
  assert_eq!(output.finished, 1);
  assert!(sources.all_released());
}

/// 统计打开次数，实际打开交给系统
struct CountingOpener {
  inner: SystemSourceOpener,
  attempts: AtomicUsize,
}

impl SourceOpener for CountingOpener {
  fn open(&self, descriptor: &SourceDescriptor) -> Result<BoxedSource, SourceError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    self.inner.open(descriptor)
  }
}

#[test]
fn unreachable_rtsp_stream_is_unavailable_and_not_retried() {
  let tools = ToolPaths {
    ffprobe: PathBuf::from("/nonexistent/tanjing/ffprobe"),
    ffmpeg: PathBuf::from("/nonexistent/tanjing/ffmpeg"),
    ..ToolPaths::default()
  };
  let settings = Settings::default();
  let models = scores_model();
  let sources = CountingOpener {
    inner: SystemSourceOpener::new(OpenOptions::new(tools).with_backend(Backend::Ffmpeg)),
    attempts: AtomicUsize::new(0),
  };
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut output = Recorder::default();

  let err = dispatcher
    .dispatch(
      &request(SourceSelection::Rtsp("rtsp://127.0.0.1:1/stream".into())),
      &mut output,
    )
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
  assert!(output.frames.is_empty());
  assert_eq!(sources.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_catalog_video_is_unavailable() {
  let settings = Settings::default();
  let models = scores_model();
  let sources = VecOpener::new(3);
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut output = Recorder::default();

  let err = dispatcher
    .dispatch(&request(SourceSelection::Video("missing".into())), &mut output)
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
  assert_eq!(sources.opens(), 0);
}

#[test]
fn each_playback_session_gets_a_fresh_tracker() {
  let settings = Settings::default();
  let models = ScriptedLoader::new(vec![person(0.9, [100.0, 100.0, 180.0, 300.0])]).moving(4.0);
  let sources = VecOpener::new(3);
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let request = request(SourceSelection::Video("video_1".into()))
    .with_tracker(Some(TrackerKind::ByteTrack));

  for _ in 0..2 {
    let mut output = Recorder::default();
    let outcome = dispatcher.dispatch(&request, &mut output).unwrap();
    assert!(matches!(outcome, Outcome::Played(report) if report.stop == StopReason::EndOfStream));
    assert_eq!(output.track_ids(), vec![vec![Some(1)]; 3]);
  }
  assert_eq!(sources.opens(), 2);
  assert!(sources.all_released());
}

#[test]
fn mid_stream_failure_releases_the_source() {
  let settings = Settings::default();
  let models = scores_model();
  let sources = VecOpener::new(5).failing_after(1);
  let dispatcher = Dispatcher::new(&settings, &models, &sources);
  let mut output = Recorder::default();

  let err = dispatcher
    .dispatch(&request(SourceSelection::Webcam("/dev/video0".into())), &mut output)
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::ReadFailure);
  assert_eq!(output.frames.len(), 1);
  assert_eq!(output.finished, 1);
  assert!(sources.all_released());
}

#[test]
fn cancelled_session_renders_nothing() {
  let settings = Settings::default();
  let models = scores_model();
  let sources = VecOpener::new(5);
  let cancel = CancelToken::new();
  cancel.cancel();
  let dispatcher = Dispatcher::new(&settings, &models, &sources).with_cancel(cancel);
  let mut output = Recorder::default();

  let outcome = dispatcher
    .dispatch(&request(SourceSelection::Video("video_1".into())), &mut output)
    .unwrap();
  assert!(matches!(outcome, Outcome::Played(report) if report.stop == StopReason::Cancelled));
  assert!(output.frames.is_empty());
  assert!(sources.all_released());
}

struct NoStream;

impl StreamResolver for NoStream {
  fn resolve(&self, _page_url: &str) -> Result<ResolvedStream, ResolveError> {
    Err(ResolveError::NoMatchingStream {
      height: 720,
      extension: "mp4".into(),
    })
  }
}

struct YouTubeOpener;

impl SourceOpener for YouTubeOpener {
  fn open(&self, descriptor: &SourceDescriptor) -> Result<BoxedSource, SourceError> {
    open_source_with(descriptor, &OpenOptions::default(), &NoStream)
  }
}

#[test]
fn youtube_without_a_matching_stream_is_a_resolution_error() {
  let settings = Settings::default();
  let models = scores_model();
  let dispatcher = Dispatcher::new(&settings, &models, &YouTubeOpener);
  let mut output = Recorder::default();

  let err = dispatcher
    .dispatch(
      &request(SourceSelection::YouTube("https://www.youtube.com/watch?v=abc".into())),
      &mut output,
    )
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::StreamResolution);
  assert!(output.frames.is_empty());
}
