// Export 세션 시나리오 (메모리 백엔드)

use crossbeam_channel::{unbounded, Receiver};
use export_engine::media::memory::{MemoryBackend, MemoryOutputSummary, MemoryScript};
use export_engine::{
    init_logging, ExportError, ExportObserver, ExportSettings, Exporter, Outcome, SessionState,
    Timeline, TrackKind, VideoComposition,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);

fn timeline(duration_ms: i64, with_audio: bool) -> Timeline {
    let mut timeline = Timeline::new(720, 1280, 30.0);
    let video = timeline.add_video_track();
    timeline.add_clip(video, "camera.mp4", 0, duration_ms);
    if with_audio {
        let audio = timeline.add_audio_track();
        timeline.add_clip(audio, "voice.m4a", 0, duration_ms);
    }
    timeline
}

type Done = Receiver<(Outcome, Option<PathBuf>)>;

fn completion() -> (impl FnOnce(Outcome, Option<PathBuf>) + Send + 'static, Done) {
    let (tx, rx) = unbounded();
    (
        move |outcome: Outcome, path: Option<PathBuf>| {
            let _ = tx.send((outcome, path));
        },
        rx,
    )
}

#[derive(Default)]
struct Recorder {
    progress: Mutex<Vec<f64>>,
    completed: Mutex<Vec<Outcome>>,
}

impl ExportObserver for Recorder {
    fn export_progress(&self, fraction: f64) {
        self.progress.lock().unwrap().push(fraction);
    }

    fn export_completed(&self, outcome: Outcome) {
        self.completed.lock().unwrap().push(outcome);
    }
}

#[test]
fn test_video_only_export_completes_with_monotonic_progress() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("video_only.mp4");
    let backend = Arc::new(MemoryBackend::new());
    let exporter = Exporter::new(backend.clone()).unwrap();

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn ExportObserver> = recorder.clone();
    exporter.set_observer(&observer);

    let timeline = timeline(10_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();

    let (outcome, path) = done.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(path, Some(output.clone()));

    let progress = recorder.progress.lock().unwrap().clone();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last().copied(), Some(1.0));
    assert_eq!(*recorder.completed.lock().unwrap(), vec![Outcome::Completed]);

    let summary = MemoryOutputSummary::load(&output).unwrap();
    assert_eq!(summary.video_samples, 300);
    assert_eq!(summary.audio_samples, 0);
    assert_eq!(summary.last_video_pts_ms, Some(9_966));

    let writer = backend.last_writer().unwrap();
    assert_eq!(writer.finish_marks(TrackKind::Video), 1);
}

#[test]
fn test_audio_and_video_are_both_written() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("both.mov");
    let exporter = Exporter::new(Arc::new(MemoryBackend::new())).unwrap();

    let timeline = timeline(2_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let mut settings = ExportSettings::default().with_output(&output);
    settings.container = export_engine::ContainerFormat::Mov;
    let (on_finish, done) = completion();
    exporter
        .export(&timeline, &composition, None, settings, on_finish)
        .unwrap();

    assert_eq!(done.recv_timeout(WAIT).unwrap().0, Outcome::Completed);
    let summary = MemoryOutputSummary::load(&output).unwrap();
    assert_eq!(summary.container, export_engine::ContainerFormat::Mov);
    assert_eq!(summary.video_samples, 60);
    assert_eq!(summary.audio_samples, 100);
}

#[test]
fn test_muted_audio_track_exports_video_only() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("muted.mp4");
    let backend = Arc::new(MemoryBackend::new());
    let exporter = Exporter::new(backend.clone()).unwrap();

    let mut timeline = timeline(1_000, true);
    timeline.audio_tracks[0].muted = true;
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();

    assert_eq!(done.recv_timeout(WAIT).unwrap().0, Outcome::Completed);
    let writer = backend.last_writer().unwrap();
    assert!(writer.appended(TrackKind::Audio).is_empty());
    assert_eq!(writer.finish_marks(TrackKind::Audio), 0);
}

#[test]
fn test_video_append_failure_still_drains_audio() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("broken.mp4");
    let backend = Arc::new(MemoryBackend::new().failing_append(TrackKind::Video, 5));
    let exporter = Exporter::new(backend.clone()).unwrap();

    let timeline = timeline(2_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();

    let (outcome, path) = done.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert!(path.is_none());

    let writer = backend.last_writer().unwrap();
    assert_eq!(writer.appended(TrackKind::Video).len(), 4);
    assert_eq!(writer.appended(TrackKind::Audio).len(), 100);
    assert_eq!(writer.finish_marks(TrackKind::Video), 1);
    assert_eq!(writer.finish_marks(TrackKind::Audio), 1);

    let message = exporter.last_error().unwrap();
    assert!(message.contains("video"), "unexpected error: {}", message);
    assert!(!output.exists());
}

#[test]
fn test_shared_writer_failure_still_ends_session() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("muxer_failed.mp4");
    let backend = Arc::new(
        MemoryBackend::new()
            .with_latency(Duration::from_millis(1))
            .failing_muxer(TrackKind::Video, 5),
    );
    let exporter = Exporter::new(backend.clone()).unwrap();

    let timeline = timeline(10_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();

    // 오디오는 라이터가 멈춘 뒤 거부 경로로 끝나야 함
    assert_eq!(done.recv_timeout(WAIT).unwrap(), (Outcome::Failed, None));
    assert_eq!(exporter.state(), SessionState::Finished(Outcome::Failed));

    let writer = backend.last_writer().unwrap();
    assert_eq!(writer.appended(TrackKind::Video).len(), 4);
    assert!(writer.appended(TrackKind::Audio).len() < 500);
    assert_eq!(writer.finish_marks(TrackKind::Video), 1);
    assert_eq!(writer.finish_marks(TrackKind::Audio), 1);

    let message = exporter.last_error().unwrap();
    assert!(message.contains("video"), "unexpected error: {}", message);
    assert!(!output.exists());
}

#[test]
fn test_read_failure_fails_session() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("unreadable.mp4");
    let exporter =
        Exporter::new(Arc::new(MemoryBackend::new().failing_read(TrackKind::Video, 10))).unwrap();

    let timeline = timeline(2_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();

    assert_eq!(done.recv_timeout(WAIT).unwrap(), (Outcome::Failed, None));
    assert!(exporter.last_error().unwrap().contains("unreadable"));
    assert!(!output.exists());
}

#[test]
fn test_cancel_mid_export_finishes_each_track_once() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("cancelled.mp4");
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(2)));
    let exporter = Exporter::new(backend.clone()).unwrap();

    let timeline = timeline(10_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();
    assert!(exporter.is_writing());

    thread::sleep(Duration::from_millis(100));
    exporter.cancel();
    exporter.cancel();

    assert_eq!(done.recv_timeout(WAIT).unwrap(), (Outcome::Cancelled, None));
    assert!(done.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(exporter.state(), SessionState::Finished(Outcome::Cancelled));
    assert!(exporter.progress() < 1.0);

    let writer = backend.last_writer().unwrap();
    assert_eq!(writer.finish_marks(TrackKind::Video), 1);
    assert_eq!(writer.finish_marks(TrackKind::Audio), 1);
    assert!(writer.appended(TrackKind::Video).len() < 300);
    assert!(!output.exists());

    // 종료 후 취소는 무시
    exporter.cancel();
    assert_eq!(exporter.state(), SessionState::Finished(Outcome::Cancelled));
}

#[test]
fn test_cancel_racing_end_of_stream_delivers_once() {
    init_logging();
    let dir = tempdir().unwrap();
    let timeline = timeline(300, true);
    let composition = VideoComposition::from_timeline(&timeline);

    for round in 0..50 {
        let output = dir.path().join(format!("race_{}.mp4", round));
        let backend = Arc::new(MemoryBackend::new().with_burst(1));
        let exporter = Arc::new(Exporter::new(backend.clone()).unwrap());
        let (on_finish, done) = completion();
        exporter
            .export(
                &timeline,
                &composition,
                None,
                ExportSettings::default().with_output(&output),
                on_finish,
            )
            .unwrap();

        // 짝수 회차는 같은 스레드, 홀수 회차는 다른 스레드에서 취소
        if round % 2 == 0 {
            exporter.cancel();
        } else {
            let remote = exporter.clone();
            thread::spawn(move || remote.cancel()).join().unwrap();
        }

        let (outcome, path) = done.recv_timeout(WAIT).unwrap();
        match outcome {
            Outcome::Completed => assert_eq!(path, Some(output.clone())),
            Outcome::Cancelled => {
                assert!(path.is_none());
                assert!(!output.exists());
            }
            Outcome::Failed => panic!(
                "round {}: unexpected failure {:?}",
                round,
                exporter.last_error()
            ),
        }

        let writer = backend.last_writer().unwrap();
        assert_eq!(writer.finish_marks(TrackKind::Video), 1);
        assert_eq!(writer.finish_marks(TrackKind::Audio), 1);

        // drop은 조정 스레드 종료까지 대기 → 이후 추가 전달 없음
        drop(exporter);
        assert!(done.try_recv().is_err());
    }
}

#[test]
fn test_writer_construction_failure_is_synchronous() {
    init_logging();
    let dir = tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new().failing_writer("no encoder available"));
    let exporter = Exporter::new(backend.clone()).unwrap();

    let timeline = timeline(1_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    let result = exporter.export(
        &timeline,
        &composition,
        None,
        ExportSettings::default().with_output(dir.path().join("never.mp4")),
        on_finish,
    );

    match result {
        Err(ExportError::Construction(message)) => assert_eq!(message, "no encoder available"),
        other => panic!("expected construction error, got {:?}", other),
    }
    // 콜백은 export 반환 전에 전달됨
    assert_eq!(done.try_recv().unwrap(), (Outcome::Failed, None));
    assert_eq!(exporter.state(), SessionState::Finished(Outcome::Failed));
    assert!(backend.last_writer().is_none());
}

#[test]
fn test_start_reading_failure_is_construction_error() {
    init_logging();
    let dir = tempdir().unwrap();
    let script = MemoryScript {
        fail_start_reading: Some("source moved".to_string()),
        ..MemoryScript::default()
    };
    let exporter = Exporter::new(Arc::new(MemoryBackend::with_script(script))).unwrap();

    let timeline = timeline(1_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    let result = exporter.export(
        &timeline,
        &composition,
        None,
        ExportSettings::default().with_output(dir.path().join("never.mp4")),
        on_finish,
    );

    assert!(matches!(result, Err(ExportError::Construction(_))));
    assert_eq!(done.try_recv().unwrap(), (Outcome::Failed, None));
    assert!(exporter.last_error().unwrap().contains("source moved"));
}

#[test]
fn test_zero_duration_reports_only_final_progress() {
    init_logging();
    let dir = tempdir().unwrap();
    let exporter = Exporter::new(Arc::new(MemoryBackend::new().with_duration(0))).unwrap();
    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn ExportObserver> = recorder.clone();
    exporter.set_observer(&observer);

    let timeline = timeline(1_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(dir.path().join("zero.mp4")),
            on_finish,
        )
        .unwrap();

    assert_eq!(done.recv_timeout(WAIT).unwrap().0, Outcome::Completed);
    assert_eq!(*recorder.progress.lock().unwrap(), vec![1.0]);
}

#[test]
fn test_second_export_while_active_is_rejected() {
    init_logging();
    let dir = tempdir().unwrap();
    let backend = MemoryBackend::new().with_latency(Duration::from_millis(2));
    let exporter = Exporter::new(Arc::new(backend)).unwrap();

    let timeline = timeline(10_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (first, first_done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(dir.path().join("first.mp4")),
            first,
        )
        .unwrap();

    let (second, second_done) = completion();
    let result = exporter.export(
        &timeline,
        &composition,
        None,
        ExportSettings::default().with_output(dir.path().join("second.mp4")),
        second,
    );
    assert!(matches!(result, Err(ExportError::SessionActive)));

    exporter.cancel();
    assert_eq!(first_done.recv_timeout(WAIT).unwrap().0, Outcome::Cancelled);
    // 거부된 요청의 콜백은 호출 없이 버려짐
    assert!(second_done.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(!dir.path().join("second.mp4").exists());
}

#[test]
fn test_export_after_finish_is_accepted() {
    init_logging();
    let dir = tempdir().unwrap();
    let exporter = Exporter::new(Arc::new(MemoryBackend::new())).unwrap();
    let timeline = timeline(500, true);
    let composition = VideoComposition::from_timeline(&timeline);

    for name in ["one.mp4", "two.mp4"] {
        let output = dir.path().join(name);
        let (on_finish, done) = completion();
        exporter
            .export(
                &timeline,
                &composition,
                None,
                ExportSettings::default().with_output(&output),
                on_finish,
            )
            .unwrap();
        assert_eq!(done.recv_timeout(WAIT).unwrap(), (Outcome::Completed, Some(output)));
    }
}

#[test]
fn test_session_limit_is_shared_across_exporters() {
    init_logging();
    let dir = tempdir().unwrap();
    let backend = Arc::new(
        MemoryBackend::new()
            .with_latency(Duration::from_millis(2))
            .with_session_limit(1),
    );
    let first = Exporter::new(backend.clone()).unwrap();
    let second = Exporter::new(backend.clone()).unwrap();

    let timeline = timeline(10_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_first, first_done) = completion();
    first
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(dir.path().join("a.mp4")),
            on_first,
        )
        .unwrap();

    let (on_second, second_done) = completion();
    let result = second.export(
        &timeline,
        &composition,
        None,
        ExportSettings::default().with_output(dir.path().join("b.mp4")),
        on_second,
    );
    assert!(matches!(result, Err(ExportError::TooManySessions(1))));
    assert_eq!(second_done.try_recv().unwrap(), (Outcome::Failed, None));

    first.cancel();
    assert_eq!(first_done.recv_timeout(WAIT).unwrap().0, Outcome::Cancelled);

    // 슬롯 반환 후에는 시작 가능
    let short = self::timeline(300, false);
    let (on_retry, retry_done) = completion();
    second
        .export(
            &short,
            &VideoComposition::from_timeline(&short),
            None,
            ExportSettings::default().with_output(dir.path().join("b.mp4")),
            on_retry,
        )
        .unwrap();
    assert_eq!(retry_done.recv_timeout(WAIT).unwrap().0, Outcome::Completed);
}

#[test]
fn test_same_scope_cannot_run_twice() {
    init_logging();
    let dir = tempdir().unwrap();
    let scope = "scope-busy-test";
    let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(2)));
    let first = Exporter::for_scope(backend.clone(), scope).unwrap();
    let second = Exporter::for_scope(backend.clone(), scope).unwrap();

    let timeline = timeline(10_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_first, first_done) = completion();
    first
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::scoped(scope).with_output(dir.path().join("a.mp4")),
            on_first,
        )
        .unwrap();

    let (on_second, _second_done) = completion();
    let result = second.export(
        &timeline,
        &composition,
        None,
        ExportSettings::scoped(scope).with_output(dir.path().join("b.mp4")),
        on_second,
    );
    assert!(matches!(result, Err(ExportError::ScopeBusy(name)) if name == scope));

    // 다른 scope는 병렬 실행 가능
    let other = Exporter::for_scope(backend.clone(), "scope-busy-other").unwrap();
    let (on_other, other_done) = completion();
    other
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::scoped("scope-busy-other").with_output(dir.path().join("c.mp4")),
            on_other,
        )
        .unwrap();

    first.cancel();
    other.cancel();
    assert_eq!(first_done.recv_timeout(WAIT).unwrap().0, Outcome::Cancelled);
    assert_eq!(other_done.recv_timeout(WAIT).unwrap().0, Outcome::Cancelled);
}

#[test]
fn test_dropped_observer_is_skipped() {
    init_logging();
    let dir = tempdir().unwrap();
    let exporter = Exporter::new(Arc::new(MemoryBackend::new())).unwrap();
    {
        let observer: Arc<dyn ExportObserver> = Arc::new(Recorder::default());
        exporter.set_observer(&observer);
    }

    let timeline = timeline(1_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(dir.path().join("orphan.mp4")),
            on_finish,
        )
        .unwrap();
    assert_eq!(done.recv_timeout(WAIT).unwrap().0, Outcome::Completed);
}

#[test]
fn test_existing_output_is_removed_before_start() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("stale.mp4");
    std::fs::write(&output, b"previous export").unwrap();

    let exporter =
        Exporter::new(Arc::new(MemoryBackend::new().failing_writer("encoder busy"))).unwrap();
    let timeline = timeline(1_000, false);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, _done) = completion();
    let result = exporter.export(
        &timeline,
        &composition,
        None,
        ExportSettings::default().with_output(&output),
        on_finish,
    );

    assert!(result.is_err());
    assert!(!output.exists());
}

#[test]
fn test_finalize_failure_discards_output() {
    init_logging();
    let dir = tempdir().unwrap();
    let output = dir.path().join("unfinished.mp4");
    let exporter =
        Exporter::new(Arc::new(MemoryBackend::new().failing_finish("disk full"))).unwrap();

    let timeline = timeline(1_000, true);
    let composition = VideoComposition::from_timeline(&timeline);
    let (on_finish, done) = completion();
    exporter
        .export(
            &timeline,
            &composition,
            None,
            ExportSettings::default().with_output(&output),
            on_finish,
        )
        .unwrap();

    assert_eq!(done.recv_timeout(WAIT).unwrap(), (Outcome::Failed, None));
    assert_eq!(
        exporter.last_error().as_deref(),
        Some("finalize failed: disk full")
    );
    assert!(!output.exists());
}
