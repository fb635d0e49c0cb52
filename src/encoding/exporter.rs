// Export 세션 관리 - 조정 스레드, 트랙 드레인 시작/취소, 종료 결과 전달
// Exporter: 타임라인 → 단일 출력 파일, 한 번에 한 세션

use super::barrier::JoinBarrier;
use super::drain::{spawn_drain, TrackLane};
use super::progress::{ProgressCallback, ProgressCell, ProgressReporter};
use super::session::{next_session_id, Outcome, SessionFlags, SessionPermit, SessionState};
use super::settings::ExportSettings;
use crate::error::ExportError;
use crate::media::{
    MediaBackend, ReaderParts, ReaderStatus, SampleReader, SampleWriter, TrackKind, WriterParts,
    WriterRequest,
};
use crate::timeline::{AudioMix, Timeline, VideoComposition};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};

/// 진행/완료 알림 수신자 (약한 참조로 보관, 사라졌으면 알림 생략)
pub trait ExportObserver: Send + Sync {
    /// 비디오 드레인 스레드에서 호출 (완료 시 마지막 1.0은 조정 스레드)
    fn export_progress(&self, _fraction: f64) {}

    /// 조정 스레드에서 완료 콜백 직전에 호출
    fn export_completed(&self, _outcome: Outcome) {}
}

/// 완료 콜백: 결과 + (Completed일 때만) 출력 경로
pub type CompletionCallback = Box<dyn FnOnce(Outcome, Option<PathBuf>) + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exporter ↔ 조정 스레드 공유 상태 (폴링용)
struct ExporterShared {
    state: Mutex<SessionState>,
    progress: Arc<ProgressCell>,
    last_error: Mutex<Option<String>>,
    /// 실행 중 세션 (id, 취소 플래그)
    current: Mutex<Option<(u64, Arc<SessionFlags>)>>,
    observer: Mutex<Option<Weak<dyn ExportObserver>>>,
}

impl ExporterShared {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn record_error(&self, err: &ExportError) {
        self.record_message(err.to_string());
    }

    fn record_message(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }
}

struct StartRequest {
    timeline: Timeline,
    composition: VideoComposition,
    audio_mix: Option<AudioMix>,
    settings: ExportSettings,
    on_finish: CompletionCallback,
}

enum Command {
    Start {
        request: StartRequest,
        reply: Sender<Result<(), ExportError>>,
    },
    Cancel {
        session: u64,
    },
    /// Join barrier가 비었음 (세션 id로 이전 세션 신호 구분)
    TracksDrained {
        session: u64,
    },
    Shutdown,
}

/// Export 엔진 핸들
///
/// `export`는 조정 스레드에서 리더/라이터를 구성한 뒤 바로 반환하고,
/// 결과는 완료 콜백으로 정확히 한 번 전달된다.
pub struct Exporter {
    commands: Sender<Command>,
    shared: Arc<ExporterShared>,
    coordinator: Option<JoinHandle<()>>,
    coordinator_id: ThreadId,
}

impl Exporter {
    /// 조정 스레드 시작 (`export-coordinator`)
    pub fn new(backend: Arc<dyn MediaBackend>) -> Result<Self, ExportError> {
        Self::spawn(backend, None)
    }

    /// scope 전용 Exporter (`export-<scope>`)
    ///
    /// 이 scope가 조정/드레인 스레드 이름, 기본 출력 파일, scope 등록을 모두 결정한다.
    /// 설정의 `scope`는 비워 두거나 같은 이름이어야 한다.
    pub fn for_scope(backend: Arc<dyn MediaBackend>, scope: &str) -> Result<Self, ExportError> {
        ExportSettings::scoped(scope).validate()?;
        Self::spawn(backend, Some(scope.to_string()))
    }

    fn spawn(backend: Arc<dyn MediaBackend>, scope: Option<String>) -> Result<Self, ExportError> {
        let thread_name = match &scope {
            Some(scope) => format!("export-{}", scope),
            None => "export-coordinator".to_string(),
        };
        let shared = Arc::new(ExporterShared {
            state: Mutex::new(SessionState::Idle),
            progress: Arc::new(ProgressCell::default()),
            last_error: Mutex::new(None),
            current: Mutex::new(None),
            observer: Mutex::new(None),
        });
        let (commands, inbox) = unbounded();

        let coordinator = Coordinator {
            backend,
            scope,
            shared: shared.clone(),
            commands: commands.clone(),
            session: None,
            shutting_down: false,
        };
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || coordinator.run(inbox))?;
        let coordinator_id = handle.thread().id();

        Ok(Self {
            commands,
            shared,
            coordinator: Some(handle),
            coordinator_id,
        })
    }

    /// 진행/완료 알림 수신자 등록 (약한 참조). 다음 export부터 적용
    pub fn set_observer(&self, observer: &Arc<dyn ExportObserver>) {
        *lock(&self.shared.observer) = Some(Arc::downgrade(observer));
    }

    pub fn clear_observer(&self) {
        *lock(&self.shared.observer) = None;
    }

    /// Export 시작
    ///
    /// - 리더/라이터 구성 실패: 콜백으로 `Failed` 전달 후 `Err` 반환
    /// - 이전 세션이 끝나지 않음: `SessionActive` (콜백 호출 안 함)
    /// - 완료 콜백 안에서 호출: `ReentrantStart` (콜백 호출 안 함)
    pub fn export<F>(
        &self,
        timeline: &Timeline,
        composition: &VideoComposition,
        audio_mix: Option<&AudioMix>,
        settings: ExportSettings,
        on_finish: F,
    ) -> Result<(), ExportError>
    where
        F: FnOnce(Outcome, Option<PathBuf>) + Send + 'static,
    {
        if thread::current().id() == self.coordinator_id {
            return Err(ExportError::ReentrantStart);
        }

        let request = StartRequest {
            timeline: timeline.clone(),
            composition: *composition,
            audio_mix: audio_mix.cloned(),
            settings,
            on_finish: Box::new(on_finish),
        };
        let (reply, response) = bounded(1);
        self.commands
            .send(Command::Start { request, reply })
            .map_err(|_| ExportError::CoordinatorGone)?;
        response.recv().map_err(|_| ExportError::CoordinatorGone)?
    }

    /// 실행 중 세션 취소 (ReadingAndWriting일 때만, 즉시 반환)
    pub fn cancel(&self) {
        let mut state = lock(&self.shared.state);
        if *state != SessionState::ReadingAndWriting {
            debug!("[EXPORT] 취소 무시 (상태 {:?})", *state);
            return;
        }
        let Some((session, flags)) = lock(&self.shared.current).clone() else {
            return;
        };
        if !flags.cancel() {
            return;
        }
        *state = SessionState::Cancelling;
        drop(state);

        info!("[EXPORT] 취소 요청 (세션 {})", session);
        if self.commands.send(Command::Cancel { session }).is_err() {
            error!("[EXPORT] 조정 스레드 없음, 취소 전달 실패");
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn is_writing(&self) -> bool {
        self.state() == SessionState::ReadingAndWriting
    }

    /// 현재(또는 마지막) 세션 진행률 0.0 ~ 1.0
    pub fn progress(&self) -> f64 {
        self.shared.progress.get()
    }

    /// 마지막 세션의 에러 메시지
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        self.cancel();
        let _ = self.commands.send(Command::Shutdown);

        // 완료 콜백 안에서 마지막 핸들이 drop되면 join 불가 (스레드는 스스로 종료)
        if thread::current().id() == self.coordinator_id {
            return;
        }
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                error!("[EXPORT] 조정 스레드 panic");
            }
        }
    }
}

/// 실행 중 세션 하나
struct ActiveSession {
    id: u64,
    flags: Arc<SessionFlags>,
    location: PathBuf,
    reader: Arc<dyn SampleReader>,
    writer: Arc<dyn SampleWriter>,
    lanes: Vec<Arc<TrackLane>>,
    drains: Vec<JoinHandle<()>>,
    /// drop하면 대기 중인 드레인 스레드가 깨어남
    stop: Option<Sender<()>>,
    progress: Arc<ProgressReporter>,
    observer: Option<Weak<dyn ExportObserver>>,
    on_finish: CompletionCallback,
    permit: SessionPermit,
}

/// 구성 실패 시 정리할 것들
struct Partial {
    reader: Option<Arc<dyn SampleReader>>,
    writer: Option<Arc<dyn SampleWriter>>,
}

impl Partial {
    fn abandon(self) {
        if let Some(reader) = self.reader {
            reader.cancel_reading();
        }
        if let Some(writer) = self.writer {
            writer.cancel_writing();
        }
    }
}

/// 조정 스레드 상태 (시작/취소/종료 판정을 직렬화)
struct Coordinator {
    backend: Arc<dyn MediaBackend>,
    /// 조정 스레드 이름에 쓰인 scope (세션 scope의 유일한 출처)
    scope: Option<String>,
    shared: Arc<ExporterShared>,
    /// barrier 알림용 자기 자신 송신측
    commands: Sender<Command>,
    session: Option<ActiveSession>,
    shutting_down: bool,
}

impl Coordinator {
    fn run(mut self, inbox: Receiver<Command>) {
        while let Ok(command) = inbox.recv() {
            match command {
                Command::Start { request, reply } => {
                    let result = self.start(request);
                    let _ = reply.send(result);
                }
                Command::Cancel { session } => self.cancel(session),
                Command::TracksDrained { session } => self.finish(session),
                Command::Shutdown => self.shutting_down = true,
            }

            // 종료 요청 후에도 실행 중 세션은 결과 전달까지 처리
            if self.shutting_down && self.session.is_none() {
                break;
            }
        }
        debug!("[EXPORT] 조정 스레드 종료");
    }

    fn start(&mut self, request: StartRequest) -> Result<(), ExportError> {
        {
            let mut state = lock(&self.shared.state);
            if self.session.is_some() || !state.accepts_start() {
                warn!("[EXPORT] 세션 실행 중, 시작 거부 (상태 {:?})", *state);
                return Err(ExportError::SessionActive);
            }
            *state = SessionState::Preparing;
        }
        *lock(&self.shared.last_error) = None;
        self.shared.progress.set(0.0);

        let StartRequest {
            timeline,
            composition,
            audio_mix,
            settings,
            on_finish,
        } = request;
        let observer = lock(&self.shared.observer).clone();

        let prepared = self.bind_scope(settings).and_then(|settings| {
            let prepared = self.prepare(&timeline, &composition, audio_mix.as_ref(), &settings)?;
            Ok((prepared, settings))
        });
        match prepared {
            Ok((prepared, settings)) => {
                let session = prepared.launch(observer, on_finish, &settings);
                *lock(&self.shared.current) = Some((session.id, session.flags.clone()));
                self.shared.set_state(SessionState::ReadingAndWriting);
                info!(
                    "[EXPORT] 시작 (세션 {}, 트랙 {}개): {}",
                    session.id,
                    session.lanes.len(),
                    session.location.display()
                );
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                error!("[EXPORT] 구성 실패: {}", err);
                self.shared.record_error(&err);
                self.shared.set_state(SessionState::Finished(Outcome::Failed));
                deliver(observer.as_ref(), Outcome::Failed, on_finish, None);
                Err(err)
            }
        }
    }

    /// 설정 scope를 Exporter scope에 맞춤 (비어 있으면 채우고, 다르면 거부)
    fn bind_scope(&self, mut settings: ExportSettings) -> Result<ExportSettings, ExportError> {
        match (&self.scope, &settings.scope) {
            (Some(own), None) => settings.scope = Some(own.clone()),
            (Some(own), Some(requested)) if own != requested => {
                return Err(ExportError::InvalidSettings(format!(
                    "scope '{}' does not match exporter scope '{}'",
                    requested, own
                )))
            }
            (None, Some(requested)) => {
                return Err(ExportError::InvalidSettings(format!(
                    "scope '{}' needs an exporter created with Exporter::for_scope",
                    requested
                )))
            }
            _ => {}
        }
        Ok(settings)
    }

    /// 세션 구성: limiter/scope → 기존 파일 제거 → 리더 → 라이터 → 시작
    fn prepare(
        &self,
        timeline: &Timeline,
        composition: &VideoComposition,
        audio_mix: Option<&AudioMix>,
        settings: &ExportSettings,
    ) -> Result<Prepared, ExportError> {
        settings.validate()?;
        let permit =
            SessionPermit::acquire(self.backend.session_limiter(), settings.scope.as_deref())?;

        let location = settings.output_location();
        if location.exists() {
            match std::fs::remove_file(&location) {
                Ok(()) => debug!("[EXPORT] 기존 출력 삭제: {}", location.display()),
                Err(e) => warn!("[EXPORT] 기존 출력 삭제 실패 ({}): {}", location.display(), e),
            }
        }

        let mut partial = Partial {
            reader: None,
            writer: None,
        };

        let result = self.open_media(
            timeline,
            composition,
            audio_mix,
            settings,
            &location,
            &mut partial,
        );
        match result {
            Ok((reader_parts, writer_parts)) => Ok(Prepared {
                id: next_session_id(),
                location,
                reader_parts,
                writer_parts,
                permit,
                shared_progress: self.shared.progress.clone(),
                commands: self.commands.clone(),
            }),
            Err(err) => {
                partial.abandon();
                Err(err)
            }
        }
    }

    fn open_media(
        &self,
        timeline: &Timeline,
        composition: &VideoComposition,
        audio_mix: Option<&AudioMix>,
        settings: &ExportSettings,
        location: &std::path::Path,
        partial: &mut Partial,
    ) -> Result<(ReaderParts, WriterParts), ExportError> {
        let reader_parts = self
            .backend
            .create_reader(timeline, composition, audio_mix)
            .map_err(ExportError::Construction)?;
        partial.reader = Some(reader_parts.reader.clone());

        let audio = match (&reader_parts.audio, reader_parts.audio_format) {
            (Some(_), Some(format)) => Some((&settings.audio, format)),
            (Some(_), None) => {
                return Err(ExportError::Construction(
                    "reader produced an audio output without a format".to_string(),
                ))
            }
            _ => None,
        };
        let request = WriterRequest {
            location,
            container: settings.container,
            video: &settings.video,
            video_source: reader_parts.video_format,
            audio,
        };
        let writer_parts = self
            .backend
            .create_writer(&request)
            .map_err(ExportError::Construction)?;
        partial.writer = Some(writer_parts.writer.clone());

        if reader_parts.audio.is_some() && writer_parts.audio.is_none() {
            return Err(ExportError::Construction(
                "writer did not provide an audio input".to_string(),
            ));
        }

        reader_parts
            .reader
            .start_reading()
            .map_err(ExportError::Construction)?;
        writer_parts
            .writer
            .start_writing()
            .map_err(ExportError::Construction)?;

        Ok((reader_parts, writer_parts))
    }

    fn cancel(&mut self, session_id: u64) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            debug!("[EXPORT] 지난 세션 {} 취소 신호 무시", session_id);
            return;
        };

        // 대기 중인 드레인 스레드 깨우기 → 남은 트랙 강제 종료
        session.stop.take();
        for lane in &session.lanes {
            if lane.finish() {
                debug!("[EXPORT] {} 트랙 강제 종료", lane.kind());
            }
        }
    }

    /// 모든 트랙이 끝난 뒤 종료 판정 (세션당 한 번)
    fn finish(&mut self, session_id: u64) {
        if self.session.as_ref().map(|s| s.id) != Some(session_id) {
            debug!("[EXPORT] 지난 세션 {} 종료 신호 무시", session_id);
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };

        // 이후 cancel()은 무시됨
        self.shared.set_state(SessionState::Finalizing);
        *lock(&self.shared.current) = None;

        session.stop.take();
        for handle in session.drains.drain(..) {
            if handle.join().is_err() {
                error!("[EXPORT] 드레인 스레드 panic");
            }
        }

        let outcome = self.evaluate(&session);
        self.shared.set_state(SessionState::Finished(outcome));
        info!(
            "[EXPORT] 종료 (세션 {}): {:?}, 진행률 {:.3}",
            session.id,
            outcome,
            session.progress.current()
        );

        let ActiveSession {
            location,
            observer,
            on_finish,
            permit,
            ..
        } = session;
        // 슬롯 반환 후 전달 (콜백 안에서 다른 Exporter가 바로 시작할 수 있도록)
        drop(permit);
        let path = (outcome == Outcome::Completed).then_some(location);
        deliver(observer.as_ref(), outcome, on_finish, path);
    }

    fn evaluate(&self, session: &ActiveSession) -> Outcome {
        if session.flags.is_cancelled() {
            self.shared.record_error(&ExportError::Cancelled);
            session.reader.cancel_reading();
            session.writer.cancel_writing();
            return Outcome::Cancelled;
        }

        match session.reader.status() {
            ReaderStatus::Completed => {
                if let Some(err) = lane_failure(&session.lanes) {
                    self.shared.record_error(&err);
                    session.writer.cancel_writing();
                    return Outcome::Failed;
                }
                session.progress.complete();
                match session.writer.finish_writing() {
                    Ok(()) => Outcome::Completed,
                    Err(message) => {
                        self.shared.record_error(&ExportError::Finalize(message));
                        session.writer.cancel_writing();
                        Outcome::Failed
                    }
                }
            }
            status => {
                let message = match lane_failure(&session.lanes) {
                    Some(err) => err.to_string(),
                    None => session
                        .reader
                        .error()
                        .unwrap_or_else(|| format!("reader ended in {:?}", status)),
                };
                self.shared.record_message(message);
                session.writer.cancel_writing();
                Outcome::Failed
            }
        }
    }
}

/// 첫 번째로 실패한 트랙
fn lane_failure(lanes: &[Arc<TrackLane>]) -> Option<ExportError> {
    lanes.iter().find_map(|lane| {
        lane.failure().map(|message| ExportError::SampleIo {
            track: lane.kind(),
            message,
        })
    })
}

/// 관찰자 → 완료 콜백 순서로 전달
fn deliver(
    observer: Option<&Weak<dyn ExportObserver>>,
    outcome: Outcome,
    on_finish: CompletionCallback,
    path: Option<PathBuf>,
) {
    if let Some(observer) = observer.and_then(Weak::upgrade) {
        observer.export_completed(outcome);
    }
    on_finish(outcome, path);
}

/// 구성 완료, 드레인 시작 전
struct Prepared {
    id: u64,
    location: PathBuf,
    reader_parts: ReaderParts,
    writer_parts: WriterParts,
    permit: SessionPermit,
    shared_progress: Arc<ProgressCell>,
    commands: Sender<Command>,
}

impl Prepared {
    /// barrier 구성 → 트랙 arm → 드레인 스레드 시작
    fn launch(
        self,
        observer: Option<Weak<dyn ExportObserver>>,
        on_finish: CompletionCallback,
        settings: &ExportSettings,
    ) -> ActiveSession {
        let Prepared {
            id,
            location,
            reader_parts,
            writer_parts,
            permit,
            shared_progress,
            commands,
        } = self;
        let reader = reader_parts.reader;
        let writer = writer_parts.writer;

        let barrier = Arc::new(JoinBarrier::new(move || {
            let _ = commands.send(Command::TracksDrained { session: id });
        }));

        let callback: Option<ProgressCallback> = observer.clone().map(|weak| {
            Arc::new(move |fraction: f64| {
                if let Some(observer) = weak.upgrade() {
                    observer.export_progress(fraction);
                }
            }) as ProgressCallback
        });
        let progress = Arc::new(ProgressReporter::new(
            reader.duration_ms(),
            shared_progress,
            callback,
        ));

        let mut tracks = vec![(TrackKind::Video, reader_parts.video, writer_parts.video)];
        if let (Some(output), Some(input)) = (reader_parts.audio, writer_parts.audio) {
            tracks.push((TrackKind::Audio, output, input));
        }

        // 스레드 시작 전에 모든 트랙 arm (먼저 끝난 트랙이 barrier를 비우지 않도록)
        for (kind, _, _) in &tracks {
            barrier.enter(*kind);
        }

        let (stop, stop_rx) = bounded::<()>(0);
        let suffix = settings.thread_suffix();
        let mut lanes = Vec::with_capacity(tracks.len());
        let mut drains = Vec::with_capacity(tracks.len());

        for (kind, output, input) in tracks {
            let readiness = input.readiness();
            let lane = TrackLane::new(kind, output, input, reader.clone(), barrier.clone());
            let track_progress = (kind == TrackKind::Video).then(|| progress.clone());

            match spawn_drain(
                format!("export-{}{}", kind, suffix),
                lane.clone(),
                readiness,
                stop_rx.clone(),
                track_progress,
            ) {
                Ok(handle) => drains.push(handle),
                Err(e) => {
                    error!("[EXPORT] {} 드레인 스레드 시작 실패: {}", kind, e);
                    lane.abort(format!("cannot spawn drain thread: {}", e));
                }
            }
            lanes.push(lane);
        }

        ActiveSession {
            id,
            flags: SessionFlags::new(),
            location,
            reader,
            writer,
            lanes,
            drains,
            stop: Some(stop),
            progress,
            observer,
            on_finish,
            permit,
        }
    }
}
