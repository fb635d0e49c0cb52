// 메모리 백엔드 - 디코딩/인코딩 없이 타임라인 길이만큼 가짜 샘플을 흘려보냄
// dry run과 엔진 테스트용. 실패/지연/readiness burst를 스크립트로 지정

use super::readiness::ReadinessGate;
use super::{
    AudioFormat, MediaBackend, ReaderParts, ReaderState, ReaderStatus, Sample, SampleReader,
    SampleWriter, TrackInput, TrackKind, TrackOutput, VideoFormat, WriterParts, WriterRequest,
    WriterState, WriterStatus,
};
use crate::encoding::session::SessionLimiter;
use crate::encoding::ContainerFormat;
use crate::timeline::{AudioMix, Timeline, VideoComposition};
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 오디오 샘플 하나의 길이 (20ms, 48kHz 기준 960 frames)
pub const AUDIO_CHUNK_MS: i64 = 20;
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// readiness 신호 하나당 기본 append 수
pub const DEFAULT_BURST: usize = 8;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 백엔드 동작 스크립트
#[derive(Debug, Clone)]
pub struct MemoryScript {
    pub fail_reader_creation: Option<String>,
    pub fail_writer_creation: Option<String>,
    pub fail_start_reading: Option<String>,
    pub fail_start_writing: Option<String>,
    /// (트랙, n): n번째(1부터) 샘플 append 거부
    pub fail_append: Option<(TrackKind, usize)>,
    /// append 거부가 공유 라이터까지 Failed로 만듦 (먹서 기록 실패)
    pub fail_append_fails_writer: bool,
    /// (트랙, n): n번째(1부터) 샘플 읽기 실패
    pub fail_read: Option<(TrackKind, usize)>,
    pub fail_finish: Option<String>,
    /// append 한 번당 지연
    pub append_latency: Duration,
    pub burst: usize,
    /// 리더가 보고하는 전체 길이 (None이면 타임라인 길이)
    pub duration_override: Option<i64>,
}

impl Default for MemoryScript {
    fn default() -> Self {
        Self {
            fail_reader_creation: None,
            fail_writer_creation: None,
            fail_start_reading: None,
            fail_start_writing: None,
            fail_append: None,
            fail_append_fails_writer: false,
            fail_read: None,
            fail_finish: None,
            append_latency: Duration::ZERO,
            burst: DEFAULT_BURST,
            duration_override: None,
        }
    }
}

/// 메모리 백엔드
#[derive(Default)]
pub struct MemoryBackend {
    script: MemoryScript,
    limiter: Option<Arc<SessionLimiter>>,
    last_reader: Mutex<Option<Arc<MemoryReader>>>,
    last_writer: Mutex<Option<Arc<MemoryWriter>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: MemoryScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn script_mut(&mut self) -> &mut MemoryScript {
        &mut self.script
    }

    pub fn failing_append(mut self, track: TrackKind, nth: usize) -> Self {
        self.script.fail_append = Some((track, nth));
        self
    }

    /// n번째 append에서 공유 라이터 자체가 실패 (다른 트랙 입력도 이후 거부)
    pub fn failing_muxer(mut self, track: TrackKind, nth: usize) -> Self {
        self.script.fail_append = Some((track, nth));
        self.script.fail_append_fails_writer = true;
        self
    }

    pub fn failing_read(mut self, track: TrackKind, nth: usize) -> Self {
        self.script.fail_read = Some((track, nth));
        self
    }

    pub fn failing_writer(mut self, message: &str) -> Self {
        self.script.fail_writer_creation = Some(message.to_string());
        self
    }

    pub fn failing_finish(mut self, message: &str) -> Self {
        self.script.fail_finish = Some(message.to_string());
        self
    }

    pub fn with_latency(mut self, per_append: Duration) -> Self {
        self.script.append_latency = per_append;
        self
    }

    pub fn with_burst(mut self, burst: usize) -> Self {
        self.script.burst = burst.max(1);
        self
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.script.duration_override = Some(duration_ms);
        self
    }

    /// 이 백엔드를 쓰는 세션 수 제한
    pub fn with_session_limit(mut self, max: usize) -> Self {
        self.limiter = Some(Arc::new(SessionLimiter::new(max)));
        self
    }

    pub fn last_reader(&self) -> Option<Arc<MemoryReader>> {
        lock(&self.last_reader).clone()
    }

    pub fn last_writer(&self) -> Option<Arc<MemoryWriter>> {
        lock(&self.last_writer).clone()
    }

    fn fail_nth(script: Option<(TrackKind, usize)>, kind: TrackKind) -> Option<usize> {
        match script {
            Some((track, nth)) if track == kind && nth > 0 => Some(nth - 1),
            _ => None,
        }
    }
}

impl MediaBackend for MemoryBackend {
    fn create_reader(
        &self,
        timeline: &Timeline,
        composition: &VideoComposition,
        _audio_mix: Option<&AudioMix>,
    ) -> Result<ReaderParts, String> {
        if let Some(message) = &self.script.fail_reader_creation {
            return Err(message.clone());
        }

        let timeline_ms = timeline.duration_ms();
        let has_audio = timeline.has_audio();
        let reader = Arc::new(MemoryReader {
            state: ReaderState::new(if has_audio { 2 } else { 1 }),
            duration_ms: self.script.duration_override.unwrap_or(timeline_ms),
            start_error: self.script.fail_start_reading.clone(),
        });

        let frame_ms = composition.frame_duration_ms().round().max(1.0) as i64;
        let video_samples = (0..composition.frame_count(timeline_ms))
            .map(|i| Sample {
                track: TrackKind::Video,
                pts_ms: composition.frame_time_ms(i),
                duration_ms: frame_ms,
                data: (i as u32).to_le_bytes().to_vec(),
            })
            .collect();
        let video = MemoryOutput::new(
            TrackKind::Video,
            video_samples,
            reader.clone(),
            Self::fail_nth(self.script.fail_read, TrackKind::Video),
        );

        let (audio, audio_format) = if has_audio {
            let chunks = if timeline_ms > 0 {
                (timeline_ms + AUDIO_CHUNK_MS - 1) / AUDIO_CHUNK_MS
            } else {
                0
            };
            let samples = (0..chunks)
                .map(|i| Sample {
                    track: TrackKind::Audio,
                    pts_ms: i * AUDIO_CHUNK_MS,
                    duration_ms: AUDIO_CHUNK_MS,
                    data: Vec::new(),
                })
                .collect();
            let output = MemoryOutput::new(
                TrackKind::Audio,
                samples,
                reader.clone(),
                Self::fail_nth(self.script.fail_read, TrackKind::Audio),
            );
            let format = AudioFormat {
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: 2,
            };
            (Some(Box::new(output) as Box<dyn TrackOutput>), Some(format))
        } else {
            (None, None)
        };

        *lock(&self.last_reader) = Some(reader.clone());

        Ok(ReaderParts {
            reader,
            video: Box::new(video),
            video_format: VideoFormat {
                width: composition.render_width,
                height: composition.render_height,
            },
            audio,
            audio_format,
        })
    }

    fn create_writer(&self, request: &WriterRequest<'_>) -> Result<WriterParts, String> {
        if let Some(message) = &self.script.fail_writer_creation {
            return Err(message.clone());
        }

        let writer = Arc::new(MemoryWriter {
            state: WriterState::new(),
            location: request.location.to_path_buf(),
            container: request.container,
            records: Mutex::new(Default::default()),
            primers: Mutex::new(Vec::new()),
            start_error: self.script.fail_start_writing.clone(),
            finish_error: self.script.fail_finish.clone(),
        });

        let video = self.create_input(&writer, TrackKind::Video);
        let audio = request
            .audio
            .map(|_| Box::new(self.create_input(&writer, TrackKind::Audio)) as Box<dyn TrackInput>);

        *lock(&self.last_writer) = Some(writer.clone());

        Ok(WriterParts {
            writer,
            video: Box::new(video),
            audio,
        })
    }

    fn session_limiter(&self) -> Option<Arc<SessionLimiter>> {
        self.limiter.clone()
    }
}

impl MemoryBackend {
    fn create_input(&self, writer: &Arc<MemoryWriter>, kind: TrackKind) -> MemoryInput {
        let gate = ReadinessGate::new(self.script.burst);
        lock(&writer.primers).push(gate.primer());
        MemoryInput {
            kind,
            writer: writer.clone(),
            gate,
            latency: self.script.append_latency,
            fail_at: Self::fail_nth(self.script.fail_append, kind),
            fails_writer: self.script.fail_append_fails_writer,
        }
    }
}

/// 메모리 리더
pub struct MemoryReader {
    state: ReaderState,
    duration_ms: i64,
    start_error: Option<String>,
}

impl SampleReader for MemoryReader {
    fn start_reading(&self) -> Result<(), String> {
        if let Some(message) = &self.start_error {
            self.state.fail(message.clone());
            return Err(message.clone());
        }
        self.state.start()
    }

    fn status(&self) -> ReaderStatus {
        self.state.status()
    }

    fn error(&self) -> Option<String> {
        self.state.error()
    }

    fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    fn cancel_reading(&self) {
        self.state.cancel();
    }
}

struct MemoryOutput {
    kind: TrackKind,
    samples: VecDeque<Sample>,
    reader: Arc<MemoryReader>,
    fail_at: Option<usize>,
    emitted: usize,
    exhausted: bool,
}

impl MemoryOutput {
    fn new(
        kind: TrackKind,
        samples: VecDeque<Sample>,
        reader: Arc<MemoryReader>,
        fail_at: Option<usize>,
    ) -> Self {
        Self {
            kind,
            samples,
            reader,
            fail_at,
            emitted: 0,
            exhausted: false,
        }
    }
}

impl TrackOutput for MemoryOutput {
    fn copy_next_sample(&mut self) -> Option<Sample> {
        if self.exhausted || !self.reader.state.is_reading() {
            return None;
        }
        if self.fail_at == Some(self.emitted) {
            self.reader
                .state
                .fail(format!("{} sample {} is unreadable", self.kind, self.emitted + 1));
            return None;
        }
        match self.samples.pop_front() {
            Some(sample) => {
                self.emitted += 1;
                Some(sample)
            }
            None => {
                self.exhausted = true;
                self.reader.state.output_exhausted();
                None
            }
        }
    }
}

/// 트랙별 기록
#[derive(Debug, Default, Clone)]
pub struct TrackRecord {
    pub pts_ms: Vec<i64>,
    pub bytes: usize,
    /// mark_as_finished 호출 횟수
    pub finish_marks: usize,
}

/// finish_writing이 출력 위치에 남기는 요약
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryOutputSummary {
    pub container: ContainerFormat,
    pub video_samples: usize,
    pub audio_samples: usize,
    pub last_video_pts_ms: Option<i64>,
}

impl MemoryOutputSummary {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }
}

/// 메모리 라이터 - 받은 샘플의 pts만 기록
pub struct MemoryWriter {
    state: WriterState,
    location: PathBuf,
    container: ContainerFormat,
    records: Mutex<[TrackRecord; 2]>,
    primers: Mutex<Vec<Sender<()>>>,
    start_error: Option<String>,
    finish_error: Option<String>,
}

impl MemoryWriter {
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn record(&self, kind: TrackKind) -> TrackRecord {
        lock(&self.records)[kind.index()].clone()
    }

    pub fn appended(&self, kind: TrackKind) -> Vec<i64> {
        self.record(kind).pts_ms
    }

    pub fn finish_marks(&self, kind: TrackKind) -> usize {
        self.record(kind).finish_marks
    }

    /// Failed 전이 + 모든 입력 readiness 재신호 (대기 중인 드레인이 거부 경로로 끝나도록)
    fn fail(&self, message: String) {
        self.state.fail(message);
        self.wake_inputs();
    }

    fn wake_inputs(&self) {
        for primer in lock(&self.primers).iter() {
            let _ = primer.send(());
        }
    }

    fn summary(&self) -> MemoryOutputSummary {
        let records = lock(&self.records);
        let video = &records[TrackKind::Video.index()];
        MemoryOutputSummary {
            container: self.container,
            video_samples: video.pts_ms.len(),
            audio_samples: records[TrackKind::Audio.index()].pts_ms.len(),
            last_video_pts_ms: video.pts_ms.last().copied(),
        }
    }
}

impl SampleWriter for MemoryWriter {
    fn start_writing(&self) -> Result<(), String> {
        if let Some(message) = &self.start_error {
            self.state.fail(message.clone());
            return Err(message.clone());
        }
        self.state.start()?;
        if let Err(e) = std::fs::File::create(&self.location) {
            let message = format!("cannot create {}: {}", self.location.display(), e);
            self.state.fail(message.clone());
            return Err(message);
        }
        // 입력마다 첫 readiness
        self.wake_inputs();
        Ok(())
    }

    fn status(&self) -> WriterStatus {
        self.state.status()
    }

    fn error(&self) -> Option<String> {
        self.state.error()
    }

    fn finish_writing(&self) -> Result<(), String> {
        if let Some(message) = &self.finish_error {
            self.state.fail(message.clone());
            return Err(message.clone());
        }
        let summary = serde_json::to_string_pretty(&self.summary()).map_err(|e| e.to_string())?;
        if let Err(e) = std::fs::write(&self.location, summary) {
            let message = format!("cannot write {}: {}", self.location.display(), e);
            self.state.fail(message.clone());
            return Err(message);
        }
        self.state.complete()
    }

    fn cancel_writing(&self) {
        if self.state.cancel() {
            match std::fs::remove_file(&self.location) {
                Ok(()) => debug!("[EXPORT] 부분 출력 삭제: {}", self.location.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("[EXPORT] 부분 출력 삭제 실패: {}", e),
            }
        }
    }
}

/// 메모리 입력 - burst 개수마다 한 번 not-ready 후 readiness 재신호
struct MemoryInput {
    kind: TrackKind,
    writer: Arc<MemoryWriter>,
    gate: ReadinessGate,
    latency: Duration,
    fail_at: Option<usize>,
    fails_writer: bool,
}

impl TrackInput for MemoryInput {
    fn readiness(&self) -> Receiver<()> {
        self.gate.receiver()
    }

    /// not-ready는 backpressure일 때만. 라이터가 멈췄으면 append가 거부해서 트랙을 끝냄
    fn is_ready_for_more_data(&self) -> bool {
        !self.writer.state.is_writing() || self.gate.is_ready()
    }

    fn append(&mut self, sample: Sample) -> Result<(), String> {
        if !self.writer.state.is_writing() {
            return Err(format!("writer is {:?}", self.writer.state.status()));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut records = lock(&self.writer.records);
        let record = &mut records[self.kind.index()];
        if self.fail_at == Some(record.pts_ms.len()) {
            drop(records);
            let message = format!("{} input rejected sample at {}ms", self.kind, sample.pts_ms);
            if self.fails_writer {
                self.writer.fail(message.clone());
            }
            return Err(message);
        }
        record.pts_ms.push(sample.pts_ms);
        record.bytes += sample.data.len();
        drop(records);

        self.gate.record_append();
        Ok(())
    }

    fn mark_as_finished(&mut self) {
        lock(&self.writer.records)[self.kind.index()].finish_marks += 1;
    }
}
