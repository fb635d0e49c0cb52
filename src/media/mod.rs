// 미디어 협력자 인터페이스
// 리더(디코더/디먹서)와 라이터(인코더/먹서)를 엔진과 분리하는 경계

pub mod memory;
pub mod readiness;
pub mod status;

pub use readiness::ReadinessGate;
pub use status::{ReaderState, WriterState};

use crate::encoding::session::SessionLimiter;
use crate::encoding::{AudioSettings, ContainerFormat, VideoSettings};
use crate::timeline::{AudioMix, Timeline, VideoComposition};
use crossbeam_channel::Receiver;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// 트랙 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub const ALL: [TrackKind; 2] = [TrackKind::Video, TrackKind::Audio];

    /// 고정 크기 배열 인덱스
    pub fn index(self) -> usize {
        match self {
            TrackKind::Video => 0,
            TrackKind::Audio => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 디코딩된 미디어 샘플 (트랙 하나의 한 단위)
#[derive(Debug, Clone)]
pub struct Sample {
    pub track: TrackKind,
    /// 프레젠테이션 시간 (타임라인 기준 ms)
    pub pts_ms: i64,
    pub duration_ms: i64,
    /// 비디오: YUV420P 평면, 오디오: f32 interleaved PCM
    pub data: Vec<u8>,
}

/// 리더 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Unknown,
    Reading,
    Completed,
    Failed,
    Cancelled,
}

/// 라이터 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// 리더가 내보내는 비디오 프레임 형식 (라이터 source format hint)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
}

/// 리더가 내보내는 오디오 PCM 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 트랙 하나의 출력 (pull 방식)
pub trait TrackOutput: Send {
    /// 다음 샘플. None이면 스트림 끝이거나 읽기 실패 (리더 status로 구분)
    fn copy_next_sample(&mut self) -> Option<Sample>;
}

/// 트랙 하나의 입력 (push 방식 + readiness 신호)
pub trait TrackInput: Send {
    /// 데이터를 더 받을 수 있게 되면 `()` 하나가 도착하는 채널
    /// 채널이 끊기면 라이터가 사라진 것
    fn readiness(&self) -> Receiver<()>;

    fn is_ready_for_more_data(&self) -> bool;

    fn append(&mut self, sample: Sample) -> Result<(), String>;

    /// 더 이상 입력이 없음을 알림 (인코더 flush)
    fn mark_as_finished(&mut self);
}

/// 리더 (트랙 출력들의 공통 상태)
pub trait SampleReader: Send + Sync {
    fn start_reading(&self) -> Result<(), String>;
    fn status(&self) -> ReaderStatus;
    fn error(&self) -> Option<String>;
    /// 소스 전체 길이 (진행률 분모)
    fn duration_ms(&self) -> i64;
    fn cancel_reading(&self);
}

/// 라이터 (트랙 입력들의 공통 상태 + finalize)
pub trait SampleWriter: Send + Sync {
    /// 헤더 작성 + 세션 시작 (time zero), 입력들에 첫 readiness 신호
    fn start_writing(&self) -> Result<(), String>;
    fn status(&self) -> WriterStatus;
    fn error(&self) -> Option<String>;
    fn finish_writing(&self) -> Result<(), String>;
    /// 부분 기록된 출력 폐기
    fn cancel_writing(&self);
}

/// create_reader 결과
pub struct ReaderParts {
    pub reader: Arc<dyn SampleReader>,
    pub video: Box<dyn TrackOutput>,
    pub video_format: VideoFormat,
    /// 타임라인에 오디오 트랙이 없으면 None
    pub audio: Option<Box<dyn TrackOutput>>,
    pub audio_format: Option<AudioFormat>,
}

/// create_writer 결과
pub struct WriterParts {
    pub writer: Arc<dyn SampleWriter>,
    pub video: Box<dyn TrackInput>,
    pub audio: Option<Box<dyn TrackInput>>,
}

/// create_writer 파라미터
pub struct WriterRequest<'a> {
    pub location: &'a Path,
    pub container: ContainerFormat,
    pub video: &'a VideoSettings,
    pub video_source: VideoFormat,
    /// None이면 오디오 입력을 만들지 않음
    pub audio: Option<(&'a AudioSettings, AudioFormat)>,
}

/// 리더/라이터 생성기
pub trait MediaBackend: Send + Sync {
    fn create_reader(
        &self,
        timeline: &Timeline,
        composition: &VideoComposition,
        audio_mix: Option<&AudioMix>,
    ) -> Result<ReaderParts, String>;

    fn create_writer(&self, request: &WriterRequest<'_>) -> Result<WriterParts, String>;

    /// 백엔드 라이브러리가 동시 세션 수를 제한하면 공유 limiter 반환
    fn session_limiter(&self) -> Option<Arc<SessionLimiter>> {
        None
    }
}
