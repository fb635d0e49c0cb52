// 인코딩 & 내보내기 모듈
// 트랙별 드레인 루프 + join barrier + 세션 조정 → 단일 출력 파일

pub mod barrier;
pub mod drain;
pub mod exporter;
pub mod progress;
pub mod session;
pub mod settings;

pub use exporter::{CompletionCallback, ExportObserver, Exporter};
pub use session::{Outcome, SessionLimiter, SessionState, DEFAULT_SESSION_LIMIT};
pub use settings::{
    AudioCodec, AudioSettings, ContainerFormat, ExportSettings, VideoCodec, VideoProfile,
    VideoSettings,
};
