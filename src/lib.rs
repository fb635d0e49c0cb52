// VortexCut Export 엔진
// 타임라인 → 단일 출력 파일 (비디오 + 선택적 오디오 트랙 동시 드레인)

pub mod error;
pub mod media;
pub mod timeline;
pub mod encoding;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use encoding::{
    AudioSettings, ContainerFormat, ExportObserver, ExportSettings, Exporter, Outcome,
    SessionLimiter, SessionState, VideoSettings,
};
pub use error::ExportError;
pub use media::{MediaBackend, Sample, TrackKind};
pub use timeline::{AudioMix, Timeline, VideoComposition};

/// env_logger 초기화 (RUST_LOG 미설정 시 info, `debug_log` feature면 debug)
/// 여러 번 호출해도 안전 (테스트마다 호출)
pub fn init_logging() {
    let default_filter = if cfg!(feature = "debug_log") { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .is_test(cfg!(test))
    .try_init();
}
