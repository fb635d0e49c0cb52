// Export 에러 타입

use crate::media::TrackKind;
use thiserror::Error;

/// Export 세션 에러
///
/// 백엔드(리더/라이터)는 `String` 메시지로 실패를 보고하고,
/// 엔진이 이 타입으로 감싸서 분류한다.
#[derive(Error, Debug)]
pub enum ExportError {
    /// 리더/라이터 생성 또는 시작 실패 (드레인 루프 진입 전)
    #[error("construction failed: {0}")]
    Construction(String),

    /// 트랙 하나의 샘플 읽기/쓰기 실패
    #[error("{track} track sample I/O failed: {message}")]
    SampleIo { track: TrackKind, message: String },

    /// 정상 종료 후 finalize(flush/trailer) 실패
    #[error("finalize failed: {0}")]
    Finalize(String),

    /// 취소로 끝난 세션의 `last_error`
    #[error("export cancelled")]
    Cancelled,

    /// 이전 세션이 아직 종료되지 않음
    #[error("an export session is already running")]
    SessionActive,

    /// 완료 콜백 안에서 같은 Exporter로 export 호출
    #[error("export() called from the exporter's own coordination thread")]
    ReentrantStart,

    #[error("too many concurrent export sessions (limit {0})")]
    TooManySessions(usize),

    #[error("export scope '{0}' is already in use")]
    ScopeBusy(String),

    #[error("invalid export settings: {0}")]
    InvalidSettings(String),

    /// 조정 스레드가 종료됨
    #[error("export coordinator is not running")]
    CoordinatorGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        ExportError::InvalidSettings(e.to_string())
    }
}
