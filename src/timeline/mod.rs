// 타임라인 모듈 - Export 입력 (트랙/클립 구성 + 렌더링/믹싱 파라미터)
// 엔진은 읽기만 하고 편집하지 않는다

pub mod clip;
pub mod composition;
pub mod timeline;
pub mod track;

pub use clip::Clip;
pub use composition::{AudioMix, VideoComposition};
pub use timeline::Timeline;
pub use track::Track;
