// 트랙 모듈 - 클립들을 담는 레이어

use super::clip::Clip;

/// 트랙 (비디오/오디오 공용, 종류는 Timeline의 소속 목록으로 구분)
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub index: usize,  // 트랙 순서 (0 = 최하단)
    pub clips: Vec<Clip>,
    pub enabled: bool,
    pub muted: bool,
}

impl Track {
    pub fn new(id: u64, index: usize) -> Self {
        Self {
            id,
            index,
            clips: Vec::new(),
            enabled: true,
            muted: false,
        }
    }

    /// 클립 추가 (시작 시간 기준 정렬 유지)
    pub fn add_clip(&mut self, clip: Clip) {
        self.clips.push(clip);
        self.clips.sort_by_key(|c| c.start_time_ms);
    }

    /// 출력에 기여하는 트랙인지
    pub fn is_active(&self) -> bool {
        self.enabled && !self.muted && !self.clips.is_empty()
    }

    /// 특정 시간에 활성화된 클립 (겹치면 나중에 시작한 클립)
    pub fn clip_at(&self, time_ms: i64) -> Option<&Clip> {
        if !self.enabled || self.muted {
            return None;
        }
        self.clips.iter().rev().find(|clip| clip.contains_time(time_ms))
    }

    /// [start_ms, end_ms) 구간과 겹치는 클립들
    pub fn clips_overlapping(&self, start_ms: i64, end_ms: i64) -> impl Iterator<Item = &Clip> {
        let active = self.enabled && !self.muted;
        self.clips
            .iter()
            .filter(move |clip| active && clip.overlaps(start_ms, end_ms))
    }

    pub fn end_time_ms(&self) -> i64 {
        self.clips.iter().map(Clip::end_time_ms).max().unwrap_or(0)
    }
}
