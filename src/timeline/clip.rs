// 클립 - 원본 파일의 한 구간을 타임라인 위치에 배치

use std::path::PathBuf;

/// 타임라인 클립 (비디오/오디오 공용)
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub id: u64,
    pub file_path: PathBuf,
    /// 타임라인상 시작 위치 (ms)
    pub start_time_ms: i64,
    pub duration_ms: i64,
    /// 원본 파일에서 잘라낸 앞부분 (ms)
    pub trim_start_ms: i64,
    pub volume: f32,
}

impl Clip {
    pub fn new(id: u64, file_path: PathBuf, start_time_ms: i64, duration_ms: i64) -> Self {
        Self {
            id,
            file_path,
            start_time_ms,
            duration_ms,
            trim_start_ms: 0,
            volume: 1.0,
        }
    }

    pub fn end_time_ms(&self) -> i64 {
        self.start_time_ms + self.duration_ms
    }

    /// [start, end) 구간 포함 여부
    pub fn contains_time(&self, time_ms: i64) -> bool {
        time_ms >= self.start_time_ms && time_ms < self.end_time_ms()
    }

    /// 타임라인 시간 → 원본 파일 시간
    pub fn source_time_ms(&self, timeline_ms: i64) -> i64 {
        self.trim_start_ms + (timeline_ms - self.start_time_ms)
    }

    /// [start_ms, end_ms) 구간과 겹치는지
    pub fn overlaps(&self, start_ms: i64, end_ms: i64) -> bool {
        start_ms < self.end_time_ms() && end_ms > self.start_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_time_mapping() {
        let mut clip = Clip::new(1, PathBuf::from("a.mp4"), 2000, 3000);
        clip.trim_start_ms = 500;

        assert_eq!(clip.end_time_ms(), 5000);
        assert!(clip.contains_time(2000));
        assert!(!clip.contains_time(5000));
        assert_eq!(clip.source_time_ms(2500), 1000);
    }

    #[test]
    fn test_clip_overlaps() {
        let clip = Clip::new(1, PathBuf::from("a.mp4"), 1000, 1000);
        assert!(clip.overlaps(500, 1001));
        assert!(clip.overlaps(1999, 3000));
        assert!(!clip.overlaps(2000, 3000));
        assert!(!clip.overlaps(0, 1000));
    }
}
