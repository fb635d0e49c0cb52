// 렌더링/믹싱 파라미터 - 리더 생성 시 트랙별로 전달

use super::timeline::Timeline;
use std::collections::HashMap;

/// 비디오 합성 설명 (출력 프레임 크기 + 프레임 간격)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoComposition {
    pub render_width: u32,
    pub render_height: u32,
    pub fps: f64,
}

impl VideoComposition {
    pub fn new(render_width: u32, render_height: u32, fps: f64) -> Self {
        Self { render_width, render_height, fps }
    }

    /// 타임라인 해상도/프레임레이트 그대로
    pub fn from_timeline(timeline: &Timeline) -> Self {
        Self::new(timeline.width, timeline.height, timeline.fps)
    }

    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.fps
    }

    /// 길이 duration_ms를 덮는 프레임 수
    pub fn frame_count(&self, duration_ms: i64) -> u64 {
        if duration_ms <= 0 || self.fps <= 0.0 {
            return 0;
        }
        ((duration_ms as f64) * self.fps / 1000.0).ceil() as u64
    }

    /// n번째 프레임의 타임라인 시간 (ms)
    pub fn frame_time_ms(&self, index: u64) -> i64 {
        (index as f64 * 1000.0 / self.fps) as i64
    }
}

/// 오디오 믹스 파라미터 (트랙별 볼륨)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioMix {
    track_volumes: HashMap<u64, f32>,
}

impl AudioMix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_volume(&mut self, track_id: u64, volume: f32) {
        self.track_volumes.insert(track_id, volume.max(0.0));
    }

    /// 지정하지 않은 트랙은 1.0
    pub fn volume_for(&self, track_id: u64) -> f32 {
        self.track_volumes.get(&track_id).copied().unwrap_or(1.0)
    }
}
