// 타임라인 모듈 - Export 대상 프로젝트 구성

use super::clip::Clip;
use super::track::Track;
use std::path::PathBuf;

/// 타임라인 - 비디오/오디오 트랙 목록
#[derive(Debug, Clone)]
pub struct Timeline {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_tracks: Vec<Track>,
    pub audio_tracks: Vec<Track>,
    next_clip_id: u64,
    next_track_id: u64,
}

impl Timeline {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            video_tracks: Vec::new(),
            audio_tracks: Vec::new(),
            next_clip_id: 1,
            next_track_id: 1,
        }
    }

    pub fn add_video_track(&mut self) -> u64 {
        let id = self.allocate_track_id();
        let index = self.video_tracks.len();
        self.video_tracks.push(Track::new(id, index));
        id
    }

    pub fn add_audio_track(&mut self) -> u64 {
        let id = self.allocate_track_id();
        let index = self.audio_tracks.len();
        self.audio_tracks.push(Track::new(id, index));
        id
    }

    /// 클립 추가 (비디오/오디오 트랙 모두 검색), 트랙이 없으면 None
    pub fn add_clip(
        &mut self,
        track_id: u64,
        file_path: impl Into<PathBuf>,
        start_time_ms: i64,
        duration_ms: i64,
    ) -> Option<u64> {
        let clip_id = self.next_clip_id;
        let track = self.track_mut(track_id)?;
        track.add_clip(Clip::new(clip_id, file_path.into(), start_time_ms, duration_ms));
        self.next_clip_id += 1;
        Some(clip_id)
    }

    pub fn track_mut(&mut self, track_id: u64) -> Option<&mut Track> {
        self.video_tracks
            .iter_mut()
            .chain(self.audio_tracks.iter_mut())
            .find(|t| t.id == track_id)
    }

    /// 타임라인 총 길이 (ms)
    pub fn duration_ms(&self) -> i64 {
        self.video_tracks
            .iter()
            .chain(self.audio_tracks.iter())
            .map(Track::end_time_ms)
            .max()
            .unwrap_or(0)
    }

    /// 오디오 출력이 필요한지 (활성 오디오 트랙 존재)
    pub fn has_audio(&self) -> bool {
        self.audio_tracks.iter().any(Track::is_active)
    }

    /// 특정 시간에 보이는 비디오 클립 (가장 위 트랙 우선)
    pub fn video_clip_at(&self, time_ms: i64) -> Option<&Clip> {
        self.video_tracks
            .iter()
            .rev()
            .find_map(|track| track.clip_at(time_ms))
    }

    /// [start_ms, end_ms) 구간에 소리를 내는 (트랙 ID, 클립) 목록
    pub fn audio_clips_overlapping(&self, start_ms: i64, end_ms: i64) -> Vec<(u64, &Clip)> {
        self.audio_tracks
            .iter()
            .flat_map(|track| {
                track
                    .clips_overlapping(start_ms, end_ms)
                    .map(move |clip| (track.id, clip))
            })
            .collect()
    }

    fn allocate_track_id(&mut self) -> u64 {
        let id = self.next_track_id;
        self.next_track_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_tracks() {
        let mut timeline = Timeline::new(1920, 1080, 30.0);

        let video_track_id = timeline.add_video_track();
        let audio_track_id = timeline.add_audio_track();

        assert_eq!(timeline.video_tracks[0].id, video_track_id);
        assert_eq!(timeline.audio_tracks[0].id, audio_track_id);
        assert_ne!(video_track_id, audio_track_id);
    }

    #[test]
    fn test_add_clip_to_missing_track() {
        let mut timeline = Timeline::new(1920, 1080, 30.0);
        assert!(timeline.add_clip(42, PathBuf::from("v.mp4"), 0, 1000).is_none());
    }

    #[test]
    fn test_timeline_duration() {
        let mut timeline = Timeline::new(1920, 1080, 30.0);
        let video = timeline.add_video_track();
        let audio = timeline.add_audio_track();

        timeline.add_clip(video, PathBuf::from("v1.mp4"), 0, 5000);
        timeline.add_clip(video, PathBuf::from("v2.mp4"), 5000, 3000);
        timeline.add_clip(audio, PathBuf::from("a1.mp3"), 0, 10000);

        assert_eq!(timeline.duration_ms(), 10000);
        assert!(timeline.has_audio());
    }

    #[test]
    fn test_has_audio_ignores_empty_and_muted_tracks() {
        let mut timeline = Timeline::new(1280, 720, 30.0);
        let video = timeline.add_video_track();
        timeline.add_clip(video, PathBuf::from("v.mp4"), 0, 2000);
        assert!(!timeline.has_audio());

        let audio = timeline.add_audio_track();
        assert!(!timeline.has_audio());

        timeline.add_clip(audio, PathBuf::from("a.m4a"), 0, 2000);
        timeline.track_mut(audio).unwrap().muted = true;
        assert!(!timeline.has_audio());
    }

    #[test]
    fn test_video_clip_at_prefers_upper_track() {
        let mut timeline = Timeline::new(1920, 1080, 30.0);
        let lower = timeline.add_video_track();
        let upper = timeline.add_video_track();

        let base = timeline.add_clip(lower, PathBuf::from("base.mp4"), 0, 5000).unwrap();
        let overlay = timeline.add_clip(upper, PathBuf::from("top.mp4"), 2000, 1000).unwrap();

        assert_eq!(timeline.video_clip_at(1000).map(|c| c.id), Some(base));
        assert_eq!(timeline.video_clip_at(2500).map(|c| c.id), Some(overlay));
        assert_eq!(timeline.video_clip_at(3500).map(|c| c.id), Some(base));
    }

    #[test]
    fn test_audio_clips_overlapping_reports_track() {
        let mut timeline = Timeline::new(1920, 1080, 30.0);
        let music = timeline.add_audio_track();
        let voice = timeline.add_audio_track();
        timeline.add_clip(music, PathBuf::from("m.mp3"), 0, 10000);
        timeline.add_clip(voice, PathBuf::from("v.wav"), 4000, 1000);

        let at_start = timeline.audio_clips_overlapping(0, 20);
        assert_eq!(at_start.len(), 1);
        assert_eq!(at_start[0].0, music);

        let mid = timeline.audio_clips_overlapping(4000, 4020);
        assert_eq!(mid.len(), 2);
    }
}
