// FFmpeg 리더 - 타임라인을 프레임/오디오 청크 순서대로 디코딩해 트랙 출력으로 내보냄
// 비디오: 합성 프레임 간격마다 가장 위 클립의 프레임 (클립 없으면 검은 화면)
// 오디오: 20ms마다 모든 오디오 클립 믹스

use super::audio_decoder::{MIX_CHANNELS, MIX_SAMPLE_RATE};
use super::audio_mixer::AudioMixer;
use super::decoder::{black_frame, ExportDecoder};
use crate::media::{ReaderState, ReaderStatus, Sample, SampleReader, TrackKind, TrackOutput};
use crate::timeline::{AudioMix, Timeline, VideoComposition};
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// 오디오 샘플 하나의 길이
pub const AUDIO_CHUNK_MS: i64 = 20;

pub struct FfmpegReader {
    state: ReaderState,
    duration_ms: i64,
}

impl FfmpegReader {
    pub fn new(outputs: usize, duration_ms: i64) -> Self {
        Self {
            state: ReaderState::new(outputs),
            duration_ms,
        }
    }
}

impl SampleReader for FfmpegReader {
    fn start_reading(&self) -> Result<(), String> {
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

/// 비디오 트랙 출력
pub struct VideoOutput {
    reader: Arc<FfmpegReader>,
    timeline: Arc<Timeline>,
    composition: VideoComposition,
    decoders: HashMap<PathBuf, ExportDecoder>,
    next_frame: u64,
    total_frames: u64,
    exhausted: bool,
}

impl VideoOutput {
    pub fn new(
        reader: Arc<FfmpegReader>,
        timeline: Arc<Timeline>,
        composition: VideoComposition,
    ) -> Self {
        let total_frames = composition.frame_count(timeline.duration_ms());
        Self {
            reader,
            timeline,
            composition,
            decoders: HashMap::new(),
            next_frame: 0,
            total_frames,
            exhausted: false,
        }
    }

    fn render(&mut self, time_ms: i64) -> Result<Vec<u8>, String> {
        let width = self.composition.render_width;
        let height = self.composition.render_height;

        let Some(clip) = self.timeline.video_clip_at(time_ms) else {
            return Ok(black_frame(width, height));
        };
        let source_ms = clip.source_time_ms(time_ms);

        let decoder = match self.decoders.entry(clip.file_path.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                debug!("[EXPORT] 비디오 디코더 열기: {}", clip.file_path.display());
                entry.insert(ExportDecoder::open(&clip.file_path, width, height)?)
            }
        };
        decoder.frame_at(source_ms)
    }
}

impl TrackOutput for VideoOutput {
    fn copy_next_sample(&mut self) -> Option<Sample> {
        if self.exhausted || !self.reader.state.is_reading() {
            return None;
        }
        if self.next_frame >= self.total_frames {
            self.exhausted = true;
            self.reader.state.output_exhausted();
            return None;
        }

        let pts_ms = self.composition.frame_time_ms(self.next_frame);
        let end_ms = self.composition.frame_time_ms(self.next_frame + 1);
        match self.render(pts_ms) {
            Ok(data) => {
                self.next_frame += 1;
                Some(Sample {
                    track: TrackKind::Video,
                    pts_ms,
                    duration_ms: end_ms - pts_ms,
                    data,
                })
            }
            Err(e) => {
                self.reader
                    .state
                    .fail(format!("video frame at {}ms: {}", pts_ms, e));
                None
            }
        }
    }
}

/// 오디오 트랙 출력
pub struct AudioOutput {
    reader: Arc<FfmpegReader>,
    timeline: Arc<Timeline>,
    mix: Option<AudioMix>,
    mixer: AudioMixer,
    next_pts_ms: i64,
    end_ms: i64,
    exhausted: bool,
}

impl AudioOutput {
    pub fn new(reader: Arc<FfmpegReader>, timeline: Arc<Timeline>, mix: Option<AudioMix>) -> Self {
        let end_ms = timeline.duration_ms();
        Self {
            reader,
            timeline,
            mix,
            mixer: AudioMixer::new(),
            next_pts_ms: 0,
            end_ms,
            exhausted: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        MIX_SAMPLE_RATE
    }

    pub fn channels(&self) -> u16 {
        MIX_CHANNELS as u16
    }
}

impl TrackOutput for AudioOutput {
    fn copy_next_sample(&mut self) -> Option<Sample> {
        if self.exhausted || !self.reader.state.is_reading() {
            return None;
        }
        if self.next_pts_ms >= self.end_ms {
            self.exhausted = true;
            self.reader.state.output_exhausted();
            return None;
        }

        let pts_ms = self.next_pts_ms;
        let duration_ms = AUDIO_CHUNK_MS.min(self.end_ms - pts_ms);
        let pcm = match self
            .mixer
            .mix_range(&self.timeline, self.mix.as_ref(), pts_ms, duration_ms as f64)
        {
            Ok(pcm) => pcm,
            Err(e) => {
                self.reader
                    .state
                    .fail(format!("audio mix at {}ms: {}", pts_ms, e));
                return None;
            }
        };

        self.next_pts_ms += duration_ms;
        Some(Sample {
            track: TrackKind::Audio,
            pts_ms,
            duration_ms,
            data: pcm.iter().flat_map(|s| s.to_le_bytes()).collect(),
        })
    }
}
