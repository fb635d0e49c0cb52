// 오디오 믹서 - 구간에 걸친 모든 오디오 클립을 하나의 PCM 스트림으로 합성
// 오디오 드레인이 20ms 청크 단위로 호출

use super::audio_decoder::{AudioDecoder, MIX_CHANNELS, MIX_SAMPLE_RATE};
use crate::timeline::{AudioMix, Clip, Timeline};
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;

/// 출력 버퍼에 gain 적용 후 합산
pub fn accumulate(mixed: &mut [f32], samples: &[f32], gain: f32) {
    for (out, sample) in mixed.iter_mut().zip(samples) {
        *out += sample * gain;
    }
}

/// 합산 결과가 [-1, 1]을 넘은 샘플만 tanh로 눌러줌
pub fn soft_clip(mixed: &mut [f32]) {
    for sample in mixed.iter_mut() {
        if *sample > 1.0 || *sample < -1.0 {
            *sample = sample.tanh();
        }
    }
}

/// 구간 길이 → interleaved 샘플 수
pub fn samples_for(duration_ms: f64) -> usize {
    (duration_ms / 1000.0 * MIX_SAMPLE_RATE as f64) as usize * MIX_CHANNELS
}

pub struct AudioMixer {
    /// 파일별 디코더 (같은 파일의 클립은 디코더 공유)
    decoders: HashMap<PathBuf, AudioDecoder>,
}

impl AudioMixer {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// [start_ms, start_ms + duration_ms) 구간 믹스 (f32 interleaved stereo 48kHz)
    /// 파일을 열지 못하거나 디코딩이 실패하면 에러
    pub fn mix_range(
        &mut self,
        timeline: &Timeline,
        mix: Option<&AudioMix>,
        start_ms: i64,
        duration_ms: f64,
    ) -> Result<Vec<f32>, String> {
        let mut mixed = vec![0.0f32; samples_for(duration_ms)];
        let end_ms = start_ms + duration_ms.ceil() as i64;

        for (track_id, clip) in timeline.audio_clips_overlapping(start_ms, end_ms) {
            let gain = clip.volume * mix.map_or(1.0, |m| m.volume_for(track_id));
            if gain == 0.0 {
                continue;
            }
            let samples = self.decode_clip(clip, start_ms, duration_ms)?;
            accumulate(&mut mixed, &samples, gain);
        }

        soft_clip(&mut mixed);
        Ok(mixed)
    }

    /// 클립 범위 밖은 무음으로 두고 겹치는 부분만 채움
    fn decode_clip(
        &mut self,
        clip: &Clip,
        start_ms: i64,
        duration_ms: f64,
    ) -> Result<Vec<f32>, String> {
        let mut out = vec![0.0f32; samples_for(duration_ms)];

        let begin_ms = start_ms.max(clip.start_time_ms);
        let end_ms = (start_ms + duration_ms.ceil() as i64).min(clip.end_time_ms());
        if end_ms <= begin_ms {
            return Ok(out);
        }

        let decoder = match self.decoders.entry(clip.file_path.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                debug!("[EXPORT] 오디오 디코더 열기: {}", clip.file_path.display());
                entry.insert(AudioDecoder::open(&clip.file_path)?)
            }
        };

        let pcm = decoder.decode_range(clip.source_time_ms(begin_ms), (end_ms - begin_ms) as f64)?;
        let offset = samples_for((begin_ms - start_ms) as f64).min(out.len());
        let len = pcm.len().min(out.len() - offset);
        out[offset..offset + len].copy_from_slice(&pcm[..len]);
        Ok(out)
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}
