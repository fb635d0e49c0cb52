// 오디오 디코더 - 파일 하나를 f32 stereo 48kHz PCM 구간으로 디코딩
// 프레임 경계 ≠ 요청 구간 경계이므로 초과 샘플은 다음 요청으로 이월

use ffmpeg_next as ffmpeg;
use std::path::Path;

pub const MIX_SAMPLE_RATE: u32 = 48_000;
pub const MIX_CHANNELS: usize = 2;

/// 현재 위치에서 이 범위 안의 전진은 seek 없이 이어서 디코딩
const SEQUENTIAL_WINDOW_MS: i64 = 1_000;

pub struct AudioDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Audio,
    resampler: ffmpeg::software::resampling::Context,
    time_base: ffmpeg::Rational,
    input_rate: u32,
    position_ms: i64,
    /// 이전 요청에서 초과 디코딩된 interleaved 샘플
    carry: Vec<f32>,
}

// 비디오 디코더와 같은 이유로 오디오 드레인 스레드에서만 사용
unsafe impl Send for AudioDecoder {}

/// seek 직후 프레임 처리
enum Lead {
    /// 프레임 전체가 목표 이전
    Drop,
    /// 리샘플 후 앞에서 n개 버림
    Trim(usize),
    Keep,
}

impl AudioDecoder {
    pub fn open(file_path: &Path) -> Result<Self, String> {
        let input = ffmpeg::format::input(&file_path)
            .map_err(|e| format!("Failed to open {}: {}", file_path.display(), e))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Audio)
            .ok_or_else(|| format!("No audio stream in {}", file_path.display()))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| format!("Failed to create audio context: {}", e))?
            .decoder()
            .audio()
            .map_err(|e| format!("Failed to open audio decoder: {}", e))?;

        let resampler = ffmpeg::software::resampling::Context::get(
            decoder.format(),
            decoder.channel_layout(),
            decoder.rate(),
            ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
            ffmpeg::ChannelLayout::STEREO,
            MIX_SAMPLE_RATE,
        )
        .map_err(|e| format!("Failed to create resampler: {}", e))?;

        let input_rate = decoder.rate();
        Ok(Self {
            input,
            stream_index,
            decoder,
            resampler,
            time_base,
            input_rate,
            position_ms: -1,
            carry: Vec::new(),
        })
    }

    fn pts_to_ms(&self, pts: i64) -> i64 {
        let den = i64::from(self.time_base.denominator()).max(1);
        (pts * i64::from(self.time_base.numerator()) * 1000) / den
    }

    fn lead(&self, frame: &ffmpeg::frame::Audio, target_ms: i64) -> Lead {
        let Some(pts) = frame.pts() else {
            return Lead::Keep;
        };
        let start_ms = self.pts_to_ms(pts);
        let length_ms = if self.input_rate > 0 {
            frame.samples() as i64 * 1000 / i64::from(self.input_rate)
        } else {
            0
        };

        if start_ms + length_ms <= target_ms {
            Lead::Drop
        } else if start_ms < target_ms {
            let skip_ms = (target_ms - start_ms) as usize;
            Lead::Trim(skip_ms * MIX_SAMPLE_RATE as usize * MIX_CHANNELS / 1000)
        } else {
            Lead::Keep
        }
    }

    /// [start_ms, start_ms + duration_ms) 구간 PCM (f32 interleaved stereo)
    /// 파일 끝을 넘으면 무음으로 채움
    pub fn decode_range(&mut self, start_ms: i64, duration_ms: f64) -> Result<Vec<f32>, String> {
        let wanted = (duration_ms / 1000.0 * MIX_SAMPLE_RATE as f64) as usize * MIX_CHANNELS;

        let mut trimming = false;
        if self.position_ms < 0
            || start_ms < self.position_ms
            || start_ms > self.position_ms + SEQUENTIAL_WINDOW_MS
        {
            self.seek(start_ms)?;
            trimming = true;
        }

        let mut out = std::mem::take(&mut self.carry);

        while out.len() < wanted {
            let mut frame = ffmpeg::frame::Audio::empty();
            if self.decoder.receive_frame(&mut frame).is_ok() {
                let lead = if trimming {
                    self.lead(&frame, start_ms)
                } else {
                    Lead::Keep
                };
                match lead {
                    Lead::Drop => continue,
                    Lead::Trim(skip) => {
                        trimming = false;
                        let pcm = self.resample(&frame)?;
                        out.extend_from_slice(pcm.get(skip..).unwrap_or_default());
                    }
                    Lead::Keep => {
                        trimming = false;
                        out.extend(self.resample(&frame)?);
                    }
                }
                continue;
            }

            // 디코더가 비었으면 다음 오디오 패킷
            let mut fed = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() == self.stream_index {
                    let _ = self.decoder.send_packet(&packet);
                    fed = true;
                    break;
                }
            }
            if !fed {
                break;
            }
        }

        if out.len() > wanted {
            self.carry = out.split_off(wanted);
        } else {
            out.resize(wanted, 0.0);
        }
        self.position_ms = start_ms + duration_ms.ceil() as i64;
        Ok(out)
    }

    fn resample(&mut self, frame: &ffmpeg::frame::Audio) -> Result<Vec<f32>, String> {
        let mut resampled = ffmpeg::frame::Audio::empty();
        self.resampler
            .run(frame, &mut resampled)
            .map_err(|e| format!("Resample failed: {}", e))?;

        let count = resampled.samples() * MIX_CHANNELS;
        let bytes = resampled.data(0);
        if bytes.len() < count * 4 {
            return Ok(vec![0.0; count]);
        }
        Ok(bytes[..count * 4]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn seek(&mut self, timestamp_ms: i64) -> Result<(), String> {
        let timestamp_us = timestamp_ms.max(0) * 1000;
        self.input
            .seek(timestamp_us, ..timestamp_us)
            .map_err(|e| format!("Audio seek to {}ms failed: {}", timestamp_ms, e))?;
        self.decoder.flush();
        self.carry.clear();
        self.position_ms = timestamp_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    #[ignore] // 실제 오디오 파일 필요
    fn test_decode_range_length() {
        ffmpeg::init().unwrap();
        let mut decoder = AudioDecoder::open(&PathBuf::from("test.wav")).unwrap();
        let pcm = decoder.decode_range(0, 20.0).unwrap();
        assert_eq!(pcm.len(), 960 * MIX_CHANNELS);
        let next = decoder.decode_range(20, 20.0).unwrap();
        assert_eq!(next.len(), 960 * MIX_CHANNELS);
    }
}
