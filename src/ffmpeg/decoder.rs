// Export용 비디오 디코더 (ffmpeg-next)
// 타임라인 순서대로 요청되는 시간의 프레임을 YUV420P로 출력 (색공간 변환 없이 리사이즈만)

use ffmpeg_next as ffmpeg;
use log::warn;
use std::path::Path;

/// 이 범위 안의 전진은 seek 없이 디코딩으로 따라감
const FORWARD_DECODE_MS: i64 = 1_000;

/// 목표 PTS를 찾는 동안 읽을 최대 패킷 수
const MAX_PACKETS_PER_FRAME: usize = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Ready,
    /// 파일 끝 (이 위치 이후 요청은 마지막 프레임 반복)
    EndOfStream { at_ms: i64 },
}

/// 검은 YUV420P 프레임 (Y=16, U=V=128)
pub fn black_frame(width: u32, height: u32) -> Vec<u8> {
    let y_size = (width * height) as usize;
    let uv_size = ((width / 2) * (height / 2)) as usize;
    let mut data = vec![16u8; y_size + uv_size * 2];
    data[y_size..].fill(128);
    data
}

/// 파일 하나의 순차 디코더
pub struct ExportDecoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    frame_ms: i64,
    position_ms: i64,
    state: DecoderState,
    last_frame: Option<Vec<u8>>,
}

// FFmpeg 컨텍스트는 스레드 고정이 아님. 디코더는 비디오 드레인 스레드로 옮겨져 그 스레드에서만 사용됨
unsafe impl Send for ExportDecoder {}

impl ExportDecoder {
    /// 파일 열기 (출력 크기 width x height, LANCZOS)
    pub fn open(file_path: &Path, width: u32, height: u32) -> Result<Self, String> {
        // moov atom이 파일 끝에 있는 녹화본은 probesize를 늘려 재시도
        let input = ffmpeg::format::input(&file_path)
            .or_else(|_| {
                let mut opts = ffmpeg::Dictionary::new();
                opts.set("probesize", "100000000");
                opts.set("analyzeduration", "30000000");
                ffmpeg::format::input_with_dictionary(&file_path, opts)
            })
            .map_err(|e| format!("Failed to open {}: {}", file_path.display(), e))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| format!("No video stream in {}", file_path.display()))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let fps = f64::from(stream.avg_frame_rate());

        let mut context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| format!("Failed to create decoder context: {}", e))?;
        if let Ok(parallelism) = std::thread::available_parallelism() {
            context.set_threading(ffmpeg::threading::Config {
                kind: ffmpeg::threading::Type::Frame,
                count: parallelism.get().min(4),
            });
        }
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| format!("Failed to open video decoder: {}", e))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::Flags::LANCZOS,
        )
        .map_err(|e| format!("Failed to create scaler: {}", e))?;

        let frame_ms = if fps > 0.0 {
            (1000.0 / fps).max(1.0) as i64
        } else {
            33
        };

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            time_base,
            width,
            height,
            frame_ms,
            position_ms: -1,
            state: DecoderState::Ready,
            last_frame: None,
        })
    }

    fn ms_to_pts(&self, ms: i64) -> i64 {
        let num = i64::from(self.time_base.numerator()).max(1);
        (ms * i64::from(self.time_base.denominator())) / (num * 1000)
    }

    /// 원본 시간 source_ms의 프레임 (YUV420P 평면 연결)
    /// 파일 끝 이후는 마지막 프레임, 한 번도 못 읽었으면 검은 프레임
    pub fn frame_at(&mut self, source_ms: i64) -> Result<Vec<u8>, String> {
        if let DecoderState::EndOfStream { at_ms } = self.state {
            if source_ms >= at_ms {
                return Ok(self.fallback_frame());
            }
        }

        let backwards = source_ms < self.position_ms;
        let far_ahead = source_ms - self.position_ms > FORWARD_DECODE_MS;
        if self.position_ms < 0 || backwards || far_ahead {
            self.seek(source_ms)?;
        }
        self.position_ms = source_ms;

        let target_pts = self.ms_to_pts(source_ms);
        let tolerance_pts = self.ms_to_pts(self.frame_ms);
        let at_target = |frame: &ffmpeg::frame::Video| match frame.pts() {
            Some(pts) => pts >= target_pts - tolerance_pts,
            None => true,
        };

        // 디코더에 남은 프레임 먼저
        let mut found = None;
        let mut latest = None;
        loop {
            let mut frame = ffmpeg::frame::Video::empty();
            if self.decoder.receive_frame(&mut frame).is_err() {
                break;
            }
            if at_target(&frame) {
                found = Some(frame);
                break;
            }
        }

        let mut exhausted = true;
        if found.is_none() {
            let mut packets = 0usize;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                if let Err(e) = self.decoder.send_packet(&packet) {
                    warn!("[EXPORT] 패킷 디코딩 실패 ({}ms): {}", source_ms, e);
                }
                loop {
                    let mut frame = ffmpeg::frame::Video::empty();
                    if self.decoder.receive_frame(&mut frame).is_err() {
                        break;
                    }
                    if at_target(&frame) {
                        found = Some(frame);
                        break;
                    }
                    latest = Some(frame);
                }
                if found.is_some() {
                    exhausted = false;
                    break;
                }
                packets += 1;
                if packets > MAX_PACKETS_PER_FRAME {
                    exhausted = false;
                    break;
                }
            }
        }

        let raw = match found {
            Some(frame) => frame,
            None if exhausted => {
                // 원본이 타임라인 클립보다 짧음 → 마지막으로 본 프레임 유지
                self.state = DecoderState::EndOfStream { at_ms: source_ms };
                if let Some(frame) = latest {
                    let data = self.convert(&frame)?;
                    self.last_frame = Some(data);
                }
                return Ok(self.fallback_frame());
            }
            None => return Ok(self.fallback_frame()),
        };

        let data = self.convert(&raw)?;
        self.last_frame = Some(data.clone());
        self.state = DecoderState::Ready;
        Ok(data)
    }

    fn fallback_frame(&self) -> Vec<u8> {
        self.last_frame
            .clone()
            .unwrap_or_else(|| black_frame(self.width, self.height))
    }

    /// 스케일 후 Y/U/V 평면을 stride 없이 이어붙임
    fn convert(&mut self, raw: &ffmpeg::frame::Video) -> Result<Vec<u8>, String> {
        let mut scaled = ffmpeg::frame::Video::empty();
        self.scaler
            .run(raw, &mut scaled)
            .map_err(|e| format!("Failed to scale frame: {}", e))?;

        let planes = [
            (self.width as usize, self.height as usize),
            (self.width as usize / 2, self.height as usize / 2),
            (self.width as usize / 2, self.height as usize / 2),
        ];
        let total: usize = planes.iter().map(|(w, h)| w * h).sum();
        let mut data = Vec::with_capacity(total);

        for (index, (w, h)) in planes.iter().enumerate() {
            let src = scaled.data(index);
            let stride = scaled.stride(index);
            for row in 0..*h {
                let start = row * stride;
                let line = src
                    .get(start..start + w)
                    .ok_or_else(|| format!("Plane {} too small for {}x{}", index, w, h))?;
                data.extend_from_slice(line);
            }
        }

        Ok(data)
    }

    fn seek(&mut self, timestamp_ms: i64) -> Result<(), String> {
        // stream_index = -1 → AV_TIME_BASE(μs) 단위
        let timestamp_us = timestamp_ms.max(0) * 1000;
        self.input
            .seek(timestamp_us, ..timestamp_us)
            .map_err(|e| format!("Seek to {}ms failed: {}", timestamp_ms, e))?;
        self.decoder.flush();
        self.state = DecoderState::Ready;
        Ok(())
    }
}
