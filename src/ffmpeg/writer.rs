// FFmpeg 라이터 - 트랙별 인코더 (H.264/HEVC + AAC) → 단일 컨테이너 먹싱
// 입력들은 각자 드레인 스레드에서 인코딩하고 패킷 기록만 muxer 락으로 직렬화

use crate::encoding::{AudioSettings, ContainerFormat, VideoCodec, VideoSettings};
use crate::media::{
    AudioFormat, ReadinessGate, Sample, SampleWriter, TrackInput, WriterState, WriterStatus,
};
use crossbeam_channel::{Receiver, Sender};
use ffmpeg::codec;
use ffmpeg::format::Pixel;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg_next as ffmpeg;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// readiness 신호 하나당 append 수
const INPUT_BURST: usize = 4;

/// 인코더가 frame_size를 알려주지 않을 때 (AAC 기본)
const DEFAULT_AUDIO_FRAME_SIZE: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// mono/stereo만 지원
fn layouts(channels: u16) -> Result<(ChannelLayout<'static>, ChannelLayoutMask), String> {
    match channels {
        1 => Ok((ChannelLayout::MONO, ChannelLayoutMask::MONO)),
        2 => Ok((ChannelLayout::STEREO, ChannelLayoutMask::STEREO)),
        n => Err(format!("unsupported audio channel count: {}", n)),
    }
}

/// 출력 컨텍스트 (cancel 시 닫혀서 None)
struct Muxer {
    output: Option<ffmpeg::format::context::Output>,
}

// AVFormatContext는 항상 Mutex 안에서만 접근
unsafe impl Send for Muxer {}

impl Muxer {
    fn write_packets(
        &mut self,
        encoder: &mut ffmpeg::encoder::Encoder,
        stream_index: usize,
        encoder_time_base: ffmpeg::Rational,
    ) -> Result<(), String> {
        let output = self.output.as_mut().ok_or("muxer is closed")?;
        let stream_time_base = output
            .stream(stream_index)
            .ok_or("output stream not found")?
            .time_base();

        let mut packet = ffmpeg::Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(stream_index);
            packet.rescale_ts(encoder_time_base, stream_time_base);
            packet
                .write_interleaved(output)
                .map_err(|e| format!("Failed to write packet: {}", e))?;
        }
        Ok(())
    }
}

pub struct FfmpegWriter {
    state: WriterState,
    location: PathBuf,
    muxer: Mutex<Muxer>,
    primers: Mutex<Vec<Sender<()>>>,
}

impl FfmpegWriter {
    /// 출력 컨텍스트 생성 (스트림은 입력 생성 시 추가)
    pub fn open(location: &Path, container: ContainerFormat) -> Result<Self, String> {
        let output = ffmpeg::format::output_as(&location, container.muxer_name())
            .map_err(|e| format!("Failed to create output {}: {}", location.display(), e))?;
        Ok(Self {
            state: WriterState::new(),
            location: location.to_path_buf(),
            muxer: Mutex::new(Muxer {
                output: Some(output),
            }),
            primers: Mutex::new(Vec::new()),
        })
    }

    /// Failed 전이 + 모든 입력 readiness 재신호 (대기 중인 드레인이 거부 경로로 끝나도록)
    fn fail(&self, message: String) -> String {
        self.state.fail(message.clone());
        self.wake_inputs();
        message
    }

    fn wake_inputs(&self) {
        for primer in lock(&self.primers).iter() {
            let _ = primer.send(());
        }
    }

    fn needs_global_header(&self) -> Result<bool, String> {
        let muxer = lock(&self.muxer);
        let output = muxer.output.as_ref().ok_or("muxer is closed")?;
        Ok(output
            .format()
            .flags()
            .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER))
    }
}

impl SampleWriter for FfmpegWriter {
    fn start_writing(&self) -> Result<(), String> {
        self.state.start()?;
        {
            let mut muxer = lock(&self.muxer);
            let output = muxer.output.as_mut().ok_or("muxer is closed")?;
            output
                .write_header()
                .map_err(|e| self.fail(format!("Failed to write header: {}", e)))?;
        }
        self.wake_inputs();
        Ok(())
    }

    fn status(&self) -> WriterStatus {
        self.state.status()
    }

    fn error(&self) -> Option<String> {
        self.state.error()
    }

    fn finish_writing(&self) -> Result<(), String> {
        {
            let mut muxer = lock(&self.muxer);
            let output = muxer.output.as_mut().ok_or("muxer is closed")?;
            output
                .write_trailer()
                .map_err(|e| self.fail(format!("Failed to write trailer: {}", e)))?;
            // 파일 닫기
            muxer.output = None;
        }
        self.state.complete()
    }

    fn cancel_writing(&self) {
        if !self.state.cancel() {
            return;
        }
        lock(&self.muxer).output = None;
        match std::fs::remove_file(&self.location) {
            Ok(()) => debug!("[EXPORT] 부분 출력 삭제: {}", self.location.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("[EXPORT] 부분 출력 삭제 실패: {}", e),
        }
    }
}

/// GLOBAL_HEADER 플래그 (MP4 계열 컨테이너)
fn set_global_header(context: &mut codec::context::Context) {
    unsafe {
        (*context.as_mut_ptr()).flags |= codec::flag::Flags::GLOBAL_HEADER.bits() as i32;
    }
}

/// 비디오 입력 - YUV420P 샘플 → 인코더 (time base 1/1000, pts = 타임라인 ms)
pub struct VideoInput {
    writer: Arc<FfmpegWriter>,
    encoder: ffmpeg::encoder::Video,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    gate: ReadinessGate,
    flushed: bool,
}

// 인코더는 비디오 드레인 스레드에서만 사용
unsafe impl Send for VideoInput {}

impl VideoInput {
    pub fn new(writer: &Arc<FfmpegWriter>, settings: &VideoSettings) -> Result<Self, String> {
        let codec_id = match settings.codec {
            VideoCodec::H264 => codec::Id::H264,
            VideoCodec::Hevc => codec::Id::HEVC,
        };
        let codec = ffmpeg::encoder::find(codec_id)
            .ok_or_else(|| format!("{:?} encoder not found", settings.codec))?;
        let global_header = writer.needs_global_header()?;
        let time_base = ffmpeg::Rational::new(1, 1000);

        let mut muxer = lock(&writer.muxer);
        let output = muxer.output.as_mut().ok_or("muxer is closed")?;
        let mut stream = output
            .add_stream(codec)
            .map_err(|e| format!("Failed to add video stream: {}", e))?;
        let stream_index = stream.index();

        let mut context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| format!("Failed to create encoder context: {}", e))?;
        if global_header {
            set_global_header(&mut context);
        }
        let mut encoder = context
            .encoder()
            .video()
            .map_err(|e| format!("Failed to get video encoder: {}", e))?;

        let fps = settings.expected_frame_rate as i32;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(fps, 1)));
        encoder.set_bit_rate(settings.average_bit_rate as usize);
        encoder.set_gop(fps.max(1) as u32 * 2);

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("preset", "medium");
        if settings.codec == VideoCodec::H264 {
            opts.set("profile", settings.profile.as_str());
        }

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| format!("Failed to open video encoder: {}", e))?;
        stream.set_parameters(&encoder);
        drop(muxer);

        let gate = ReadinessGate::new(INPUT_BURST);
        lock(&writer.primers).push(gate.primer());

        Ok(Self {
            writer: writer.clone(),
            encoder,
            stream_index,
            time_base,
            width: settings.width,
            height: settings.height,
            gate,
            flushed: false,
        })
    }

    fn frame_from(&self, data: &[u8]) -> Result<ffmpeg::frame::Video, String> {
        let w = self.width as usize;
        let h = self.height as usize;
        let expected = w * h * 3 / 2;
        if data.len() != expected {
            return Err(format!(
                "Invalid frame data size: got {}, expected {} ({}x{} YUV420P)",
                data.len(),
                expected,
                w,
                h
            ));
        }

        let mut frame = ffmpeg::frame::Video::new(Pixel::YUV420P, self.width, self.height);
        let planes = [(w, h, 0usize), (w / 2, h / 2, w * h), (w / 2, h / 2, w * h + w * h / 4)];
        for (index, (pw, ph, offset)) in planes.into_iter().enumerate() {
            let stride = frame.stride(index);
            let dst = frame.data_mut(index);
            for row in 0..ph {
                let src = offset + row * pw;
                dst[row * stride..row * stride + pw].copy_from_slice(&data[src..src + pw]);
            }
        }
        Ok(frame)
    }

    fn write_packets(&mut self) -> Result<(), String> {
        let result = lock(&self.writer.muxer).write_packets(
            &mut self.encoder,
            self.stream_index,
            self.time_base,
        );
        result.map_err(|e| self.writer.fail(e))
    }
}

impl TrackInput for VideoInput {
    fn readiness(&self) -> Receiver<()> {
        self.gate.receiver()
    }

    /// not-ready는 backpressure일 때만. 라이터가 멈췄으면 append가 거부해서 트랙을 끝냄
    fn is_ready_for_more_data(&self) -> bool {
        !self.writer.state.is_writing() || self.gate.is_ready()
    }

    fn append(&mut self, sample: Sample) -> Result<(), String> {
        if !self.writer.state.is_writing() {
            return Err(format!("writer is {:?}", self.writer.state.status()));
        }
        let mut frame = self.frame_from(&sample.data)?;
        frame.set_pts(Some(sample.pts_ms));
        self.encoder
            .send_frame(&frame)
            .map_err(|e| format!("Failed to send frame at {}ms: {}", sample.pts_ms, e))?;
        self.write_packets()?;
        self.gate.record_append();
        Ok(())
    }

    fn mark_as_finished(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        if !self.writer.state.is_writing() {
            return;
        }
        if let Err(e) = self.encoder.send_eof() {
            warn!("[EXPORT] 비디오 인코더 flush 실패: {}", e);
            return;
        }
        if let Err(e) = self.write_packets() {
            warn!("[EXPORT] 비디오 패킷 기록 실패: {}", e);
        }
    }
}

/// 오디오 입력 - f32 interleaved PCM → 리샘플 (FLTP) → frame_size 단위 AAC 인코딩
pub struct AudioInput {
    writer: Arc<FfmpegWriter>,
    encoder: ffmpeg::encoder::Audio,
    resampler: ffmpeg::software::resampling::Context,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    layout: ChannelLayoutMask,
    source: AudioFormat,
    source_layout: ChannelLayoutMask,
    rate: u32,
    /// 채널별 대기 샘플
    fifo: Vec<Vec<f32>>,
    frame_size: usize,
    samples_written: i64,
    gate: ReadinessGate,
    flushed: bool,
}

// 인코더/리샘플러는 오디오 드레인 스레드에서만 사용
unsafe impl Send for AudioInput {}

impl AudioInput {
    pub fn new(
        writer: &Arc<FfmpegWriter>,
        settings: &AudioSettings,
        source: AudioFormat,
    ) -> Result<Self, String> {
        let codec = ffmpeg::encoder::find(codec::Id::AAC).ok_or("AAC encoder not found")?;
        let global_header = writer.needs_global_header()?;
        let rate = settings.sample_rate;
        let channels = usize::from(settings.channels);
        let (layout, layout_mask) = layouts(settings.channels)?;
        let (source_layout, source_mask) = layouts(source.channels)?;
        let time_base = ffmpeg::Rational::new(1, rate as i32);
        let format = ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar);

        let mut muxer = lock(&writer.muxer);
        let output = muxer.output.as_mut().ok_or("muxer is closed")?;
        let mut stream = output
            .add_stream(codec)
            .map_err(|e| format!("Failed to add audio stream: {}", e))?;
        let stream_index = stream.index();

        let mut context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| format!("Failed to create audio encoder context: {}", e))?;
        if global_header {
            set_global_header(&mut context);
        }
        let mut encoder = context
            .encoder()
            .audio()
            .map_err(|e| format!("Failed to get audio encoder: {}", e))?;

        encoder.set_rate(rate as i32);
        encoder.set_ch_layout(layout.clone());
        encoder.set_format(format);
        encoder.set_bit_rate(settings.bit_rate as usize);
        encoder.set_time_base(time_base);

        let encoder = encoder
            .open_with(ffmpeg::Dictionary::new())
            .map_err(|e| format!("Failed to open audio encoder: {}", e))?;
        stream.set_parameters(&encoder);
        drop(muxer);

        let resampler = ffmpeg::software::resampling::Context::get2(
            ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
            source_layout,
            source.sample_rate,
            format,
            layout,
            rate,
        )
        .map_err(|e| format!("Failed to create resampler: {}", e))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => DEFAULT_AUDIO_FRAME_SIZE,
            n => n,
        };

        let gate = ReadinessGate::new(INPUT_BURST);
        lock(&writer.primers).push(gate.primer());

        Ok(Self {
            writer: writer.clone(),
            encoder,
            resampler,
            stream_index,
            time_base,
            layout: layout_mask,
            source,
            source_layout: source_mask,
            rate,
            fifo: vec![Vec::new(); channels],
            frame_size,
            samples_written: 0,
            gate,
            flushed: false,
        })
    }

    /// 리샘플 결과를 채널별 FIFO에 쌓음
    fn push_pcm(&mut self, data: &[u8]) -> Result<(), String> {
        let source_channels = usize::from(self.source.channels).max(1);
        let count = data.len() / 4 / source_channels;
        if count == 0 {
            return Ok(());
        }

        let mut src = ffmpeg::frame::Audio::new(
            ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed),
            count,
            self.source_layout,
        );
        src.set_rate(self.source.sample_rate);
        let bytes = count * source_channels * 4;
        src.data_mut(0)[..bytes].copy_from_slice(&data[..bytes]);

        let mut resampled = ffmpeg::frame::Audio::empty();
        self.resampler
            .run(&src, &mut resampled)
            .map_err(|e| format!("Resample failed: {}", e))?;

        let produced = resampled.samples();
        for (channel, queue) in self.fifo.iter_mut().enumerate() {
            let plane = resampled.data(channel);
            queue.extend(
                plane[..(produced * 4).min(plane.len())]
                    .chunks_exact(4)
                    .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            );
        }
        Ok(())
    }

    /// FIFO에서 frame_size만큼 꺼내 인코딩 (pad면 부족분을 무음으로 채움)
    fn encode_ready_frames(&mut self, pad: bool) -> Result<(), String> {
        loop {
            let available = self.fifo.first().map_or(0, Vec::len);
            if available == 0 || (available < self.frame_size && !pad) {
                return Ok(());
            }
            let take = available.min(self.frame_size);

            let mut frame = ffmpeg::frame::Audio::new(
                ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar),
                self.frame_size,
                self.layout,
            );
            frame.set_rate(self.rate);
            for (channel, queue) in self.fifo.iter_mut().enumerate() {
                let dst = frame.data_mut(channel);
                dst.fill(0);
                for (i, sample) in queue.drain(..take).enumerate() {
                    dst[i * 4..i * 4 + 4].copy_from_slice(&sample.to_ne_bytes());
                }
            }
            frame.set_pts(Some(self.samples_written));
            self.samples_written += self.frame_size as i64;

            self.encoder
                .send_frame(&frame)
                .map_err(|e| format!("Failed to send audio frame: {}", e))?;
            self.write_packets()?;
        }
    }

    fn write_packets(&mut self) -> Result<(), String> {
        let result = lock(&self.writer.muxer).write_packets(
            &mut self.encoder,
            self.stream_index,
            self.time_base,
        );
        result.map_err(|e| self.writer.fail(e))
    }
}

impl TrackInput for AudioInput {
    fn readiness(&self) -> Receiver<()> {
        self.gate.receiver()
    }

    fn is_ready_for_more_data(&self) -> bool {
        !self.writer.state.is_writing() || self.gate.is_ready()
    }

    fn append(&mut self, sample: Sample) -> Result<(), String> {
        if !self.writer.state.is_writing() {
            return Err(format!("writer is {:?}", self.writer.state.status()));
        }
        self.push_pcm(&sample.data)?;
        self.encode_ready_frames(false)?;
        self.gate.record_append();
        Ok(())
    }

    fn mark_as_finished(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        if !self.writer.state.is_writing() {
            return;
        }
        let flushed = self
            .encode_ready_frames(true)
            .and_then(|_| {
                self.encoder
                    .send_eof()
                    .map_err(|e| format!("Failed to flush audio encoder: {}", e))
            })
            .and_then(|_| self.write_packets());
        if let Err(e) = flushed {
            warn!("[EXPORT] 오디오 인코더 flush 실패: {}", e);
        }
    }
}
