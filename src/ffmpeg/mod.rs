// FFmpeg 백엔드 (ffmpeg feature)
// 타임라인 디코딩/믹싱 → 트랙 출력, 트랙 입력 → H.264/HEVC + AAC 인코딩 → 컨테이너 먹싱

pub mod audio_decoder;
pub mod audio_mixer;
pub mod decoder;
pub mod reader;
pub mod writer;

pub use reader::FfmpegReader;
pub use writer::FfmpegWriter;

use crate::encoding::session::SessionLimiter;
use crate::media::{
    AudioFormat, MediaBackend, ReaderParts, TrackInput, TrackOutput, VideoFormat, WriterParts,
    WriterRequest,
};
use crate::timeline::{AudioMix, Timeline, VideoComposition};
use ffmpeg_next as ffmpeg;
use log::info;
use reader::{AudioOutput, VideoOutput};
use std::sync::Arc;
use writer::{AudioInput, VideoInput};

pub struct FfmpegBackend {
    limiter: Arc<SessionLimiter>,
}

impl FfmpegBackend {
    /// FFmpeg 초기화 (로그는 에러만)
    pub fn new() -> Result<Self, String> {
        ffmpeg::init().map_err(|e| format!("FFmpeg init failed: {}", e))?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        info!("[EXPORT] FFmpeg 백엔드 초기화");
        Ok(Self {
            limiter: Arc::new(SessionLimiter::default()),
        })
    }
}

impl MediaBackend for FfmpegBackend {
    fn create_reader(
        &self,
        timeline: &Timeline,
        composition: &VideoComposition,
        audio_mix: Option<&AudioMix>,
    ) -> Result<ReaderParts, String> {
        if composition.fps <= 0.0 {
            return Err(format!("invalid composition frame rate: {}", composition.fps));
        }

        let has_audio = timeline.has_audio();
        let shared = Arc::new(timeline.clone());
        let reader = Arc::new(FfmpegReader::new(
            if has_audio { 2 } else { 1 },
            timeline.duration_ms(),
        ));

        let video = VideoOutput::new(reader.clone(), shared.clone(), *composition);
        let (audio, audio_format) = if has_audio {
            let output = AudioOutput::new(reader.clone(), shared, audio_mix.cloned());
            let format = AudioFormat {
                sample_rate: output.sample_rate(),
                channels: output.channels(),
            };
            (Some(Box::new(output) as Box<dyn TrackOutput>), Some(format))
        } else {
            (None, None)
        };

        Ok(ReaderParts {
            reader,
            video: Box::new(video),
            video_format: VideoFormat {
                width: composition.render_width,
                height: composition.render_height,
            },
            audio,
            audio_format,
        })
    }

    fn create_writer(&self, request: &WriterRequest<'_>) -> Result<WriterParts, String> {
        // 리더가 출력 크기로 스케일하므로 합성 크기 = 인코딩 크기
        if request.video_source.width != request.video.width
            || request.video_source.height != request.video.height
        {
            return Err(format!(
                "composition is {}x{} but output is {}x{}",
                request.video_source.width,
                request.video_source.height,
                request.video.width,
                request.video.height
            ));
        }

        let writer = Arc::new(FfmpegWriter::open(request.location, request.container)?);
        let inputs = VideoInput::new(&writer, request.video).and_then(|video| {
            let audio = match request.audio {
                Some((settings, source)) => Some(
                    Box::new(AudioInput::new(&writer, settings, source)?) as Box<dyn TrackInput>
                ),
                None => None,
            };
            Ok((video, audio))
        });

        match inputs {
            Ok((video, audio)) => Ok(WriterParts {
                writer,
                video: Box::new(video),
                audio,
            }),
            Err(e) => {
                // 헤더 전에 열린 빈 파일 정리
                drop(writer);
                let _ = std::fs::remove_file(request.location);
                Err(e)
            }
        }
    }

    fn session_limiter(&self) -> Option<Arc<SessionLimiter>> {
        Some(self.limiter.clone())
    }
}
