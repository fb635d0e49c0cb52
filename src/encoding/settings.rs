// Export 설정 - 컨테이너, 출력 위치, 트랙별 코덱 파라미터, 동시 실행 scope
// 필드를 생략한 JSON은 기본값으로 채워짐

use crate::error::ExportError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 출력 위치를 지정하지 않았을 때의 파일 이름 (확장자 제외)
pub const DEFAULT_OUTPUT_STEM: &str = "export_command_temp";

/// 출력 컨테이너
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mov,
    M4v,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mov => "mov",
            ContainerFormat::M4v => "m4v",
        }
    }

    /// FFmpeg muxer 이름
    pub fn muxer_name(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mov => "mov",
            ContainerFormat::M4v => "ipod",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

/// H.264 프로파일 (레벨은 자동)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoProfile {
    #[default]
    Baseline,
    Main,
    High,
}

impl VideoProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoProfile::Baseline => "baseline",
            VideoProfile::Main => "main",
            VideoProfile::High => "high",
        }
    }
}

/// 비디오 출력 설정 (기본: H.264 720x1280, 1.8Mbps, 30fps)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub profile: VideoProfile,
    /// 평균 비트레이트 (bps)
    pub average_bit_rate: u64,
    pub expected_frame_rate: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            width: 720,
            height: 1280,
            profile: VideoProfile::Baseline,
            average_bit_rate: 1_800_000,
            expected_frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
}

/// 오디오 출력 설정 (기본: AAC 2ch 44.1kHz 64kbps)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub codec: AudioCodec,
    pub channels: u16,
    pub sample_rate: u32,
    pub bit_rate: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: AudioCodec::Aac,
            channels: 2,
            sample_rate: 44_100,
            bit_rate: 64_000,
        }
    }
}

/// Export 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub container: ContainerFormat,
    /// None이면 임시 디렉터리 아래 기본 이름
    pub output: Option<PathBuf>,
    pub video: VideoSettings,
    pub audio: AudioSettings,
    /// 동시 Export용 이름 (스레드 이름 + 기본 출력 파일 이름)
    pub scope: Option<String>,
}

impl ExportSettings {
    /// scope 이름을 가진 설정 (다른 scope와 병렬 실행 가능)
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl AsRef<Path>) -> Self {
        self.output = Some(output.as_ref().to_path_buf());
        self
    }

    /// 실제 출력 경로
    /// - 지정값 우선
    /// - scope가 있으면 `<temp>/<scope>.<ext>`
    /// - 그 외 `<temp>/export_command_temp.<ext>`
    pub fn output_location(&self) -> PathBuf {
        if let Some(output) = &self.output {
            return output.clone();
        }
        let stem = self.scope.as_deref().unwrap_or(DEFAULT_OUTPUT_STEM);
        std::env::temp_dir().join(format!("{}.{}", stem, self.container.extension()))
    }

    /// 스레드 이름 접미사
    pub(crate) fn thread_suffix(&self) -> String {
        match &self.scope {
            Some(scope) => format!("-{}", scope),
            None => String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        let invalid = |msg: &str| Err(ExportError::InvalidSettings(msg.to_string()));

        if self.video.width == 0 || self.video.height == 0 {
            return invalid("video width/height must be non-zero");
        }
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            return invalid("video width/height must be even (YUV420P)");
        }
        if self.video.expected_frame_rate == 0 {
            return invalid("video frame rate must be non-zero");
        }
        if self.audio.channels == 0 || self.audio.sample_rate == 0 {
            return invalid("audio channels/sample rate must be non-zero");
        }
        if let Some(scope) = &self.scope {
            if scope.trim().is_empty() {
                return invalid("scope must not be empty");
            }
            if scope.contains(['/', '\\']) {
                return invalid("scope must not contain path separators");
            }
        }
        Ok(())
    }

    /// JSON 설정 로드 + 검증
    pub fn from_json(json: &str) -> Result<Self, ExportError> {
        let settings: ExportSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}
