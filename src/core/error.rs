use crate::core::types::StreamKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("无法找到视频流: {0}")]
    NoVideoStream(String),

    #[error("无法找到音频流: {0}")]
    NoAudioStream(String),

    #[error("找不到解码器 ({stream}): {codec}")]
    CodecNotFound { stream: StreamKind, codec: String },

    #[error("无法打开解码器 ({stream}): {message}")]
    CodecOpen { stream: StreamKind, message: String },

    #[error("重采样器初始化失败: {0}")]
    ResamplerInit(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("解码错误 ({stream}): {message}")]
    DecodeError { stream: StreamKind, message: String },

    #[error("读取数据包失败: {0}")]
    SourceRead(String),

    #[error("重采样错误: {0}")]
    ResampleError(String),

    #[error("渲染错误: {0}")]
    RenderError(String),

    #[error("播放中止，{stream} 出错: {message}")]
    PlaybackFailed { stream: String, message: String },
}

impl PlayerError {
    pub fn decode(stream: StreamKind, message: impl Into<String>) -> Self {
        PlayerError::DecodeError {
            stream,
            message: message.into(),
        }
    }

    /// 初始化阶段的致命错误：在任何线程启动之前就会返回给调用方
    pub fn is_fatal_init(&self) -> bool {
        matches!(
            self,
            PlayerError::OpenError(_)
                | PlayerError::NoVideoStream(_)
                | PlayerError::NoAudioStream(_)
                | PlayerError::CodecNotFound { .. }
                | PlayerError::CodecOpen { .. }
                | PlayerError::ResamplerInit(_)
                | PlayerError::AudioError(_)
                | PlayerError::ConfigError(_)
        )
    }

    /// 出错的流（能确定时）
    pub fn stream(&self) -> Option<StreamKind> {
        match self {
            PlayerError::DecodeError { stream, .. }
            | PlayerError::CodecNotFound { stream, .. }
            | PlayerError::CodecOpen { stream, .. } => Some(*stream),
            PlayerError::ResampleError(_) | PlayerError::AudioError(_) => Some(StreamKind::Audio),
            PlayerError::RenderError(_) => Some(StreamKind::Video),
            PlayerError::PlaybackFailed { stream, .. } => match stream.as_str() {
                "video" => Some(StreamKind::Video),
                "audio" => Some(StreamKind::Audio),
                _ => None,
            },
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
