use crate::core::error::{PlayerError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 播放管线配置（可从 JSON 文件加载，缺省字段使用默认值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub video_queue_depth: usize,       // 视频包队列目标深度
    pub audio_queue_depth: usize,       // 音频包队列目标深度
    pub reader_poll_ms: u64,            // 读包线程每轮之间的休眠
    pub processor_poll_ms: u64,         // 处理线程无包可用时的休眠
    pub sync_threshold_ms: i64,         // 音视频漂移容忍带
    pub fallback_frame_rate: f64,       // 流中没有帧率信息时使用
    pub output_sample_rate: Option<u32>,
    pub output_channels: Option<u16>,
    pub max_buffered_audio_ms: u64,     // 输出缓冲上限，超过后音频处理线程暂停
    pub drain_timeout_ms: u64,          // 结束时等待音频缓冲播完的上限
    pub volume: f32,                    // 0.0 - 1.0
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_enabled: true,
            audio_enabled: true,
            video_queue_depth: 30,
            audio_queue_depth: 60,
            reader_poll_ms: 10,
            processor_poll_ms: 5,
            sync_threshold_ms: 30,
            fallback_frame_rate: 25.0,
            output_sample_rate: None,
            output_channels: None,
            max_buffered_audio_ms: 500,
            drain_timeout_ms: 2000,
            volume: 1.0,
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: PlayerConfig = serde_json::from_str(&text)?;
        info!("已加载配置文件: {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.video_enabled && !self.audio_enabled {
            return Err(PlayerError::ConfigError("音频和视频不能同时禁用".to_string()));
        }
        if self.video_queue_depth == 0 || self.audio_queue_depth == 0 {
            return Err(PlayerError::ConfigError("队列深度必须大于 0".to_string()));
        }
        if !(self.fallback_frame_rate.is_finite() && self.fallback_frame_rate > 0.0) {
            return Err(PlayerError::ConfigError(format!(
                "无效的默认帧率: {}",
                self.fallback_frame_rate
            )));
        }
        if self.sync_threshold_ms < 0 {
            return Err(PlayerError::ConfigError(format!(
                "同步阈值不能为负: {}",
                self.sync_threshold_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(PlayerError::ConfigError(format!("音量超出范围 [0, 1]: {}", self.volume)));
        }
        if matches!(self.output_channels, Some(0)) || matches!(self.output_sample_rate, Some(0)) {
            return Err(PlayerError::ConfigError("输出采样率/声道数不能为 0".to_string()));
        }
        Ok(())
    }
}
