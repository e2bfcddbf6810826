use crate::core::{AudioFormat, PlayerError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 交错 f32 采样缓冲：音频处理线程写入，设备回调线程读取
///
/// 设备回调运行在我们无法控制的线程上，可能与写入同时发生，所以用无锁队列
pub struct SampleBuffer {
    queue: SegQueue<f32>,
    played: AtomicU64,      // 回调实际取走的采样数
    underruns: AtomicU64,   // 数据不足、需要补静音的回调次数
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            played: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    pub fn push_slice(&self, samples: &[f32]) {
        for sample in samples {
            self.queue.push(*sample);
        }
    }

    /// 恰好写满 `dest`：数据不足的部分补 0，返回真实数据的采样数
    pub fn fill(&self, dest: &mut [f32]) -> usize {
        let mut filled = 0;
        for slot in dest.iter_mut() {
            match self.queue.pop() {
                Some(value) => {
                    *slot = value;
                    filled += 1;
                }
                None => *slot = 0.0,
            }
        }
        if filled < dest.len() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        self.played.fetch_add(filled as u64, Ordering::Relaxed);
        filled
    }

    /// 缓冲中的采样数
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// 清空缓冲区
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 音频输出 - 使用 cpal 播放音频（拉模式回调）
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    volume: Arc<Mutex<f32>>,
}

impl AudioOutput {
    /// 打开默认输出设备（不支持请求的配置时自动回退到标准配置）
    pub fn open(sample_rate: u32, channels: u16) -> Result<Self> {
        info!("初始化音频输出: {} Hz, {} 声道", sample_rate, channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;

        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let requested = (sample_rate, channels);
        let fallback_configs = [
            requested,
            (48000, 2),  // 最常见
            (44100, 2),  // CD 音质
            (48000, 1),
            (44100, 1),
        ];

        let mut chosen = None;
        for (rate, ch) in fallback_configs {
            let candidate = StreamConfig {
                channels: ch,
                sample_rate: cpal::SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let supported_configs = device
                .supported_output_configs()
                .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
            if supported_configs
                .into_iter()
                .any(|supported| Self::is_config_compatible(&candidate, &supported))
            {
                chosen = Some(candidate);
                break;
            }
            if (rate, ch) == requested {
                warn!("⚠️  音频设备不支持 {} Hz, {} 声道配置，尝试标准配置", rate, ch);
            }
        }

        let config = chosen.ok_or_else(|| {
            PlayerError::AudioError(format!(
                "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                sample_rate, channels
            ))
        })?;
        info!("✅ 音频输出配置: {} Hz, {} 声道", config.sample_rate.0, config.channels);

        Ok(Self {
            device,
            config,
            stream: None,
            volume: Arc::new(Mutex::new(1.0)),
        })
    }

    /// 检查配置是否兼容
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;

        let channels_match = config.channels == supported.channels();

        rate_in_range && channels_match
    }

    /// 实际使用的输出格式
    pub fn format(&self) -> AudioFormat {
        AudioFormat::f32(self.config.sample_rate.0, self.config.channels)
    }

    /// 开始播放：设备回调从 `buffer` 拉取数据
    pub fn start(&mut self, buffer: Arc<SampleBuffer>) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let volume = self.volume.clone();

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    buffer.fill(data);
                    let vol = *volume.lock();
                    if vol < 1.0 {
                        for sample in data.iter_mut() {
                            *sample *= vol;
                        }
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

        self.stream = Some(stream);
        info!("音频输出已启动");

        Ok(())
    }

    /// 停止播放
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("暂停音频流失败: {}", e);
            }
            drop(stream);
            info!("音频输出已停止");
        }
    }

    /// 设置音量 (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume.clamp(0.0, 1.0);
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
