use crate::core::{
    DecodedAudio, MediaClock, MediaInfo, PlayerConfig, PlayerError, Result, StreamKind, VideoFrame,
};
use crate::player::audio_output::{AudioOutput, SampleBuffer};
use crate::player::context::{CloseHandle, PipelineContext, StreamFailure};
use crate::player::decode_unit::{DecodeUnit, DecoderBackend, StreamWorker};
use crate::player::decoder::{open_audio_decoder, open_video_decoder};
use crate::player::demuxer::Demuxer;
use crate::player::demuxer_source::PacketSource;
use crate::player::demuxer_thread::{PacketReader, ReaderStats};
use crate::player::log_ctx;
use crate::player::packet_queue::PacketQueue;
use crate::player::pacing::{frame_interval_ms, PacingController, PresentationLoop, RefreshTimer, SyncStats};
use crate::player::processor::{AudioProcessor, ProcessorStats, VideoProcessor};
use crate::player::resampler::{AudioConverter, FfmpegResampler, InputFormat};
use crate::player::video_sink::VideoSink;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 视频路径的组件
pub struct VideoParts {
    pub decoder: Box<dyn DecoderBackend<Frame = VideoFrame>>,
    pub frame_rate: f64,
}

/// 音频路径的组件；`output` 为 None 时由调用方自己消费 `SampleBuffer`
pub struct AudioParts {
    pub decoder: Box<dyn DecoderBackend<Frame = DecodedAudio>>,
    pub converter: Box<dyn AudioConverter>,
    pub output: Option<AudioOutput>,
}

/// 组装会话所需的全部组件（都已初始化成功）
pub struct SessionParts {
    pub source: Box<dyn PacketSource>,
    pub video: Option<VideoParts>,
    pub audio: Option<AudioParts>,
}

/// 一次播放的结果
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackReport {
    pub media: MediaInfo,
    pub reader: ReaderStats,
    pub video_items_pushed: usize,  // 含结束哨兵
    pub audio_items_pushed: usize,
    pub video: Option<ProcessorStats>,
    pub audio: Option<ProcessorStats>,
    pub sync: SyncStats,
    pub audio_samples_played: u64,
    pub audio_underruns: u64,
    pub closed_early: bool,         // 数据源读完之前被关闭
    pub elapsed_ms: u128,
    pub failure: Option<StreamFailure>,
}

/// 播放会话 - 读包线程、两个处理线程、刷新定时器和展示循环的编排者
pub struct PlaybackSession {
    config: PlayerConfig,
    ctx: Arc<PipelineContext>,
    clock: MediaClock,
    buffer: Arc<SampleBuffer>,
    media_info: MediaInfo,
    parts: Option<SessionParts>,
}

impl PlaybackSession {
    /// 打开媒体文件并完成所有初始化
    ///
    /// 流缺失、解码器不可用、音频设备或重采样器初始化失败都在这里返回，不会启动任何线程
    pub fn open(input: &str, config: &PlayerConfig) -> Result<Self> {
        config.validate()?;
        info!("{} 📂 打开媒体: {}", log_ctx(), input);

        let demuxer = Demuxer::open(input, config.video_enabled, config.audio_enabled)?;

        let video = if config.video_enabled {
            let stream = demuxer
                .stream(StreamKind::Video)
                .ok_or_else(|| PlayerError::NoVideoStream(input.to_string()))?;
            let decoder = open_video_decoder(&stream)?;
            let frame_rate = demuxer.frame_rate().unwrap_or_else(|| {
                warn!("流中没有帧率信息，使用默认帧率 {}", config.fallback_frame_rate);
                config.fallback_frame_rate
            });
            info!("🎬 视频: {}x{} @ {:.3} fps", decoder.width(), decoder.height(), frame_rate);
            Some(VideoParts {
                decoder: Box::new(decoder),
                frame_rate,
            })
        } else {
            None
        };

        let audio = if config.audio_enabled {
            let stream = demuxer
                .stream(StreamKind::Audio)
                .ok_or_else(|| PlayerError::NoAudioStream(input.to_string()))?;
            let decoder = open_audio_decoder(&stream)?;
            let (format, layout, rate) = decoder.input_format();
            let channels = (layout.channels().max(1)) as u16;

            let output = AudioOutput::open(
                config.output_sample_rate.unwrap_or(rate),
                config.output_channels.unwrap_or(channels),
            )?;
            output.set_volume(config.volume);
            let converter = FfmpegResampler::configure(
                InputFormat {
                    format,
                    layout,
                    rate,
                },
                output.format(),
            )?;
            Some(AudioParts {
                decoder: Box::new(decoder),
                converter: Box::new(converter),
                output: Some(output),
            })
        } else {
            None
        };

        let media_info = demuxer.media_info().clone();
        let mut session = Self::from_parts(
            SessionParts {
                source: Box::new(demuxer),
                video,
                audio,
            },
            config,
        )?;
        session.media_info = media_info;
        info!("{} ✅ 初始化完成", log_ctx());
        Ok(session)
    }

    /// 用现成的组件组装会话
    pub fn from_parts(parts: SessionParts, config: &PlayerConfig) -> Result<Self> {
        config.validate()?;
        if parts.video.is_none() && parts.audio.is_none() {
            return Err(PlayerError::ConfigError("没有可播放的流".to_string()));
        }
        info!("{} 数据源: {}", log_ctx(), parts.source.description());
        for desc in [parts.source.video_stream(), parts.source.audio_stream()].into_iter().flatten() {
            debug!(
                "{} [{}] 流 #{} codec={} time_base={}/{}",
                log_ctx(),
                desc.kind,
                desc.index,
                desc.codec_name,
                desc.time_base.num,
                desc.time_base.den
            );
        }
        Ok(Self {
            config: config.clone(),
            ctx: PipelineContext::new(),
            clock: MediaClock::new(),
            buffer: Arc::new(SampleBuffer::new()),
            media_info: MediaInfo::default(),
            parts: Some(parts),
        })
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    /// 关闭句柄：`close()` 优雅关闭，`abort()` 强制停止
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle::new(self.ctx.clone())
    }

    /// 音频输出缓冲（设备回调从这里拉取数据）
    #[cfg(test)]
    pub fn sample_buffer(&self) -> Arc<SampleBuffer> {
        self.buffer.clone()
    }

    /// 运行整个管线直到结束；展示循环在调用线程上执行
    pub fn run(&mut self, sink: &mut dyn VideoSink) -> Result<PlaybackReport> {
        let parts = self
            .parts
            .take()
            .ok_or_else(|| PlayerError::ConfigError("会话已经运行过".to_string()))?;
        let SessionParts { source, video, audio } = parts;
        let started = Instant::now();
        let config = &self.config;
        let poll = Duration::from_millis(config.processor_poll_ms);

        let video_queue = video
            .as_ref()
            .map(|_| Arc::new(PacketQueue::new(StreamKind::Video, config.video_queue_depth)));
        let audio_queue = audio
            .as_ref()
            .map(|_| Arc::new(PacketQueue::new(StreamKind::Audio, config.audio_queue_depth)));

        // 音频设备流在任何线程之前启动，失败仍属于初始化错误
        let (audio_parts, mut audio_output) = match audio {
            Some(AudioParts {
                decoder,
                converter,
                output,
            }) => {
                let output = match output {
                    Some(mut output) => {
                        output.start(self.buffer.clone())?;
                        Some(output)
                    }
                    None => None,
                };
                (Some((decoder, converter)), output)
            }
            None => (None, None),
        };

        info!("{} ▶️  启动播放管线", log_ctx());
        let mut reader = PacketReader::start(
            source,
            video_queue.clone(),
            audio_queue.clone(),
            self.ctx.clone(),
            Duration::from_millis(config.reader_poll_ms),
        );

        let mut audio_processor = match (audio_parts, audio_queue.clone()) {
            (Some((decoder, converter)), Some(queue)) => {
                let max_buffered = converter
                    .output_format()
                    .samples_for_millis(config.max_buffered_audio_ms);
                let worker = StreamWorker::new(queue, DecodeUnit::new(StreamKind::Audio, decoder));
                Some(AudioProcessor::start(
                    worker,
                    converter,
                    self.clock.clone(),
                    self.buffer.clone(),
                    self.ctx.clone(),
                    max_buffered,
                    Duration::from_millis(config.drain_timeout_ms),
                    poll,
                ))
            }
            _ => None,
        };

        let mut sync = SyncStats::default();
        let mut video_processor = None;
        if let (Some(parts), Some(queue)) = (video, video_queue.clone()) {
            let worker = StreamWorker::new(queue, DecodeUnit::new(StreamKind::Video, parts.decoder));
            let processor = VideoProcessor::start(worker, self.ctx.clone(), poll);

            let interval = frame_interval_ms(parts.frame_rate);
            let pacing = PacingController::new(interval, config.sync_threshold_ms, self.ctx.clone());
            let timer = RefreshTimer::start(interval, self.ctx.clone());
            let clock = audio_processor.as_ref().map(|_| self.clock.clone());

            let outcome = PresentationLoop::new(&processor, clock, pacing, self.ctx.clone(), crossbeam_channel::never())
                .with_timer(timer)
                .run(sink);
            match outcome {
                Ok(stats) => sync = stats,
                Err(e) => self.ctx.report_failure(Some(StreamKind::Video), e.to_string()),
            }
            video_processor = Some(processor);
        }

        if let Some(processor) = audio_processor.as_ref() {
            self.wait_for_audio(processor);
        }

        // 停止读包 → 等待读包线程 → 音频 → 视频，解码器和解封装器随线程一起释放
        self.ctx.request_close();
        let reader_stats = reader.join();
        let audio_stats = audio_processor.as_mut().map(|p| p.join());
        if let Some(output) = audio_output.as_mut() {
            output.stop();
        }
        let video_stats = video_processor.as_mut().map(|p| p.join());

        let report = PlaybackReport {
            media: self.media_info.clone(),
            reader: reader_stats,
            video_items_pushed: video_queue.as_ref().map_or(0, |q| q.pushed_count()),
            audio_items_pushed: audio_queue.as_ref().map_or(0, |q| q.pushed_count()),
            video: video_stats,
            audio: audio_stats,
            sync,
            audio_samples_played: self.buffer.played(),
            audio_underruns: self.buffer.underruns(),
            closed_early: !self.ctx.is_source_exhausted(),
            elapsed_ms: started.elapsed().as_millis(),
            failure: self.ctx.failure(),
        };
        debug!("{} 播放报告: {:?}", log_ctx(), report);

        if let Some(failure) = &report.failure {
            return Err(PlayerError::PlaybackFailed {
                stream: failure
                    .stream
                    .map_or_else(|| "source".to_string(), |kind| kind.to_string()),
                message: failure.message.clone(),
            });
        }

        info!(
            "{} ⏹️  播放结束，用时 {}ms",
            log_ctx(),
            report.elapsed_ms
        );
        Ok(report)
    }

    /// 等待音频解码结束，再等输出缓冲播完（有上限）
    ///
    /// 设备停止取数据时，音频处理线程会自己报错退出，第一段等待不会卡死
    fn wait_for_audio(&self, processor: &AudioProcessor) {
        let poll = Duration::from_millis(self.config.processor_poll_ms.max(1));
        while !processor.is_finished() && !self.ctx.is_hard_stop() {
            thread::sleep(poll);
        }
        if self.ctx.is_hard_stop() || !self.ctx.is_finished(StreamKind::Audio) {
            return;
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        while !self.buffer.is_empty() && !self.ctx.is_hard_stop() {
            if Instant::now() >= deadline {
                warn!("{} ⚠ 音频缓冲在超时内没有播完，剩余 {} 采样", log_ctx(), self.buffer.len());
                self.buffer.clear();
                break;
            }
            thread::sleep(poll);
        }
    }
}
