//! 每个流一个处理线程：从包队列取包、驱动解码单元
//!
//! 视频处理线程只保留一个就绪帧，展示循环取走之后才解码下一帧；
//! 音频处理线程把解码帧重采样后推入输出缓冲，并按设备的播放位置更新媒体时钟。

use crate::core::{AudioFormat, DecodedAudio, MediaClock, MediaFrame, StreamKind, VideoFrame};
use crate::player::audio_output::SampleBuffer;
use crate::player::context::PipelineContext;
use crate::player::decode_unit::{Pull, StreamWorker};
use crate::player::log_ctx;
use crate::player::pacing::FrameSlot;
use crate::player::resampler::AudioConverter;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 处理线程统计
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub stream: StreamKind,
    pub packets_decoded: u64,
    pub frames: u64,
    pub reached_eos: bool,
}

impl ProcessorStats {
    fn empty(stream: StreamKind) -> Self {
        Self {
            stream,
            packets_decoded: 0,
            frames: 0,
            reached_eos: false,
        }
    }

    fn from_worker<F>(worker: &StreamWorker<F>) -> Self {
        let unit = worker.unit();
        Self {
            stream: unit.kind(),
            packets_decoded: unit.packets_in(),
            frames: unit.frames_out(),
            reached_eos: unit.is_eos(),
        }
    }
}

fn join_worker(handle: &mut Option<JoinHandle<ProcessorStats>>, stream: StreamKind) -> ProcessorStats {
    match handle.take().map(|h| h.join()) {
        Some(Ok(stats)) => stats,
        Some(Err(_)) => {
            warn!("{} ⚠ [{}] 处理线程 panic", log_ctx(), stream);
            ProcessorStats::empty(stream)
        }
        None => ProcessorStats::empty(stream),
    }
}

struct VideoShared {
    ready: Mutex<Option<VideoFrame>>,
    decoded_all: AtomicBool,
}

/// 视频处理线程
pub struct VideoProcessor {
    shared: Arc<VideoShared>,
    thread_handle: Option<JoinHandle<ProcessorStats>>,
}

impl VideoProcessor {
    pub fn start(mut worker: StreamWorker<VideoFrame>, ctx: Arc<PipelineContext>, poll: Duration) -> Self {
        let shared = Arc::new(VideoShared {
            ready: Mutex::new(None),
            decoded_all: AtomicBool::new(false),
        });
        let slot = shared.clone();

        let thread_handle = thread::spawn(move || {
            info!("{} 🎬 视频处理线程启动", log_ctx());
            while !ctx.is_hard_stop() {
                // 上一帧还没被展示循环取走
                if slot.ready.lock().is_some() {
                    thread::sleep(poll);
                    continue;
                }

                match worker.pull() {
                    Ok(Pull::Frame(frame)) => {
                        *slot.ready.lock() = Some(frame);
                    }
                    Ok(Pull::Starved) => thread::sleep(poll),
                    Ok(Pull::Finished) => {
                        debug!("{} 🎬 视频解码到达结束", log_ctx());
                        break;
                    }
                    Err(e) => {
                        ctx.report_failure(Some(StreamKind::Video), e.to_string());
                        break;
                    }
                }
            }

            slot.decoded_all.store(true, Ordering::Release);
            if worker.unit().is_eos() {
                ctx.mark_finished(StreamKind::Video);
            }
            let stats = ProcessorStats::from_worker(&worker);
            info!(
                "{} 🎬 视频处理线程结束：{} 个包，{} 帧",
                log_ctx(),
                stats.packets_decoded,
                stats.frames
            );
            stats
        });

        Self {
            shared,
            thread_handle: Some(thread_handle),
        }
    }

    pub fn join(&mut self) -> ProcessorStats {
        join_worker(&mut self.thread_handle, StreamKind::Video)
    }
}

impl FrameSlot for VideoProcessor {
    fn next_pts(&self) -> Option<i64> {
        self.shared.ready.lock().as_ref().map(|frame| frame.pts_ms())
    }

    fn take_frame(&self) -> Option<VideoFrame> {
        self.shared.ready.lock().take()
    }

    fn is_finished(&self) -> bool {
        self.shared.decoded_all.load(Ordering::Acquire) && self.shared.ready.lock().is_none()
    }
}

impl Drop for VideoProcessor {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.join();
        }
    }
}

/// 输出缓冲的写入位置，用来推算设备正在播放的位置
///
/// 播放位置 = 最后写入采样的结束时间 - 缓冲中尚未播放的时长
struct Playhead {
    format: AudioFormat,
    written_end_ms: Option<i64>,
}

impl Playhead {
    fn new(format: AudioFormat) -> Self {
        Self {
            format,
            written_end_ms: None,
        }
    }

    fn push(&mut self, pts_ms: i64, samples: &[f32], buffer: &SampleBuffer) {
        buffer.push_slice(samples);
        self.written_end_ms = Some(pts_ms + self.format.millis_for_samples(samples.len()));
    }

    /// 接在已写入数据后面的采样（没有自己的 PTS）
    fn append(&mut self, samples: &[f32], buffer: &SampleBuffer) {
        if samples.is_empty() {
            return;
        }
        buffer.push_slice(samples);
        if let Some(end) = self.written_end_ms.as_mut() {
            *end += self.format.millis_for_samples(samples.len());
        }
    }

    fn publish(&self, clock: &MediaClock, buffer: &SampleBuffer) {
        if let Some(end) = self.written_end_ms {
            clock.update(end - self.format.millis_for_samples(buffer.len()));
        }
    }
}

/// 音频处理线程
pub struct AudioProcessor {
    finished: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<ProcessorStats>>,
}

impl AudioProcessor {
    /// `max_buffered` 是输出缓冲的上限（交错采样数），超过后暂停解码；
    /// 缓冲满且设备 `stall_timeout` 内没有取走任何采样时，按音频流失败处理
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        mut worker: StreamWorker<DecodedAudio>,
        mut converter: Box<dyn AudioConverter>,
        clock: MediaClock,
        buffer: Arc<SampleBuffer>,
        ctx: Arc<PipelineContext>,
        max_buffered: usize,
        stall_timeout: Duration,
        poll: Duration,
    ) -> Self {
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();

        let thread_handle = thread::spawn(move || {
            info!("{} 🔊 音频处理线程启动", log_ctx());
            let format = converter.output_format();
            let mut playhead = Playhead::new(format);
            let mut samples: Vec<f32> = Vec::new();
            let mut first_frame = true;
            let mut last_played = buffer.played();
            let mut stalled_since: Option<Instant> = None;

            while !ctx.is_hard_stop() {
                // 缓冲满时不解码，但时钟继续跟着设备的实际播放位置走
                playhead.publish(&clock, &buffer);
                if buffer.len() >= max_buffered {
                    let played = buffer.played();
                    if played != last_played {
                        last_played = played;
                        stalled_since = None;
                    }
                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= stall_timeout {
                        ctx.report_failure(
                            Some(StreamKind::Audio),
                            format!("音频输出 {}ms 内没有取走数据", stall_timeout.as_millis()),
                        );
                        break;
                    }
                    thread::sleep(poll);
                    continue;
                }
                stalled_since = None;

                match worker.pull() {
                    Ok(Pull::Frame(frame)) => {
                        samples.clear();
                        match converter.convert(&frame, &mut samples) {
                            Ok(converted) => {
                                if first_frame {
                                    debug!(
                                        "{} 🔊 第一帧音频: PTS={}ms, {} 采样 ({} 字节)",
                                        log_ctx(),
                                        frame.pts_ms(),
                                        converted.sample_count,
                                        converted.byte_size
                                    );
                                    first_frame = false;
                                }
                                playhead.push(frame.pts_ms(), &samples, &buffer);
                                playhead.publish(&clock, &buffer);
                            }
                            Err(e) => {
                                ctx.report_failure(Some(StreamKind::Audio), e.to_string());
                                break;
                            }
                        }
                    }
                    Ok(Pull::Starved) => thread::sleep(poll),
                    Ok(Pull::Finished) => {
                        samples.clear();
                        match converter.flush(&mut samples) {
                            Ok(_) => playhead.append(&samples, &buffer),
                            Err(e) => warn!("{} ⚠ 重采样器尾部丢弃: {}", log_ctx(), e),
                        }
                        debug!("{} 🔊 音频解码到达结束", log_ctx());
                        break;
                    }
                    Err(e) => {
                        ctx.report_failure(Some(StreamKind::Audio), e.to_string());
                        break;
                    }
                }
            }

            if worker.unit().is_eos() {
                ctx.mark_finished(StreamKind::Audio);
            }
            done.store(true, Ordering::Release);
            let stats = ProcessorStats::from_worker(&worker);
            info!(
                "{} 🔊 音频处理线程结束：{} 个包，{} 帧",
                log_ctx(),
                stats.packets_decoded,
                stats.frames
            );
            stats
        });

        Self {
            finished,
            thread_handle: Some(thread_handle),
        }
    }

    /// 线程已退出（解码结束、出错或强制停止）
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn join(&mut self) -> ProcessorStats {
        join_worker(&mut self.thread_handle, StreamKind::Audio)
    }
}

impl Drop for AudioProcessor {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.join();
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! 把脚本解码器的输出包装成真实帧类型
    use crate::core::{DecodedAudio, PixelFormat, Result, VideoFrame};
    use crate::player::decode_unit::testing::ScriptedDecoder;
    use crate::player::decode_unit::{DecoderBackend, DrainStatus, FeedStatus};
    use ffmpeg_next as ffmpeg;

    pub struct ScriptedVideo(pub ScriptedDecoder);

    impl DecoderBackend for ScriptedVideo {
        type Frame = VideoFrame;

        fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<FeedStatus> {
            self.0.send_packet(packet)
        }

        fn send_eof(&mut self) -> Result<FeedStatus> {
            self.0.send_eof()
        }

        fn receive_frame(&mut self) -> Result<DrainStatus<VideoFrame>> {
            Ok(match self.0.receive_frame()? {
                DrainStatus::Frame(frame) => DrainStatus::Frame(VideoFrame {
                    pts: frame.source_pts,
                    width: 2,
                    height: 2,
                    format: PixelFormat::YUV420P,
                    planes: vec![vec![16; 4], vec![128], vec![128]],
                    linesizes: vec![2, 1, 1],
                }),
                DrainStatus::NeedMoreInput => DrainStatus::NeedMoreInput,
                DrainStatus::Eos => DrainStatus::Eos,
            })
        }
    }

    pub struct ScriptedAudio(pub ScriptedDecoder);

    impl DecoderBackend for ScriptedAudio {
        type Frame = DecodedAudio;

        fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<FeedStatus> {
            self.0.send_packet(packet)
        }

        fn send_eof(&mut self) -> Result<FeedStatus> {
            self.0.send_eof()
        }

        fn receive_frame(&mut self) -> Result<DrainStatus<DecodedAudio>> {
            Ok(match self.0.receive_frame()? {
                DrainStatus::Frame(frame) => {
                    DrainStatus::Frame(DecodedAudio::new(frame.source_pts, ffmpeg::frame::Audio::empty()))
                }
                DrainStatus::NeedMoreInput => DrainStatus::NeedMoreInput,
                DrainStatus::Eos => DrainStatus::Eos,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedAudio, ScriptedVideo};
    use super::*;
    use crate::player::decode_unit::testing::ScriptedDecoder;
    use crate::player::decode_unit::DecodeUnit;
    use crate::player::demuxer_source::testing::packet;
    use crate::player::packet_queue::PacketQueue;
    use crate::player::resampler::testing::{SilenceConverter, TailingConverter};

    fn filled_queue(kind: StreamKind, n: i64, step: i64) -> Arc<PacketQueue> {
        let queue = Arc::new(PacketQueue::new(kind, 1024));
        for i in 0..n {
            queue.push_packet(packet(kind, i * step));
        }
        queue.push_end_of_stream();
        queue
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_video_slot_holds_one_frame_until_taken() {
        let ctx = PipelineContext::new();
        let queue = filled_queue(StreamKind::Video, 5, 40);
        let unit = DecodeUnit::new(StreamKind::Video, Box::new(ScriptedVideo(ScriptedDecoder::new(1, 4))));
        let mut processor =
            VideoProcessor::start(StreamWorker::new(queue, unit), ctx.clone(), Duration::from_millis(1));

        let mut seen = Vec::new();
        while !processor.is_finished() {
            match processor.take_frame() {
                Some(frame) => seen.push(frame.pts),
                None => thread::sleep(Duration::from_millis(1)),
            }
            // 槽位最多一帧：取走之前解码端不会覆盖
            if let Some(pts) = processor.next_pts() {
                assert_eq!(pts, seen.last().map_or(0, |p| p + 40));
            }
        }

        let stats = processor.join();
        assert_eq!(seen, vec![0, 40, 80, 120, 160]);
        assert!(stats.reached_eos);
        assert_eq!(stats.frames, 5);
        assert!(ctx.is_finished(StreamKind::Video));
    }

    fn silence(samples_per_frame: usize) -> Box<SilenceConverter> {
        Box::new(SilenceConverter {
            format: AudioFormat::f32(48000, 2),
            samples_per_frame,
        })
    }

    #[test]
    fn test_audio_clock_lags_decode_by_buffered_audio() {
        let ctx = PipelineContext::new();
        // 每帧 960 采样 = 20ms，PTS 间隔也是 20ms
        let queue = filled_queue(StreamKind::Audio, 10, 20);
        let unit = DecodeUnit::new(StreamKind::Audio, Box::new(ScriptedAudio(ScriptedDecoder::new(1, 4))));
        let clock = MediaClock::new();
        let buffer = Arc::new(SampleBuffer::new());

        let mut processor = AudioProcessor::start(
            StreamWorker::new(queue, unit),
            silence(960),
            clock.clone(),
            buffer.clone(),
            ctx.clone(),
            usize::MAX,
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        wait_until(|| processor.is_finished());
        let stats = processor.join();

        assert_eq!(stats.frames, 10);
        assert!(stats.reached_eos);
        assert_eq!(buffer.len(), 10 * 960 * 2);
        // 没有消费者：最后一帧 PTS=180，但设备还停在第一帧
        assert_eq!(clock.now(), Some(0));
        assert!(ctx.is_finished(StreamKind::Audio));
    }

    #[test]
    fn test_audio_clock_follows_played_samples() {
        let ctx = PipelineContext::new();
        let queue = filled_queue(StreamKind::Audio, 50, 20);
        let unit = DecodeUnit::new(StreamKind::Audio, Box::new(ScriptedAudio(ScriptedDecoder::new(1, 4))));
        let clock = MediaClock::new();
        let buffer = Arc::new(SampleBuffer::new());
        let format = AudioFormat::f32(48000, 2);

        let mut processor = AudioProcessor::start(
            StreamWorker::new(queue, unit),
            silence(960),
            clock.clone(),
            buffer.clone(),
            ctx.clone(),
            format.samples_for_millis(200),
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        wait_until(|| buffer.len() >= format.samples_for_millis(200));
        assert_eq!(clock.now(), Some(0));

        // 模拟设备回调播放 100ms，缓冲满时时钟也要前进
        let mut dest = vec![0.0f32; format.samples_for_millis(100)];
        assert_eq!(buffer.fill(&mut dest), dest.len());
        wait_until(|| clock.now() == Some(100));

        ctx.request_hard_stop();
        processor.join();
        assert_eq!(clock.now(), Some(100));
    }

    #[test]
    fn test_audio_flushes_converter_tail_at_eos() {
        let ctx = PipelineContext::new();
        let queue = filled_queue(StreamKind::Audio, 3, 20);
        let unit = DecodeUnit::new(StreamKind::Audio, Box::new(ScriptedAudio(ScriptedDecoder::new(1, 4))));
        let buffer = Arc::new(SampleBuffer::new());
        let converter = TailingConverter {
            inner: SilenceConverter {
                format: AudioFormat::f32(48000, 2),
                samples_per_frame: 960,
            },
            tail: 48,
        };

        let mut processor = AudioProcessor::start(
            StreamWorker::new(queue, unit),
            Box::new(converter),
            MediaClock::new(),
            buffer.clone(),
            ctx.clone(),
            usize::MAX,
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        wait_until(|| processor.is_finished());
        processor.join();

        assert_eq!(buffer.len(), (3 * 960 + 48) * 2);
        let mut dest = vec![0.0f32; buffer.len()];
        buffer.fill(&mut dest);
        assert!(dest[..3 * 960 * 2].iter().all(|s| *s == 0.0));
        assert!(dest[3 * 960 * 2..].iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_audio_throttles_on_full_buffer() {
        let ctx = PipelineContext::new();
        let queue = filled_queue(StreamKind::Audio, 50, 46);
        let unit = DecodeUnit::new(StreamKind::Audio, Box::new(ScriptedAudio(ScriptedDecoder::new(1, 4))));
        let buffer = Arc::new(SampleBuffer::new());
        let converter = SilenceConverter {
            format: AudioFormat::f32(48000, 2),
            samples_per_frame: 100,
        };

        let mut processor = AudioProcessor::start(
            StreamWorker::new(queue, unit),
            Box::new(converter),
            MediaClock::new(),
            buffer.clone(),
            ctx.clone(),
            1000,
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        thread::sleep(Duration::from_millis(30));
        assert!(!processor.is_finished());
        assert!(buffer.len() < 1000 + 200);

        ctx.request_hard_stop();
        let stats = processor.join();
        assert!(!stats.reached_eos);
        assert!(!ctx.is_finished(StreamKind::Audio));
    }

    #[test]
    fn test_stalled_output_fails_audio_stream() {
        let ctx = PipelineContext::new();
        let queue = filled_queue(StreamKind::Audio, 50, 20);
        let unit = DecodeUnit::new(StreamKind::Audio, Box::new(ScriptedAudio(ScriptedDecoder::new(1, 4))));
        let buffer = Arc::new(SampleBuffer::new());

        // 没有设备回调取数据：缓冲满后在超时内报错退出
        let started = Instant::now();
        let mut processor = AudioProcessor::start(
            StreamWorker::new(queue, unit),
            silence(960),
            MediaClock::new(),
            buffer.clone(),
            ctx.clone(),
            960 * 2 * 5,
            Duration::from_millis(50),
            Duration::from_millis(1),
        );
        wait_until(|| processor.is_finished());
        let stats = processor.join();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!stats.reached_eos);
        let failure = ctx.failure().unwrap();
        assert_eq!(failure.stream, Some(StreamKind::Audio));
        assert!(ctx.is_hard_stop());
    }

    #[test]
    fn test_decode_error_reports_stream_failure() {
        let ctx = PipelineContext::new();
        let queue = filled_queue(StreamKind::Video, 5, 40);
        let backend = ScriptedVideo(ScriptedDecoder::new(1, 4).failing_at(2));
        let unit = DecodeUnit::new(StreamKind::Video, Box::new(backend));
        let mut processor =
            VideoProcessor::start(StreamWorker::new(queue, unit), ctx.clone(), Duration::from_millis(1));

        // 持续取帧，直到解码线程因错误退出
        wait_until(|| {
            processor.take_frame();
            processor.is_finished()
        });
        processor.join();

        let failure = ctx.failure().unwrap();
        assert_eq!(failure.stream, Some(StreamKind::Video));
        assert!(ctx.is_hard_stop());
    }
}
