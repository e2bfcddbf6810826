//! 视频节拍控制：以音频时钟为主时钟，决定每个刷新节拍是跳过还是显示
//!
//! - 视频超前音频超过阈值：跳过本次节拍（不取帧、不渲染）
//! - 视频落后超过阈值：标记 faster，下一个刷新间隔减半（不丢帧）
//! - 阈值内：正常速度显示下一帧
//! - 没有音频时钟：按标称帧率固定节拍显示

use crate::core::{MediaClock, Result, StreamKind, VideoFrame};
use crate::player::context::PipelineContext;
use crate::player::log_ctx;
use crate::player::video_sink::VideoSink;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 音视频漂移容忍带（毫秒）
pub const SYNC_THRESHOLD_MS: i64 = 30;

/// 标称帧间隔（毫秒）；帧率无效时按 25fps
pub fn frame_interval_ms(frame_rate: f64) -> f64 {
    if frame_rate.is_finite() && frame_rate > 0.0 {
        1000.0 / frame_rate
    } else {
        40.0
    }
}

/// 单个节拍的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// 视频超前：本节拍不取帧
    Skip,
    Present,
}

/// 同步统计（漂移只记录，不作为错误）
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub presented: u64,
    pub skipped: u64,
    pub fast: u64,          // 落后、下一个间隔减半的次数
    pub normal: u64,        // 在容忍带内
    pub free_run: u64,      // 没有音频时钟，按固定帧率
    pub max_drift_ms: i64,  // 绝对值最大的漂移
}

/// 比例式节拍控制器（不是 PID）
pub struct PacingController {
    interval_ms: f64,
    threshold_ms: i64,
    ctx: Arc<PipelineContext>,
    stats: SyncStats,
}

impl PacingController {
    pub fn new(interval_ms: f64, threshold_ms: i64, ctx: Arc<PipelineContext>) -> Self {
        Self {
            interval_ms,
            threshold_ms,
            ctx,
            stats: SyncStats::default(),
        }
    }

    /// 根据视频 PTS 和音频时钟做出决定，并更新共享的 faster 标志
    pub fn evaluate(&mut self, video_pts: i64, audio_pts: Option<i64>) -> PacingDecision {
        let Some(audio_pts) = audio_pts else {
            self.ctx.set_faster(false);
            self.stats.free_run += 1;
            return PacingDecision::Present;
        };

        let drift = video_pts - audio_pts;
        if drift.abs() > self.stats.max_drift_ms.abs() {
            self.stats.max_drift_ms = drift;
        }

        if drift > self.threshold_ms {
            debug!("⏩ 视频超前 {}ms（video={} audio={}），跳过本节拍", drift, video_pts, audio_pts);
            self.ctx.set_faster(false);
            self.stats.skipped += 1;
            PacingDecision::Skip
        } else if drift < -self.threshold_ms {
            debug!("⏪ 视频落后 {}ms（video={} audio={}），加快刷新", -drift, video_pts, audio_pts);
            self.ctx.set_faster(true);
            self.stats.fast += 1;
            PacingDecision::Present
        } else {
            self.ctx.set_faster(false);
            self.stats.normal += 1;
            PacingDecision::Present
        }
    }

    /// 下一个刷新间隔：T 或 T/2
    pub fn next_interval(&self) -> Duration {
        next_interval(self.interval_ms, self.ctx.is_faster())
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    fn record_presented(&mut self) {
        self.stats.presented += 1;
    }
}

fn next_interval(interval_ms: f64, faster: bool) -> Duration {
    let ms = if faster { interval_ms / 2.0 } else { interval_ms };
    Duration::from_nanos((ms.max(0.0) * 1_000_000.0).round() as u64)
}

/// 刷新定时器线程：按节拍向通道发送 tick
///
/// 每次休眠前读取 faster 标志；通道容量为 1，展示端来不及处理的 tick 直接丢弃
pub struct RefreshTimer {
    ticks: Receiver<()>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl RefreshTimer {
    pub fn start(interval_ms: f64, ctx: Arc<PipelineContext>) -> Self {
        let (tx, rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread_handle = thread::spawn(move || {
            debug!("{} ⏱️  刷新定时器启动: {:.2}ms", log_ctx(), interval_ms);
            while flag.load(Ordering::Acquire) && !ctx.is_hard_stop() {
                thread::sleep(next_interval(interval_ms, ctx.is_faster()));
                match tx.try_send(()) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            debug!("{} ⏱️  刷新定时器退出", log_ctx());
        });

        Self {
            ticks: rx,
            running,
            thread_handle: Some(thread_handle),
        }
    }

    pub fn ticks(&self) -> Receiver<()> {
        self.ticks.clone()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ 刷新定时器线程 panic", log_ctx());
            }
        }
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 单槽就绪帧：展示循环只通过它读取解码结果
pub trait FrameSlot {
    /// 就绪帧的 PTS（毫秒）；还没有就绪帧时为 None
    fn next_pts(&self) -> Option<i64>;

    /// 取走就绪帧（即标记为已消费，解码端随后才会准备下一帧）
    fn take_frame(&self) -> Option<VideoFrame>;

    /// 解码已结束且没有剩余帧
    fn is_finished(&self) -> bool;
}

/// 展示循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationState {
    WaitTick,
    Evaluate,
    Present,
    Skip,
    Finished,
}

const TICK_WAIT: Duration = Duration::from_millis(50);

/// 展示循环：在调用线程上运行，直到视频结束或强制停止
pub struct PresentationLoop<'a> {
    slot: &'a dyn FrameSlot,
    clock: Option<MediaClock>,
    pacing: PacingController,
    ctx: Arc<PipelineContext>,
    ticks: Receiver<()>,
    timer: Option<RefreshTimer>,
    state: PresentationState,
    frame_size: Option<(u32, u32)>,
}

impl<'a> PresentationLoop<'a> {
    pub fn new(
        slot: &'a dyn FrameSlot,
        clock: Option<MediaClock>,
        pacing: PacingController,
        ctx: Arc<PipelineContext>,
        ticks: Receiver<()>,
    ) -> Self {
        Self {
            slot,
            clock,
            pacing,
            ctx,
            ticks,
            timer: None,
            state: PresentationState::WaitTick,
            frame_size: None,
        }
    }

    /// 由展示循环持有定时器，进入 Finished 时停止它
    pub fn with_timer(mut self, timer: RefreshTimer) -> Self {
        self.ticks = timer.ticks();
        self.timer = Some(timer);
        self
    }

    pub fn state(&self) -> PresentationState {
        self.state
    }

    /// 音频结束后不再以音频时钟为准
    fn audio_pts(&self) -> Option<i64> {
        if self.ctx.is_finished(StreamKind::Audio) {
            return None;
        }
        self.clock.as_ref().and_then(|clock| clock.now())
    }

    pub fn run(&mut self, sink: &mut dyn VideoSink) -> Result<SyncStats> {
        info!("{} 🎞️  展示循环启动", log_ctx());
        let result = self.drive(sink);

        self.state = PresentationState::Finished;
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }

        let stats = self.pacing.stats().clone();
        info!(
            "{} 🎞️  展示循环结束：显示 {} 帧，跳过 {} 次，加速 {} 次，最大漂移 {}ms",
            log_ctx(),
            stats.presented,
            stats.skipped,
            stats.fast,
            stats.max_drift_ms
        );
        result.map(|_| stats)
    }

    fn drive(&mut self, sink: &mut dyn VideoSink) -> Result<()> {
        loop {
            self.state = match self.state {
                PresentationState::WaitTick => {
                    if self.ctx.is_hard_stop() || self.slot.is_finished() {
                        PresentationState::Finished
                    } else {
                        match self.ticks.recv_timeout(TICK_WAIT) {
                            Ok(()) => PresentationState::Evaluate,
                            Err(RecvTimeoutError::Timeout) => PresentationState::WaitTick,
                            Err(RecvTimeoutError::Disconnected) => PresentationState::Finished,
                        }
                    }
                }
                PresentationState::Evaluate => match self.slot.next_pts() {
                    // 解码还没跟上，等下一个节拍
                    None => PresentationState::WaitTick,
                    Some(video_pts) => {
                        let audio_pts = self.audio_pts();
                        match self.pacing.evaluate(video_pts, audio_pts) {
                            PacingDecision::Skip => PresentationState::Skip,
                            PacingDecision::Present => PresentationState::Present,
                        }
                    }
                },
                PresentationState::Present => {
                    if let Some(frame) = self.slot.take_frame() {
                        let size = (frame.width, frame.height);
                        if self.frame_size != Some(size) {
                            sink.resize(size.0, size.1)?;
                            self.frame_size = Some(size);
                        }
                        sink.present(&frame)?;
                        self.pacing.record_presented();
                    }
                    PresentationState::WaitTick
                }
                PresentationState::Skip => PresentationState::WaitTick,
                PresentationState::Finished => return Ok(()),
            };
        }
    }
}
