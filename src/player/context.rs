use crate::core::StreamKind;
use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 某个流的致命错误记录
#[derive(Debug, Clone, Serialize)]
pub struct StreamFailure {
    pub stream: Option<StreamKind>, // None 表示数据源本身出错
    pub message: String,
}

/// 管线共享上下文：各线程入口通过引用拿到它，替代零散的全局标志
#[derive(Default)]
pub struct PipelineContext {
    close_requested: AtomicBool,    // 读包线程停止读取
    hard_stop: AtomicBool,          // 处理线程立即退出，不再排空队列
    source_exhausted: AtomicBool,
    faster: AtomicBool,             // 视频落后于音频，下一个刷新间隔减半
    video_finished: AtomicBool,
    audio_finished: AtomicBool,
    failure: Mutex<Option<StreamFailure>>,
}

impl PipelineContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 优雅关闭：停止读包，已入队的包继续解码到结束
    pub fn request_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            info!("⏹️  收到关闭请求");
        }
    }

    /// 强制关闭：处理线程尽快退出
    pub fn request_hard_stop(&self) {
        self.request_close();
        if !self.hard_stop.swap(true, Ordering::AcqRel) {
            info!("⏹️  收到强制停止请求");
        }
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn is_hard_stop(&self) -> bool {
        self.hard_stop.load(Ordering::Acquire)
    }

    pub fn mark_source_exhausted(&self) {
        self.source_exhausted.store(true, Ordering::Release);
    }

    pub fn is_source_exhausted(&self) -> bool {
        self.source_exhausted.load(Ordering::Acquire)
    }

    pub fn set_faster(&self, faster: bool) {
        self.faster.store(faster, Ordering::Release);
    }

    pub fn is_faster(&self) -> bool {
        self.faster.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self, stream: StreamKind) {
        match stream {
            StreamKind::Video => self.video_finished.store(true, Ordering::Release),
            StreamKind::Audio => self.audio_finished.store(true, Ordering::Release),
            StreamKind::Other => {}
        }
    }

    pub fn is_finished(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Video => self.video_finished.load(Ordering::Acquire),
            StreamKind::Audio => self.audio_finished.load(Ordering::Acquire),
            StreamKind::Other => true,
        }
    }

    /// 记录致命错误并强制停止整个会话（音视频是一起请求的，任一路失败都结束播放）
    ///
    /// 只保留第一个错误
    pub fn report_failure(&self, stream: Option<StreamKind>, message: impl Into<String>) {
        let message = message.into();
        error!("❌ 管线错误 ({:?}): {}", stream, message);
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(StreamFailure { stream, message });
            }
        }
        if let Some(kind) = stream {
            self.mark_finished(kind);
        }
        self.request_hard_stop();
    }

    pub fn failure(&self) -> Option<StreamFailure> {
        self.failure.lock().clone()
    }
}

/// 可跨线程传递的关闭句柄（例如给 Ctrl-C 处理器）
#[derive(Clone)]
pub struct CloseHandle {
    ctx: Arc<PipelineContext>,
}

impl CloseHandle {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub fn close(&self) {
        self.ctx.request_close();
    }

    pub fn abort(&self) {
        self.ctx.request_hard_stop();
    }

    #[cfg(test)]
    pub fn is_close_requested(&self) -> bool {
        self.ctx.is_close_requested()
    }
}
