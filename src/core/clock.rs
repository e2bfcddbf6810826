use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// 媒体时钟 - 音频设备当前播放到的位置（毫秒），供视频节拍控制读取
///
/// 只有音频路径写入，节拍控制器读取；正常播放下不会回退。
#[derive(Clone)]
pub struct MediaClock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    pts_ms: AtomicI64,
    started: AtomicBool,    // 是否收到过第一帧音频
}

impl MediaClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                pts_ms: AtomicI64::new(i64::MIN),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// 更新音频时钟（毫秒）。比当前值小的 PTS 被忽略
    pub fn update(&self, pts_ms: i64) {
        self.inner.pts_ms.fetch_max(pts_ms, Ordering::AcqRel);
        self.inner.started.store(true, Ordering::Release);
    }

    /// 当前音频时钟；还没有音频帧时为 None
    pub fn now(&self) -> Option<i64> {
        if !self.inner.started.load(Ordering::Acquire) {
            return None;
        }
        Some(self.inner.pts_ms.load(Ordering::Acquire))
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}
