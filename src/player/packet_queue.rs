use crate::core::{CompressedPacket, QueueItem, StreamKind};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 每个流一个的数据包队列（单生产者：读包线程；单消费者：对应的处理线程）
///
/// 容量是"软上限"：读包线程轮询 `needs_more()`，队列本身不阻塞。
/// 流结束哨兵推入之后不再接受任何数据包。
pub struct PacketQueue {
    kind: StreamKind,
    target_depth: usize,
    items: Mutex<VecDeque<QueueItem>>,
    len: AtomicUsize,
    pushed: AtomicUsize,        // 累计推入（数据包 + 哨兵）
    eos_pushed: AtomicBool,
    closed: AtomicBool,         // 哨兵已推入且已被取走
}

impl PacketQueue {
    pub fn new(kind: StreamKind, target_depth: usize) -> Self {
        Self {
            kind,
            target_depth: target_depth.max(1),
            items: Mutex::new(VecDeque::with_capacity(target_depth)),
            len: AtomicUsize::new(0),
            pushed: AtomicUsize::new(0),
            eos_pushed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// 推入一个元素；哨兵之后的任何推入都会被拒绝
    pub fn push(&self, item: QueueItem) -> bool {
        let mut items = self.items.lock();
        if self.eos_pushed.load(Ordering::Acquire) {
            warn!("[{}] 队列已收到结束哨兵，丢弃后续元素", self.kind);
            return false;
        }
        if item.is_end_of_stream() {
            debug!("[{}] 推入结束哨兵（之前共 {} 个包）", self.kind, self.pushed.load(Ordering::Relaxed));
            self.eos_pushed.store(true, Ordering::Release);
        }
        items.push_back(item);
        self.len.store(items.len(), Ordering::Release);
        self.pushed.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn push_packet(&self, packet: CompressedPacket) -> bool {
        self.push(QueueItem::Packet(packet))
    }

    /// 推入结束哨兵；已经推过时什么也不做，返回 false
    pub fn push_end_of_stream(&self) -> bool {
        if self.eos_pushed.load(Ordering::Acquire) {
            return false;
        }
        self.push(QueueItem::EndOfStream)
    }

    /// 非阻塞取出队首；空时返回 None
    pub fn pop(&self) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let item = items.pop_front()?;
        self.len.store(items.len(), Ordering::Release);
        if item.is_end_of_stream() {
            self.closed.store(true, Ordering::Release);
        }
        Some(item)
    }

    /// 低于目标深度且尚未收到结束哨兵
    pub fn needs_more(&self) -> bool {
        !self.eos_pushed.load(Ordering::Acquire) && self.len() < self.target_depth
    }

    /// 哨兵已推入并已被消费者取走
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_end_of_stream_pushed(&self) -> bool {
        self.eos_pushed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 累计推入数量（含哨兵）
    pub fn pushed_count(&self) -> usize {
        self.pushed.load(Ordering::Acquire)
    }
}
