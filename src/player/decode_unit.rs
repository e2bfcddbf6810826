//! 解码单元：把队列里的压缩包变成解码帧
//!
//! 解码器的"送包 / 取帧"协议被建模成显式的状态机：
//! 送包可能遇到背压（解码器内部已满，必须先取帧），
//! 取帧可能返回"需要更多输入"（不是错误，只是该送下一个包了）。

use crate::core::{PlayerError, QueueItem, Result, StreamKind};
use crate::player::packet_queue::PacketQueue;
use ffmpeg_next as ffmpeg;
use log::{debug, warn};
use std::sync::Arc;

/// 送包结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Accepted,
    /// 解码器暂时不能接收，先取帧
    Backpressure,
}

/// 取帧结果
#[derive(Debug)]
pub enum DrainStatus<F> {
    Frame(F),
    NeedMoreInput,
    /// 结束哨兵已送入，解码器不会再产出帧
    Eos,
}

/// 解码能力边界：FFmpeg 解码器和测试脚本解码器都实现它
pub trait DecoderBackend: Send {
    type Frame: Send;

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<FeedStatus>;

    /// 通知解码器不会再有输入
    fn send_eof(&mut self) -> Result<FeedStatus>;

    fn receive_frame(&mut self) -> Result<DrainStatus<Self::Frame>>;
}

/// 解码单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Fed,
    Draining,
    /// 终态
    Eos,
}

/// 驱动状态迁移的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent {
    PacketAccepted,
    EndOfInputAccepted,
    DrainRequested,
    NeedMoreInput,
    DecoderFinished,
}

impl DecodeState {
    /// 状态迁移函数（与实际解码无关，可单独测试）
    pub fn next(self, event: DecodeEvent) -> DecodeState {
        use DecodeEvent::*;
        use DecodeState::*;
        match (self, event) {
            (Eos, _) => Eos,
            (_, DecoderFinished) => Eos,
            (_, PacketAccepted) => Fed,
            (_, EndOfInputAccepted) => Draining,
            (_, DrainRequested) => Draining,
            (_, NeedMoreInput) => Idle,
        }
    }
}

/// 一个流的解码单元
pub struct DecodeUnit<F> {
    kind: StreamKind,
    backend: Box<dyn DecoderBackend<Frame = F>>,
    state: DecodeState,
    pending: Option<QueueItem>,     // 被背压退回、等待重新送入的元素
    blocked: bool,                  // 背压后尚未成功取到帧
    eof_sent: bool,
    packets_in: u64,
    frames_out: u64,
}

impl<F> DecodeUnit<F> {
    pub fn new(kind: StreamKind, backend: Box<dyn DecoderBackend<Frame = F>>) -> Self {
        Self {
            kind,
            backend,
            state: DecodeState::Idle,
            pending: None,
            blocked: false,
            eof_sent: false,
            packets_in: 0,
            frames_out: 0,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn is_eos(&self) -> bool {
        self.state == DecodeState::Eos
    }

    /// 有被背压退回的元素
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// 可以接收新的队列元素
    pub fn accepts_input(&self) -> bool {
        self.pending.is_none() && !self.blocked && !self.eof_sent && !self.is_eos()
    }

    pub fn packets_in(&self) -> u64 {
        self.packets_in
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// 送入一个队列元素（数据包或结束哨兵）
    ///
    /// 背压时元素留在单元内部，至少一次成功取帧之后才能用 `resume()` 重新送入
    pub fn feed(&mut self, item: QueueItem) -> Result<FeedStatus> {
        if self.pending.is_some() {
            return Err(PlayerError::decode(self.kind, "上一个数据包还在等待解码器接收"));
        }
        if self.eof_sent || self.is_eos() {
            return Err(PlayerError::decode(self.kind, "结束哨兵之后不能再送包"));
        }
        self.pending = Some(item);
        self.resume()
    }

    /// 重新送入被背压退回的元素；没有待送元素时返回 Accepted
    pub fn resume(&mut self) -> Result<FeedStatus> {
        if self.blocked {
            return Ok(FeedStatus::Backpressure);
        }
        let Some(item) = self.pending.take() else {
            return Ok(FeedStatus::Accepted);
        };

        let status = match &item {
            QueueItem::Packet(packet) => self.backend.send_packet(&packet.packet)?,
            QueueItem::EndOfStream => self.backend.send_eof()?,
        };

        match status {
            FeedStatus::Accepted => {
                if item.is_end_of_stream() {
                    debug!("[{}] 结束哨兵已送入解码器", self.kind);
                    self.eof_sent = true;
                    self.state = self.state.next(DecodeEvent::EndOfInputAccepted);
                } else {
                    self.packets_in += 1;
                    self.state = self.state.next(DecodeEvent::PacketAccepted);
                }
            }
            FeedStatus::Backpressure => {
                self.pending = Some(item);
                self.blocked = true;
            }
        }
        Ok(status)
    }

    /// 取一帧
    pub fn drain(&mut self) -> Result<DrainStatus<F>> {
        if self.is_eos() {
            return Ok(DrainStatus::Eos);
        }
        self.state = self.state.next(DecodeEvent::DrainRequested);

        match self.backend.receive_frame()? {
            DrainStatus::Frame(frame) => {
                self.blocked = false;
                self.frames_out += 1;
                Ok(DrainStatus::Frame(frame))
            }
            DrainStatus::NeedMoreInput if self.eof_sent => {
                // 哨兵送入后解码器不该再要输入，按结束处理
                warn!("[{}] 解码器在结束哨兵之后仍要求输入，视为结束", self.kind);
                self.state = self.state.next(DecodeEvent::DecoderFinished);
                Ok(DrainStatus::Eos)
            }
            DrainStatus::NeedMoreInput => {
                self.blocked = false;
                self.state = self.state.next(DecodeEvent::NeedMoreInput);
                Ok(DrainStatus::NeedMoreInput)
            }
            DrainStatus::Eos => {
                debug!(
                    "[{}] 解码器结束：送入 {} 个包，产出 {} 帧",
                    self.kind, self.packets_in, self.frames_out
                );
                self.state = self.state.next(DecodeEvent::DecoderFinished);
                Ok(DrainStatus::Eos)
            }
        }
    }
}

/// 拉取结果
#[derive(Debug)]
pub enum Pull<F> {
    Frame(F),
    /// 队列暂时为空，调用方稍后再试
    Starved,
    Finished,
}

enum FeedProgress {
    Fed,
    Starved,
    Blocked,
}

/// 队列 + 解码单元：实现"送包直到背压或队列为空，再取帧直到需要输入"的交替
pub struct StreamWorker<F> {
    queue: Arc<PacketQueue>,
    unit: DecodeUnit<F>,
}

impl<F> StreamWorker<F> {
    pub fn new(queue: Arc<PacketQueue>, unit: DecodeUnit<F>) -> Self {
        Self { queue, unit }
    }

    pub fn unit(&self) -> &DecodeUnit<F> {
        &self.unit
    }

    /// 取下一帧；队列暂时没有包时返回 Starved
    pub fn pull(&mut self) -> Result<Pull<F>> {
        loop {
            match self.unit.drain()? {
                DrainStatus::Frame(frame) => return Ok(Pull::Frame(frame)),
                DrainStatus::Eos => return Ok(Pull::Finished),
                DrainStatus::NeedMoreInput => match self.feed_available()? {
                    FeedProgress::Fed => continue,
                    FeedProgress::Starved => return Ok(Pull::Starved),
                    FeedProgress::Blocked => {
                        return Err(PlayerError::decode(
                            self.unit.kind(),
                            "解码器既不接收输入也不产出帧",
                        ))
                    }
                },
            }
        }
    }

    fn feed_available(&mut self) -> Result<FeedProgress> {
        let mut fed = false;

        if self.unit.has_pending() {
            match self.unit.resume()? {
                FeedStatus::Accepted => fed = true,
                FeedStatus::Backpressure => return Ok(FeedProgress::Blocked),
            }
        }

        while self.unit.accepts_input() {
            let Some(item) = self.queue.pop() else {
                break;
            };
            fed = true;
            if self.unit.feed(item)? == FeedStatus::Backpressure {
                break;
            }
        }

        Ok(if fed {
            FeedProgress::Fed
        } else {
            FeedProgress::Starved
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedDecoder, TestFrame};
    use super::*;
    use crate::player::demuxer_source::testing::packet;

    fn unit(frames_per_packet: usize, capacity: usize) -> DecodeUnit<TestFrame> {
        DecodeUnit::new(
            StreamKind::Video,
            Box::new(ScriptedDecoder::new(frames_per_packet, capacity)),
        )
    }

    fn item(pts: i64) -> QueueItem {
        QueueItem::Packet(packet(StreamKind::Video, pts))
    }

    #[test]
    fn test_transition_table() {
        use DecodeEvent::*;
        use DecodeState::*;
        assert_eq!(Idle.next(PacketAccepted), Fed);
        assert_eq!(Fed.next(DrainRequested), Draining);
        assert_eq!(Draining.next(NeedMoreInput), Idle);
        assert_eq!(Draining.next(PacketAccepted), Fed);
        assert_eq!(Fed.next(EndOfInputAccepted), Draining);
        assert_eq!(Draining.next(DecoderFinished), Eos);
        for event in [PacketAccepted, EndOfInputAccepted, DrainRequested, NeedMoreInput] {
            assert_eq!(Eos.next(event), Eos);
        }
    }

    #[test]
    fn test_need_more_input_is_not_an_error() {
        let mut unit = unit(1, 4);
        assert!(matches!(unit.drain(), Ok(DrainStatus::NeedMoreInput)));
        assert_eq!(unit.state(), DecodeState::Idle);
        assert_eq!(unit.feed(item(0)).unwrap(), FeedStatus::Accepted);
        assert_eq!(unit.state(), DecodeState::Fed);
        assert!(matches!(unit.drain(), Ok(DrainStatus::Frame(_))));
        assert_eq!(unit.state(), DecodeState::Draining);
    }

    #[test]
    fn test_backpressure_blocks_until_drain() {
        let mut unit = unit(2, 2);
        assert_eq!(unit.feed(item(0)).unwrap(), FeedStatus::Accepted);
        assert_eq!(unit.feed(item(40)).unwrap(), FeedStatus::Backpressure);
        assert!(unit.has_pending());
        assert!(!unit.accepts_input());

        // 没有成功取帧之前，重试不会触达解码器
        assert_eq!(unit.resume().unwrap(), FeedStatus::Backpressure);
        assert!(unit.feed(item(80)).is_err());

        assert!(matches!(unit.drain(), Ok(DrainStatus::Frame(_))));
        assert!(matches!(unit.drain(), Ok(DrainStatus::Frame(_))));
        assert_eq!(unit.resume().unwrap(), FeedStatus::Accepted);
        assert!(!unit.has_pending());
        assert_eq!(unit.packets_in(), 2);
    }

    #[test]
    fn test_eos_is_terminal() {
        let mut unit = unit(1, 4);
        unit.feed(item(0)).unwrap();
        unit.feed(QueueItem::EndOfStream).unwrap();
        assert!(matches!(unit.drain(), Ok(DrainStatus::Frame(_))));
        assert!(matches!(unit.drain(), Ok(DrainStatus::Eos)));
        for _ in 0..3 {
            assert!(matches!(unit.drain(), Ok(DrainStatus::Eos)));
        }
        assert!(unit.is_eos());
        assert!(unit.feed(item(40)).is_err());
    }

    #[test]
    fn test_worker_yields_every_frame_in_order() {
        let queue = Arc::new(PacketQueue::new(StreamKind::Video, 64));
        for i in 0..20 {
            queue.push_packet(packet(StreamKind::Video, i * 40));
        }
        queue.push_end_of_stream();

        // 每包 3 帧，解码器内部只能缓冲 4 帧：必然出现背压
        let mut worker = StreamWorker::new(queue.clone(), unit(3, 4));
        let mut frames = Vec::new();
        loop {
            match worker.pull().unwrap() {
                Pull::Frame(frame) => frames.push(frame),
                Pull::Starved => panic!("queue should never starve"),
                Pull::Finished => break,
            }
        }

        let expected: Vec<_> = (0..20)
            .flat_map(|i| (0..3).map(move |seq| TestFrame { source_pts: i * 40, seq }))
            .collect();
        assert_eq!(frames, expected);
        assert!(worker.unit().is_eos());
        assert!(queue.is_closed());
        assert!(matches!(worker.pull(), Ok(Pull::Finished)));
    }

    #[test]
    fn test_worker_starves_on_empty_queue() {
        let queue = Arc::new(PacketQueue::new(StreamKind::Audio, 4));
        let mut worker = StreamWorker::new(queue.clone(), unit(1, 4));
        assert!(matches!(worker.pull(), Ok(Pull::Starved)));

        queue.push_packet(packet(StreamKind::Audio, 0));
        assert!(matches!(worker.pull(), Ok(Pull::Frame(_))));
        assert!(matches!(worker.pull(), Ok(Pull::Starved)));
    }

    #[test]
    fn test_decoder_error_surfaces() {
        let queue = Arc::new(PacketQueue::new(StreamKind::Video, 4));
        queue.push_packet(packet(StreamKind::Video, 0));
        queue.push_packet(packet(StreamKind::Video, 40));
        let backend = ScriptedDecoder::new(1, 4).failing_at(1);
        let mut worker = StreamWorker::new(queue, DecodeUnit::new(StreamKind::Video, Box::new(backend)));

        // 第一个包正常，第二个包触发解码错误
        let err = loop {
            match worker.pull() {
                Ok(Pull::Frame(_)) => continue,
                Ok(other) => panic!("unexpected {:?}", other),
                Err(e) => break e,
            }
        };
        assert_eq!(err.stream(), Some(StreamKind::Video));
    }
}
