use crate::core::StreamKind;
use crate::player::context::PipelineContext;
use crate::player::demuxer_source::{PacketSource, SourceEvent};
use crate::player::log_ctx;
use crate::player::packet_queue::PacketQueue;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 读包线程统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaderStats {
    pub packets_read: usize,
    pub video_packets: usize,
    pub audio_packets: usize,
    pub discarded: usize,       // 未使用流的包
}

/// 读包线程：纯粹的泵，把数据包按流类型分发到各自队列
///
/// 任一队列 `needs_more()` 时连续读包，之后短暂休眠（轮询 + 让出，而不是忙等）
pub struct PacketReader {
    thread_handle: Option<JoinHandle<ReaderStats>>,
    stats: Option<ReaderStats>,
}

struct Route {
    video: Option<Arc<PacketQueue>>,
    audio: Option<Arc<PacketQueue>>,
}

impl Route {
    fn queues(&self) -> impl Iterator<Item = &Arc<PacketQueue>> {
        self.video.iter().chain(self.audio.iter())
    }

    fn wants_data(&self) -> bool {
        self.queues().any(|q| q.needs_more())
    }

    fn any_closed(&self) -> bool {
        self.queues().any(|q| q.is_closed())
    }

    /// 给每个队列补上结束哨兵（每个队列只会推一次）
    fn seal(&self) {
        for queue in self.queues() {
            if queue.push_end_of_stream() {
                debug!("{} [{}] 已推入结束哨兵", log_ctx(), queue.kind());
            }
        }
    }
}

impl PacketReader {
    /// 启动读包线程
    pub fn start(
        mut source: Box<dyn PacketSource>,
        video_queue: Option<Arc<PacketQueue>>,
        audio_queue: Option<Arc<PacketQueue>>,
        ctx: Arc<PipelineContext>,
        poll_interval: Duration,
    ) -> Self {
        let route = Route {
            video: video_queue,
            audio: audio_queue,
        };

        let thread_handle = thread::spawn(move || {
            Self::read_loop(&mut *source, &route, &ctx, poll_interval)
        });

        Self {
            thread_handle: Some(thread_handle),
            stats: None,
        }
    }

    /// 读包循环（在独立线程中运行）
    fn read_loop(
        source: &mut dyn PacketSource,
        route: &Route,
        ctx: &PipelineContext,
        poll_interval: Duration,
    ) -> ReaderStats {
        info!("{} 🎬 读包线程启动: {}", log_ctx(), source.description());

        let mut stats = ReaderStats::default();
        const LOG_FIRST_N: usize = 5;

        'pump: while !ctx.is_source_exhausted() && !ctx.is_close_requested() && !route.any_closed() {
            while route.wants_data() {
                if ctx.is_close_requested() {
                    break 'pump;
                }

                match source.next() {
                    Ok(SourceEvent::Packet(packet)) => {
                        stats.packets_read += 1;
                        let target = match packet.kind {
                            StreamKind::Video => route.video.as_ref(),
                            StreamKind::Audio => route.audio.as_ref(),
                            StreamKind::Other => None,
                        };

                        match target {
                            Some(queue) => {
                                let count = match packet.kind {
                                    StreamKind::Video => {
                                        stats.video_packets += 1;
                                        stats.video_packets
                                    }
                                    _ => {
                                        stats.audio_packets += 1;
                                        stats.audio_packets
                                    }
                                };
                                if count <= LOG_FIRST_N || count % 100 == 0 {
                                    debug!(
                                        "{} 📦 [{}] 包 #{}（队列 {}，总计 {}）",
                                        log_ctx(),
                                        packet.kind,
                                        count,
                                        queue.len(),
                                        stats.packets_read
                                    );
                                }
                                if !queue.push_packet(packet) {
                                    warn!("{} [{}] 队列已关闭，丢弃数据包", log_ctx(), queue.kind());
                                }
                            }
                            None => {
                                stats.discarded += 1;
                                debug!(
                                    "{} 跳过未使用流的包: stream_index = [{}]",
                                    log_ctx(),
                                    packet.stream_index
                                );
                            }
                        }
                    }
                    Ok(SourceEvent::EndOfStream) => {
                        info!("{} 📄 数据源结束，推入结束哨兵", log_ctx());
                        route.seal();
                        ctx.mark_source_exhausted();
                        break 'pump;
                    }
                    Err(e) => {
                        ctx.report_failure(None, e.to_string());
                        break 'pump;
                    }
                }
            }
            thread::sleep(poll_interval);
        }

        // 停止读取后补上哨兵，已入队的包仍能解码到结束
        route.seal();

        info!(
            "{} 🛑 读包线程退出（共读取 {} 个包：{} 视频，{} 音频，{} 丢弃）",
            log_ctx(),
            stats.packets_read,
            stats.video_packets,
            stats.audio_packets,
            stats.discarded
        );
        stats
    }

    /// 等待线程结束并返回统计
    pub fn join(&mut self) -> ReaderStats {
        if let Some(handle) = self.thread_handle.take() {
            match handle.join() {
                Ok(stats) => self.stats = Some(stats),
                Err(_) => error!("{} ❌ 读包线程 panic", log_ctx()),
            }
        }
        self.stats.clone().unwrap_or_default()
    }
}

impl Drop for PacketReader {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ PacketReader 被 drop，但未调用 join()，等待线程退出", log_ctx());
            self.join();
        }
    }
}
