// 播放管线模块

pub mod demuxer;
pub mod demuxer_source;  // 数据包来源抽象接口
pub mod demuxer_thread;  // 读包线程
pub mod packet_queue;
pub mod decode_unit;     // 送包 / 取帧状态机
pub mod decoder;
pub mod resampler;
pub mod audio_output;
pub mod context;
pub mod pacing;
pub mod processor;
pub mod video_sink;
pub mod manager;

use std::process;
use std::thread;

pub use demuxer::Demuxer;
pub use manager::PlaybackSession;
pub use video_sink::{RawVideoSink, StatsSink, VideoSink};

/// 日志前缀：进程 ID + 线程 ID
pub(crate) fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}
