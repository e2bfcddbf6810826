use crate::core::{CompressedPacket, Result, StreamDescriptor};

/// 读包结果
#[derive(Debug)]
pub enum SourceEvent {
    Packet(CompressedPacket),
    /// 到达文件末尾；之后每次调用都返回它
    EndOfStream,
}

/// 数据包来源抽象接口
///
/// 读包线程只依赖这个 trait，本地文件（FFmpeg）和测试用的脚本源都实现它
pub trait PacketSource: Send {
    /// 读取下一个数据包
    ///
    /// 返回：
    /// - Ok(SourceEvent::Packet): 成功读取一个包（包括未使用流的包，标记为 Other）
    /// - Ok(SourceEvent::EndOfStream): 到达末尾，幂等
    /// - Err(e): 读取错误，对整个管线是致命的，不重试
    fn next(&mut self) -> Result<SourceEvent>;

    /// 第一个视频流
    fn video_stream(&self) -> Option<&StreamDescriptor>;

    /// 第一个音频流
    fn audio_stream(&self) -> Option<&StreamDescriptor>;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
