use ffmpeg_next as ffmpeg;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 逻辑流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    /// 未使用的流（字幕、数据等），读包线程直接丢弃
    Other,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Other => "other",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流时间基（pts * num / den = 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 把流时间单位换算成毫秒
    pub fn to_millis(&self, pts: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        let ms = pts as i128 * self.num as i128 * 1000 / self.den as i128;
        ms as i64
    }
}

impl From<ffmpeg::Rational> for TimeBase {
    fn from(r: ffmpeg::Rational) -> Self {
        Self::new(r.numerator(), r.denominator())
    }
}

/// 启动时确定的流描述，之后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    pub codec_name: String,
}

/// 压缩数据包：由 PacketSource 创建，交给唯一的 PacketQueue，最终被对应的 DecodeUnit 消费
pub struct CompressedPacket {
    pub kind: StreamKind,
    pub stream_index: usize,
    pub packet: ffmpeg::Packet,
}

impl CompressedPacket {
    pub fn new(kind: StreamKind, stream_index: usize, packet: ffmpeg::Packet) -> Self {
        Self {
            kind,
            stream_index,
            packet,
        }
    }

    /// 显示时间戳（流时间单位）
    pub fn pts(&self) -> Option<i64> {
        self.packet.pts()
    }

    pub fn size(&self) -> usize {
        self.packet.size()
    }
}

impl fmt::Debug for CompressedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedPacket")
            .field("kind", &self.kind)
            .field("stream_index", &self.stream_index)
            .field("pts", &self.pts())
            .field("size", &self.size())
            .finish()
    }
}

/// 队列元素：数据包或流结束哨兵
#[derive(Debug)]
pub enum QueueItem {
    Packet(CompressedPacket),
    /// 该流不会再有数据包
    EndOfStream,
}

impl QueueItem {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, QueueItem::EndOfStream)
    }
}

/// 解码单元产出的帧都带有毫秒 PTS
pub trait MediaFrame: Send {
    fn pts_ms(&self) -> i64;
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    YUV420P,
}

/// 视频帧数据（平面格式，保留每个平面的行跨度）
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
    pub linesizes: Vec<usize>,
}

impl VideoFrame {
    /// 平面 `index` 的有效行数
    pub fn plane_height(&self, index: usize) -> usize {
        match (self.format, index) {
            (PixelFormat::YUV420P, 0) => self.height as usize,
            (PixelFormat::YUV420P, _) => (self.height as usize + 1) / 2,
        }
    }

    /// 平面 `index` 每行的有效字节数（不含对齐填充）
    pub fn plane_width(&self, index: usize) -> usize {
        match (self.format, index) {
            (PixelFormat::YUV420P, 0) => self.width as usize,
            (PixelFormat::YUV420P, _) => (self.width as usize + 1) / 2,
        }
    }
}

impl MediaFrame for VideoFrame {
    fn pts_ms(&self) -> i64 {
        self.pts
    }
}

/// 解码后、重采样前的音频帧
pub struct DecodedAudio {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub frame: ffmpeg::frame::Audio,
}

impl DecodedAudio {
    pub fn new(pts: i64, frame: ffmpeg::frame::Audio) -> Self {
        Self { pts, frame }
    }

    pub fn samples(&self) -> usize {
        self.frame.samples()
    }
}

impl fmt::Debug for DecodedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedAudio")
            .field("pts", &self.pts)
            .field("samples", &self.frame.samples())
            .field("rate", &self.frame.rate())
            .finish()
    }
}

impl MediaFrame for DecodedAudio {
    fn pts_ms(&self) -> i64 {
        self.pts
    }
}

/// 音频输出格式（交错 f32）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: usize,
}

impl AudioFormat {
    pub fn f32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_sample: std::mem::size_of::<f32>(),
        }
    }

    /// 给定毫秒数对应的交错采样数
    pub fn samples_for_millis(&self, ms: u64) -> usize {
        (self.sample_rate as u64 * ms / 1000) as usize * self.channels as usize
    }

    /// 交错采样数对应的播放时长（毫秒，向下取整）
    pub fn millis_for_samples(&self, samples: usize) -> i64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let frames = (samples / self.channels as usize) as i64;
        frames * 1000 / self.sample_rate as i64
    }
}

/// 媒体信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: i64,          // 总时长（毫秒）
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            duration: 0,
            width: 0,
            height: 0,
            fps: 0.0,
            video_codec: "none".to_string(),
            audio_codec: "none".to_string(),
            sample_rate: 0,
            channels: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_base_to_millis() {
        assert_eq!(TimeBase::new(1, 90000).to_millis(90000), 1000);
        assert_eq!(TimeBase::new(1, 44100).to_millis(44100 * 3), 3000);
        assert_eq!(TimeBase::new(1, 0).to_millis(123), 0);
        assert_eq!(TimeBase::MILLIS.to_millis(42), 42);
    }

    #[test]
    fn test_yuv420p_plane_geometry() {
        let frame = VideoFrame {
            pts: 0,
            width: 5,
            height: 3,
            format: PixelFormat::YUV420P,
            planes: vec![Vec::new(); 3],
            linesizes: vec![8, 4, 4],
        };
        assert_eq!(frame.plane_width(0), 5);
        assert_eq!(frame.plane_height(0), 3);
        assert_eq!(frame.plane_width(1), 3);
        assert_eq!(frame.plane_height(2), 2);
    }

    #[test]
    fn test_samples_for_millis() {
        let format = AudioFormat::f32(48000, 2);
        assert_eq!(format.samples_for_millis(500), 48000);
        assert_eq!(format.bytes_per_sample, 4);
        assert_eq!(format.millis_for_samples(48000), 500);
        assert_eq!(format.millis_for_samples(960 * 2), 20);
        assert_eq!(AudioFormat::f32(0, 2).millis_for_samples(1000), 0);
    }
}
