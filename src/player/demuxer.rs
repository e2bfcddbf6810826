use crate::core::{
    CompressedPacket, MediaInfo, PlayerError, Result, StreamDescriptor, StreamKind, TimeBase,
};
use crate::player::demuxer_source::{PacketSource, SourceEvent};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info};

/// 解封装器 - 负责读取媒体文件并分离音视频流
pub struct Demuxer {
    input_ctx: format::context::Input,
    video: Option<StreamDescriptor>,
    audio: Option<StreamDescriptor>,
    media_info: MediaInfo,  // 缓存媒体信息
    source_path: String,    // 媒体源路径（用于描述）
    finished: bool,         // 已经读到末尾，之后只返回 EndOfStream
}

impl Demuxer {
    /// 打开媒体文件，并取每种类型的第一个流
    ///
    /// 请求的流类型不存在时立即失败（在任何线程启动之前）
    pub fn open(path: &str, want_video: bool, want_audio: bool) -> Result<Self> {
        info!("正在打开文件: {}", path);

        let input_ctx = format::input(&path)
            .map_err(|e| PlayerError::OpenError(format!("{}: {}", path, e)))?;

        let video = if want_video {
            let desc = Self::first_stream(&input_ctx, media::Type::Video, StreamKind::Video)
                .ok_or_else(|| PlayerError::NoVideoStream(path.to_string()))?;
            info!("视频流索引: [{}] {}", desc.index, desc.codec_name);
            Some(desc)
        } else {
            None
        };

        let audio = if want_audio {
            let desc = Self::first_stream(&input_ctx, media::Type::Audio, StreamKind::Audio)
                .ok_or_else(|| PlayerError::NoAudioStream(path.to_string()))?;
            info!("音频流索引: [{}] {}", desc.index, desc.codec_name);
            Some(desc)
        } else {
            None
        };

        let mut demuxer = Self {
            input_ctx,
            video,
            audio,
            media_info: MediaInfo::default(),
            source_path: path.to_string(),
            finished: false,
        };
        demuxer.media_info = demuxer.extract_media_info()?;
        debug!("媒体信息: {:?}", demuxer.media_info);

        Ok(demuxer)
    }

    fn first_stream(
        input_ctx: &format::context::Input,
        medium: media::Type,
        kind: StreamKind,
    ) -> Option<StreamDescriptor> {
        input_ctx
            .streams()
            .find(|s| s.parameters().medium() == medium)
            .map(|s| StreamDescriptor {
                index: s.index(),
                kind,
                time_base: TimeBase::from(s.time_base()),
                codec_name: s.parameters().id().name().to_string(),
            })
    }

    /// 提取媒体信息（内部使用）
    fn extract_media_info(&self) -> Result<MediaInfo> {
        let mut info = MediaInfo {
            duration: self.input_ctx.duration().max(0) / 1000, // 微秒转毫秒
            ..MediaInfo::default()
        };

        if let Some(stream) = self.stream(StreamKind::Video) {
            let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
            let video = context.decoder().video()?;
            info.width = video.width();
            info.height = video.height();
            info.fps = Self::stream_frame_rate(&stream).unwrap_or(0.0);
            info.video_codec = stream.parameters().id().name().to_string();
        }

        if let Some(stream) = self.stream(StreamKind::Audio) {
            let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
            let audio = context.decoder().audio()?;
            info.sample_rate = audio.rate();
            info.channels = audio.channels();
            info.audio_codec = stream.parameters().id().name().to_string();
        }

        Ok(info)
    }

    /// 平均帧率，没有时退回到基础帧率
    fn stream_frame_rate(stream: &format::stream::Stream) -> Option<f64> {
        [stream.avg_frame_rate(), stream.rate()]
            .into_iter()
            .filter(|r| r.numerator() > 0 && r.denominator() > 0)
            .map(f64::from)
            .next()
    }

    /// 视频帧率；流里没有可用信息时返回 None，由调用方决定默认值
    pub fn frame_rate(&self) -> Option<f64> {
        self.stream(StreamKind::Video)
            .and_then(|s| Self::stream_frame_rate(&s))
    }

    /// 获取指定类型的流（只有打开时选中的流）
    pub fn stream(&self, kind: StreamKind) -> Option<format::stream::Stream> {
        let desc = match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
            StreamKind::Other => None,
        }?;
        self.input_ctx.stream(desc.index)
    }

    /// 获取媒体信息
    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    /// 打印容器信息
    pub fn dump(&self) {
        info!("-----------------File Information---------------");
        let index = self.video.as_ref().map(|d| d.index as i32).unwrap_or(0);
        format::context::input::dump(&self.input_ctx, index, Some(&self.source_path));
        info!("-------------------------------------------------");
    }

    fn classify(&self, stream_index: usize) -> StreamKind {
        if self.video.as_ref().map(|d| d.index) == Some(stream_index) {
            StreamKind::Video
        } else if self.audio.as_ref().map(|d| d.index) == Some(stream_index) {
            StreamKind::Audio
        } else {
            StreamKind::Other
        }
    }
}

impl PacketSource for Demuxer {
    fn next(&mut self) -> Result<SourceEvent> {
        if self.finished {
            return Ok(SourceEvent::EndOfStream);
        }

        // 不用 packets() 迭代器：它会吞掉非 EOF 的读错误
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input_ctx) {
            Ok(()) => {
                let stream_index = packet.stream();
                let kind = self.classify(stream_index);
                Ok(SourceEvent::Packet(CompressedPacket::new(kind, stream_index, packet)))
            }
            Err(ffmpeg::Error::Eof) => {
                info!("📄 文件读取完毕: {}", self.source_path);
                self.finished = true;
                Ok(SourceEvent::EndOfStream)
            }
            Err(e) => Err(PlayerError::SourceRead(format!("{}: {}", self.source_path, e))),
        }
    }

    fn video_stream(&self) -> Option<&StreamDescriptor> {
        self.video.as_ref()
    }

    fn audio_stream(&self) -> Option<&StreamDescriptor> {
        self.audio.as_ref()
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::write_wav;
    use super::*;

    fn open_wav(file: &tempfile::NamedTempFile, want_video: bool, want_audio: bool) -> Result<Demuxer> {
        ffmpeg::init().unwrap();
        Demuxer::open(file.path().to_str().unwrap(), want_video, want_audio)
    }

    #[test]
    fn test_audio_only_file_fails_video_request() {
        let wav = write_wav(44100, 1, 22050);
        let err = match open_wav(&wav, true, true) {
            Ok(_) => panic!("a WAV file has no video stream"),
            Err(e) => e,
        };
        assert!(matches!(err, PlayerError::NoVideoStream(_)));
        assert!(err.is_fatal_init());
    }

    #[test]
    fn test_end_of_stream_repeats_after_last_packet() {
        let wav = write_wav(44100, 1, 22050);
        let mut demuxer = open_wav(&wav, false, true).unwrap();
        assert!(demuxer.video_stream().is_none());
        let audio = demuxer.audio_stream().cloned().unwrap();
        assert_eq!(audio.codec_name, "pcm_s16le");
        assert_eq!(demuxer.media_info().sample_rate, 44100);
        assert_eq!(demuxer.media_info().channels, 1);
        assert!(demuxer.frame_rate().is_none());

        let (mut packets, mut bytes) = (0, 0);
        loop {
            match demuxer.next().unwrap() {
                SourceEvent::Packet(packet) => {
                    assert_eq!(packet.kind, StreamKind::Audio);
                    assert_eq!(packet.stream_index, audio.index);
                    bytes += packet.size();
                    packets += 1;
                }
                SourceEvent::EndOfStream => break,
            }
        }
        assert!(packets > 1);
        assert_eq!(bytes, 22050 * 2);

        for _ in 0..3 {
            assert!(matches!(demuxer.next(), Ok(SourceEvent::EndOfStream)));
        }
    }

    #[test]
    fn test_unselected_stream_packets_are_other() {
        let wav = write_wav(48000, 2, 4800);
        let mut demuxer = open_wav(&wav, false, false).unwrap();
        assert!(demuxer.stream(StreamKind::Audio).is_none());
        match demuxer.next().unwrap() {
            SourceEvent::Packet(packet) => assert_eq!(packet.kind, StreamKind::Other),
            SourceEvent::EndOfStream => panic!("expected a packet"),
        }
    }
}
