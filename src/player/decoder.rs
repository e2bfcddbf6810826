use crate::core::{DecodedAudio, PixelFormat, PlayerError, Result, StreamKind, TimeBase, VideoFrame};
use crate::player::decode_unit::{DecoderBackend, DrainStatus, FeedStatus};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, info};

/// 送包结果映射：EAGAIN 是背压，不是错误
fn map_feed(kind: StreamKind, result: std::result::Result<(), ffmpeg::Error>) -> Result<FeedStatus> {
    match result {
        Ok(()) => Ok(FeedStatus::Accepted),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(FeedStatus::Backpressure),
        Err(e) => Err(PlayerError::decode(kind, format!("send_packet: {}", e))),
    }
}

/// 取帧结果映射：EAGAIN 表示需要更多输入，EOF 表示解码结束
fn map_drain<F>(
    kind: StreamKind,
    result: std::result::Result<(), ffmpeg::Error>,
    frame: impl FnOnce() -> Result<F>,
) -> Result<DrainStatus<F>> {
    match result {
        Ok(()) => Ok(DrainStatus::Frame(frame()?)),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(DrainStatus::NeedMoreInput),
        Err(ffmpeg::Error::Eof) => Ok(DrainStatus::Eos),
        Err(e) => Err(PlayerError::decode(kind, format!("receive_frame: {}", e))),
    }
}

/// 为流打开解码器上下文：找不到解码器 / 打开失败分别报告
fn open_context(stream: &format::stream::Stream, kind: StreamKind) -> Result<codec::context::Context> {
    let parameters = stream.parameters();
    let codec_id = parameters.id();
    if codec::decoder::find(codec_id).is_none() {
        return Err(PlayerError::CodecNotFound {
            stream: kind,
            codec: codec_id.name().to_string(),
        });
    }
    codec::context::Context::from_parameters(parameters).map_err(|e| PlayerError::CodecOpen {
        stream: kind,
        message: e.to_string(),
    })
}

/// 视频解码后端（软件解码，输出 YUV420P 平面帧）
pub struct VideoDecoderBackend {
    decoder: codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    time_base: TimeBase,
}

// SwsContext 本身不是 Send，但我们确保只在单个线程中使用它
// 每个解码器实例只会被移动到一个视频处理线程中
unsafe impl Send for VideoDecoderBackend {}

/// 从视频流创建解码器
pub fn open_video_decoder(stream: &format::stream::Stream) -> Result<VideoDecoderBackend> {
    let context = open_context(stream, StreamKind::Video)?;
    let decoder = context.decoder().video().map_err(|e| PlayerError::CodecOpen {
        stream: StreamKind::Video,
        message: e.to_string(),
    })?;

    info!(
        "video_codec[{}] 解码器初始化成功: {}x{}, 格式: {:?}",
        stream.parameters().id().name(),
        decoder.width(),
        decoder.height(),
        decoder.format()
    );

    Ok(VideoDecoderBackend {
        decoder,
        scaler: None,
        time_base: TimeBase::from(stream.time_base()),
    })
}

impl VideoDecoderBackend {
    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    /// 把解码帧拷贝成平面 YUV420P（其他像素格式先经 swscale 转换）
    fn convert_frame(&mut self, frame: util::frame::Video) -> Result<VideoFrame> {
        let pts = frame
            .timestamp()
            .or_else(|| frame.pts())
            .map(|ts| self.time_base.to_millis(ts))
            .unwrap_or(0);

        let frame = if frame.format() == util::format::Pixel::YUV420P {
            frame
        } else {
            if self.scaler.is_none() {
                debug!("像素格式 {:?} → YUV420P，初始化 scaler", frame.format());
                self.scaler = Some(software::scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    util::format::Pixel::YUV420P,
                    frame.width(),
                    frame.height(),
                    software::scaling::Flags::BILINEAR,
                )?);
            }
            let mut converted = util::frame::Video::empty();
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.run(&frame, &mut converted)?;
            }
            converted
        };

        let planes = (0..3).map(|i| frame.data(i).to_vec()).collect();
        let linesizes = (0..3).map(|i| frame.stride(i)).collect();

        Ok(VideoFrame {
            pts,
            width: frame.width(),
            height: frame.height(),
            format: PixelFormat::YUV420P,
            planes,
            linesizes,
        })
    }
}

impl DecoderBackend for VideoDecoderBackend {
    type Frame = VideoFrame;

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<FeedStatus> {
        map_feed(StreamKind::Video, self.decoder.send_packet(packet))
    }

    fn send_eof(&mut self) -> Result<FeedStatus> {
        map_feed(StreamKind::Video, self.decoder.send_eof())
    }

    fn receive_frame(&mut self) -> Result<DrainStatus<VideoFrame>> {
        let mut decoded = util::frame::Video::empty();
        let result = self.decoder.receive_frame(&mut decoded);
        map_drain(StreamKind::Video, result, || self.convert_frame(decoded))
    }
}

/// 音频解码后端（输出原始解码帧，重采样在音频处理线程中完成）
pub struct AudioDecoderBackend {
    decoder: codec::decoder::Audio,
    time_base: TimeBase,
}

/// 从音频流创建解码器
pub fn open_audio_decoder(stream: &format::stream::Stream) -> Result<AudioDecoderBackend> {
    let context = open_context(stream, StreamKind::Audio)?;
    let decoder = context.decoder().audio().map_err(|e| PlayerError::CodecOpen {
        stream: StreamKind::Audio,
        message: e.to_string(),
    })?;

    info!(
        "audio_codec[{}] 解码器初始化成功: {} Hz, {} 声道, 格式: {:?}",
        stream.parameters().id().name(),
        decoder.rate(),
        decoder.channels(),
        decoder.format()
    );

    Ok(AudioDecoderBackend {
        decoder,
        time_base: TimeBase::from(stream.time_base()),
    })
}

impl AudioDecoderBackend {
    /// 解码器声明的输入格式（用于提前配置重采样器）
    pub fn input_format(&self) -> (util::format::Sample, util::channel_layout::ChannelLayout, u32) {
        let layout = if self.decoder.channel_layout().is_empty() {
            util::channel_layout::ChannelLayout::default(self.decoder.channels() as i32)
        } else {
            self.decoder.channel_layout()
        };
        (self.decoder.format(), layout, self.decoder.rate())
    }
}

impl DecoderBackend for AudioDecoderBackend {
    type Frame = DecodedAudio;

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<FeedStatus> {
        map_feed(StreamKind::Audio, self.decoder.send_packet(packet))
    }

    fn send_eof(&mut self) -> Result<FeedStatus> {
        map_feed(StreamKind::Audio, self.decoder.send_eof())
    }

    fn receive_frame(&mut self) -> Result<DrainStatus<DecodedAudio>> {
        let mut decoded = util::frame::Audio::empty();
        let result = self.decoder.receive_frame(&mut decoded);
        let time_base = self.time_base;
        map_drain(StreamKind::Audio, result, || {
            let pts = decoded
                .timestamp()
                .or_else(|| decoded.pts())
                .map(|ts| time_base.to_millis(ts))
                .unwrap_or(0);
            Ok(DecodedAudio::new(pts, decoded))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eagain_is_backpressure_not_error() {
        let status = map_feed(StreamKind::Video, Err(ffmpeg::Error::Other { errno: EAGAIN }));
        assert_eq!(status.unwrap(), FeedStatus::Backpressure);

        let drained: Result<DrainStatus<()>> =
            map_drain(StreamKind::Audio, Err(ffmpeg::Error::Other { errno: EAGAIN }), || Ok(()));
        assert!(matches!(drained, Ok(DrainStatus::NeedMoreInput)));
    }

    #[test]
    fn test_eof_means_eos() {
        let drained: Result<DrainStatus<()>> =
            map_drain(StreamKind::Video, Err(ffmpeg::Error::Eof), || Ok(()));
        assert!(matches!(drained, Ok(DrainStatus::Eos)));
    }

    #[test]
    fn test_other_errors_are_fatal_for_stream() {
        let status = map_feed(StreamKind::Audio, Err(ffmpeg::Error::InvalidData));
        let err = status.unwrap_err();
        assert_eq!(err.stream(), Some(StreamKind::Audio));
        assert!(!err.is_fatal_init());
    }

    #[test]
    fn test_pcm_file_decodes_and_resamples() {
        use crate::core::AudioFormat;
        use crate::player::demuxer::testing::write_wav;
        use crate::player::demuxer::Demuxer;
        use crate::player::demuxer_source::{PacketSource, SourceEvent};
        use crate::player::resampler::{estimate_output_samples, AudioConverter, FfmpegResampler, InputFormat};

        ffmpeg::init().unwrap();
        let wav = write_wav(44100, 1, 22050);
        let mut demuxer = Demuxer::open(wav.path().to_str().unwrap(), false, true).unwrap();
        let mut decoder = {
            let stream = demuxer.stream(StreamKind::Audio).unwrap();
            open_audio_decoder(&stream).unwrap()
        };
        let (format, layout, rate) = decoder.input_format();
        assert_eq!(rate, 44100);
        assert_eq!(layout.channels(), 1);

        // 44.1kHz 单声道 s16 → 48kHz 立体声 f32
        let mut resampler =
            FfmpegResampler::configure(InputFormat { format, layout, rate }, AudioFormat::f32(48000, 2)).unwrap();
        let mut samples = Vec::new();
        let (mut in_samples, mut out_samples) = (0, 0);

        let mut at_end = false;
        while !at_end {
            let status = match demuxer.next().unwrap() {
                SourceEvent::Packet(packet) => decoder.send_packet(&packet.packet).unwrap(),
                SourceEvent::EndOfStream => {
                    at_end = true;
                    decoder.send_eof().unwrap()
                }
            };
            assert_eq!(status, FeedStatus::Accepted);

            loop {
                match decoder.receive_frame().unwrap() {
                    DrainStatus::Frame(frame) => {
                        in_samples += frame.samples();
                        let converted = resampler.convert(&frame, &mut samples).unwrap();
                        assert_eq!(converted.byte_size, converted.sample_count * 2 * 4);
                        out_samples += converted.sample_count;
                    }
                    DrainStatus::NeedMoreInput | DrainStatus::Eos => break,
                }
            }
        }
        out_samples += resampler.flush(&mut samples).unwrap().sample_count;

        assert_eq!(in_samples, 22050);
        assert_eq!(samples.len(), out_samples * 2);
        let expected = estimate_output_samples(44100, 48000, in_samples);
        assert!(
            out_samples.abs_diff(expected) <= 32,
            "resampled {} samples, expected about {}",
            out_samples,
            expected
        );
        assert!(samples.iter().any(|s| s.abs() > 0.1));
    }
}
