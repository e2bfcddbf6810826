use crate::core::{AudioFormat, DecodedAudio, PlayerError, Result};
use ffmpeg_next::{software, util};
use log::{debug, info, warn};

/// 输出缓冲的安全余量：实际输出采样数可能超过按比例取整的估计值
const CAPACITY_MARGIN_NUM: usize = 6;
const CAPACITY_MARGIN_DEN: usize = 5;

/// 按采样率比例估计的输出采样数（每声道），向上取整
pub fn estimate_output_samples(in_rate: u32, out_rate: u32, in_samples: usize) -> usize {
    if in_rate == 0 {
        return 0;
    }
    let num = in_samples as u64 * out_rate as u64;
    num.div_ceil(in_rate as u64) as usize
}

/// 一帧转换后输出缓冲需要的字节数（含 20% 余量）
///
/// `ceil(in_samples × out_rate / in_rate) × channels × bytes_per_sample × 1.2`，向上取整
pub fn output_capacity(
    in_rate: u32,
    out_rate: u32,
    in_samples: usize,
    channels: u16,
    bytes_per_sample: usize,
) -> usize {
    let naive = estimate_output_samples(in_rate, out_rate, in_samples) * channels as usize * bytes_per_sample;
    (naive * CAPACITY_MARGIN_NUM).div_ceil(CAPACITY_MARGIN_DEN)
}

/// 一次转换的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Converted {
    pub sample_count: usize,    // 每声道采样数
    pub byte_size: usize,
}

/// 重采样边界：把解码帧转换成设备格式（交错 f32）
pub trait AudioConverter: Send {
    fn output_format(&self) -> AudioFormat;

    /// 转换结果追加到 `out`
    fn convert(&mut self, frame: &DecodedAudio, out: &mut Vec<f32>) -> Result<Converted>;

    /// 解码结束后取出内部缓存的尾部采样，追加到 `out`
    fn flush(&mut self, _out: &mut Vec<f32>) -> Result<Converted> {
        Ok(Converted::default())
    }
}

/// 输入格式描述
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputFormat {
    pub format: util::format::Sample,
    pub layout: util::channel_layout::ChannelLayout,
    pub rate: u32,
}

/// FFmpeg swresample 重采样器
pub struct FfmpegResampler {
    context: software::resampling::Context,
    input: InputFormat,
    output: AudioFormat,
}

// SwrContext 只在音频处理线程中使用
unsafe impl Send for FfmpegResampler {}

fn target_layout(channels: u16) -> util::channel_layout::ChannelLayout {
    match channels {
        1 => util::channel_layout::ChannelLayout::MONO,
        2 => util::channel_layout::ChannelLayout::STEREO,
        6 => util::channel_layout::ChannelLayout::_5POINT1,
        n => util::channel_layout::ChannelLayout::default(n as i32),
    }
}

fn build_context(input: &InputFormat, output: &AudioFormat) -> Result<software::resampling::Context> {
    software::resampling::Context::get(
        input.format,
        input.layout,
        input.rate,
        util::format::Sample::F32(util::format::sample::Type::Packed),
        target_layout(output.channels),
        output.sample_rate,
    )
    .map_err(|e| PlayerError::ResamplerInit(e.to_string()))
}

impl FfmpegResampler {
    /// 配置重采样器；失败属于初始化错误
    pub fn configure(input: InputFormat, output: AudioFormat) -> Result<Self> {
        info!(
            "🔧 初始化音频重采样器: {}Hz/{}ch {:?} → {}Hz/{}ch f32",
            input.rate,
            input.layout.channels(),
            input.format,
            output.sample_rate,
            output.channels
        );
        let context = build_context(&input, &output)?;
        Ok(Self {
            context,
            input,
            output,
        })
    }

    /// 交错 f32 输出帧，最多容纳 `samples` 个采样（每声道）
    fn output_frame(&self, samples: usize) -> util::frame::Audio {
        util::frame::Audio::new(
            util::format::Sample::F32(util::format::sample::Type::Packed),
            samples.max(1),
            target_layout(self.output.channels),
        )
    }

    fn frame_input(frame: &util::frame::Audio) -> InputFormat {
        let layout = if frame.channel_layout().is_empty() {
            util::channel_layout::ChannelLayout::default(frame.channels() as i32)
        } else {
            frame.channel_layout()
        };
        InputFormat {
            format: frame.format(),
            layout,
            rate: frame.rate(),
        }
    }
}

impl AudioConverter for FfmpegResampler {
    fn output_format(&self) -> AudioFormat {
        self.output
    }

    fn convert(&mut self, frame: &DecodedAudio, out: &mut Vec<f32>) -> Result<Converted> {
        let input = Self::frame_input(&frame.frame);
        if input != self.input {
            // 流中途格式变化（少见），按新格式重建
            warn!("音频输入格式变化: {:?} → {:?}，重建重采样器", self.input, input);
            self.context = build_context(&input, &self.output)
                .map_err(|e| PlayerError::ResampleError(e.to_string()))?;
            self.input = input;
        }

        let capacity = output_capacity(
            input.rate,
            self.output.sample_rate,
            frame.samples(),
            self.output.channels,
            self.output.bytes_per_sample,
        );

        // 按容量预分配输出帧，空帧只会分配与输入相同的采样数
        let frame_bytes = self.output.channels as usize * self.output.bytes_per_sample;
        let mut resampled = self.output_frame(capacity / frame_bytes);
        self.context
            .run(&frame.frame, &mut resampled)
            .map_err(|e| PlayerError::ResampleError(e.to_string()))?;

        let sample_count = resampled.samples();
        let byte_size = sample_count * frame_bytes;

        out.reserve(capacity / self.output.bytes_per_sample);
        let bytes = &resampled.data(0)[..byte_size];
        out.extend(bytemuck::pod_collect_to_vec::<u8, f32>(bytes));

        Ok(Converted {
            sample_count,
            byte_size,
        })
    }

    fn flush(&mut self, out: &mut Vec<f32>) -> Result<Converted> {
        let pending = match self.context.delay() {
            Some(delay) if delay.output > 0 => delay.output as usize,
            _ => return Ok(Converted::default()),
        };

        // flush 不会自己分配输出帧
        let mut tail = self.output_frame(pending);
        self.context
            .flush(&mut tail)
            .map_err(|e| PlayerError::ResampleError(e.to_string()))?;

        let sample_count = tail.samples().min(pending);
        let byte_size = sample_count * self.output.channels as usize * self.output.bytes_per_sample;
        if byte_size > 0 {
            out.extend(bytemuck::pod_collect_to_vec::<u8, f32>(&tail.data(0)[..byte_size]));
        }
        debug!("重采样器尾部: {} 采样", sample_count);

        Ok(Converted {
            sample_count,
            byte_size,
        })
    }
}

#[cfg(test)]
pub mod testing {
    //! 测试用转换器：每帧固定输出若干个静音采样
    use super::*;

    pub struct SilenceConverter {
        pub format: AudioFormat,
        pub samples_per_frame: usize,
    }

    impl AudioConverter for SilenceConverter {
        fn output_format(&self) -> AudioFormat {
            self.format
        }

        fn convert(&mut self, _frame: &DecodedAudio, out: &mut Vec<f32>) -> Result<Converted> {
            let total = self.samples_per_frame * self.format.channels as usize;
            out.extend(std::iter::repeat(0.0f32).take(total));
            Ok(Converted {
                sample_count: self.samples_per_frame,
                byte_size: total * self.format.bytes_per_sample,
            })
        }
    }

    /// 结束时还会吐出 `tail` 个采样的转换器
    pub struct TailingConverter {
        pub inner: SilenceConverter,
        pub tail: usize,
    }

    impl AudioConverter for TailingConverter {
        fn output_format(&self) -> AudioFormat {
            self.inner.format
        }

        fn convert(&mut self, frame: &DecodedAudio, out: &mut Vec<f32>) -> Result<Converted> {
            self.inner.convert(frame, out)
        }

        fn flush(&mut self, out: &mut Vec<f32>) -> Result<Converted> {
            let total = self.tail * self.inner.format.channels as usize;
            out.extend(std::iter::repeat(0.5f32).take(total));
            let converted = Converted {
                sample_count: self.tail,
                byte_size: total * self.inner.format.bytes_per_sample,
            };
            self.tail = 0;
            Ok(converted)
        }
    }
}
