use crate::core::{PlayerError, Result, VideoFrame};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 视频输出边界：接收平面像素数据（带每个平面的行跨度），以及尺寸变化
pub trait VideoSink {
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    fn present(&mut self, frame: &VideoFrame) -> Result<()>;
}

/// 只记录进度的输出（无窗口环境）
#[derive(Debug, Default)]
pub struct StatsSink {
    presented: Vec<i64>,
    resizes: usize,
    size: (u32, u32),
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按显示顺序记录的帧 PTS
    #[cfg(test)]
    pub fn presented_pts(&self) -> &[i64] {
        &self.presented
    }

    #[cfg(test)]
    pub fn resizes(&self) -> usize {
        self.resizes
    }

    #[cfg(test)]
    pub fn frames(&self) -> usize {
        self.presented.len()
    }
}

impl VideoSink for StatsSink {
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = (width, height);
        self.resizes += 1;
        info!("📐 视频尺寸: {}x{}（第 {} 次）", width, height, self.resizes);
        Ok(())
    }

    fn present(&mut self, frame: &VideoFrame) -> Result<()> {
        self.presented.push(frame.pts);
        let n = self.presented.len();
        if n <= 3 || n % 100 == 0 {
            debug!("🖼️  显示第 {} 帧: PTS={}ms ({}x{})", n, frame.pts, self.size.0, self.size.1);
        }
        Ok(())
    }
}

/// 把每一帧写成连续的平面 YUV（去掉行对齐填充），可用 ffplay -f rawvideo 查看
pub struct RawVideoSink {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: usize,
}

impl RawVideoSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        info!("💾 原始视频输出: {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            frames: 0,
        })
    }

    #[cfg(test)]
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl VideoSink for RawVideoSink {
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.frames > 0 {
            info!("📐 视频尺寸变化为 {}x{}（第 {} 帧之后）", width, height, self.frames);
        }
        Ok(())
    }

    fn present(&mut self, frame: &VideoFrame) -> Result<()> {
        for (index, plane) in frame.planes.iter().enumerate() {
            let stride = frame.linesizes.get(index).copied().unwrap_or(0);
            let row_bytes = frame.plane_width(index);
            let rows = frame.plane_height(index);
            if stride < row_bytes || plane.len() < stride * (rows.saturating_sub(1)) + row_bytes {
                return Err(PlayerError::RenderError(format!(
                    "平面 {} 数据不完整: stride={} 行宽={} 行数={} 长度={}",
                    index,
                    stride,
                    row_bytes,
                    rows,
                    plane.len()
                )));
            }
            for row in 0..rows {
                let start = row * stride;
                self.writer.write_all(&plane[start..start + row_bytes])?;
            }
        }
        self.frames += 1;
        Ok(())
    }
}

impl Drop for RawVideoSink {
    fn drop(&mut self) {
        match self.flush() {
            Ok(()) => info!("💾 已写入 {} 帧: {}", self.frames, self.path.display()),
            Err(e) => warn!("💾 写入 {} 失败: {}", self.path.display(), e),
        }
    }
}
