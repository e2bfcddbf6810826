use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

mod core;
mod player;

use crate::core::PlayerConfig;
use crate::player::{Demuxer, PlaybackSession, RawVideoSink, StatsSink, VideoSink};

/// 音视频同步播放（无窗口）：读包、解码、音频主时钟节拍
#[derive(Parser, Debug)]
#[command(name = "myy_sync_player", version)]
struct Args {
    /// 媒体文件路径或 URL
    input: String,

    /// JSON 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 不播放音频（视频按固定帧率）
    #[arg(long)]
    no_audio: bool,

    /// 不处理视频
    #[arg(long)]
    no_video: bool,

    /// 把显示的帧写成原始 YUV420P 文件
    #[arg(long)]
    dump: Option<PathBuf>,

    /// 音视频漂移容忍带（毫秒）
    #[arg(long)]
    threshold_ms: Option<i64>,

    /// 只打印容器和流信息
    #[arg(long)]
    probe: bool,
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::load(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?,
        None => PlayerConfig::default(),
    };
    if args.no_audio {
        config.audio_enabled = false;
    }
    if args.no_video {
        config.video_enabled = false;
    }
    if let Some(threshold) = args.threshold_ms {
        config.sync_threshold_ms = threshold;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    info!("🎬 MYY Sync Player 启动");

    // 初始化 FFmpeg
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("FFmpeg 初始化失败: {}", e))?;
    info!("✅ FFmpeg 初始化成功");

    let config = load_config(&args)?;

    if args.probe {
        let demuxer = Demuxer::open(&args.input, config.video_enabled, config.audio_enabled)?;
        demuxer.dump();
        println!("{}", serde_json::to_string_pretty(demuxer.media_info())?);
        return Ok(());
    }

    let mut session = PlaybackSession::open(&args.input, &config).map_err(|e| {
        if e.is_fatal_init() {
            error!("❌ 初始化失败，没有启动任何线程: {}", e);
        }
        e
    })?;
    info!("📄 媒体信息: {:?}", session.media_info());

    // 第一次 Ctrl-C 优雅关闭（已入队的数据继续播完），第二次强制停止
    let handle = session.close_handle();
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("收到 Ctrl-C，正在关闭（再按一次强制停止）");
            handle.close();
        } else {
            warn!("再次收到 Ctrl-C，强制停止");
            handle.abort();
        }
    })
    .context("注册 Ctrl-C 处理器失败")?;

    let mut sink: Box<dyn VideoSink> = match &args.dump {
        Some(path) => Box::new(RawVideoSink::create(path)?),
        None => Box::new(StatsSink::new()),
    };

    let report = session.run(sink.as_mut())?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
