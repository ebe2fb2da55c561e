use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc;
use vrlink_config::EncoderBackend;
use vrlink_encode::{
    create_encoder, log_layout, plan, DeviceCapabilities, FragmentSink, HostDevice, VideoEncoder,
};

mod config;
mod dispatcher;
mod output;
mod pattern;

use dispatcher::Dispatcher;
use output::Packet;
use pattern::TestPattern;

/// Headless encoder host for vrlink.
///
/// Plans the encoder layout for the configured frame, feeds a moving test
/// pattern through every backend and writes one elementary stream per
/// region.
#[derive(Parser, Debug)]
#[command(name = "vrlink-server", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Source frame width in pixels.
    #[arg(long)]
    width: Option<u32>,

    /// Source frame height in pixels.
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second.
    #[arg(long)]
    fps: Option<f32>,

    /// Frames between forced keyframes (0 forces only the first).
    #[arg(long)]
    keyframe_interval: Option<u32>,

    /// Stop after this many frames. Runs until Ctrl-C if unset.
    #[arg(long)]
    frames: Option<u64>,

    /// Directory for the `stream<N>` output files.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the encoder layout and exit.
    #[arg(long)]
    plan_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_and_merge_config(&cli)?;
    let stream = cfg.stream.clone();

    let caps = host_capabilities();
    let mut layout = plan(&caps, stream.width, stream.height, Some(&cfg.encoding))
        .context("failed to plan encoder layout")?;
    tracing::info!(
        width = layout.width,
        height = layout.height,
        regions = layout.encoders.len(),
        "Encoder layout"
    );
    log_layout(&layout.encoders);
    if cli.plan_only {
        return Ok(());
    }

    if let Some(dir) = &cli.output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    }

    let device = Arc::new(HostDevice::new(caps));
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    let mut encoders: Vec<Box<dyn VideoEncoder>> = Vec::with_capacity(layout.encoders.len());
    for (index, settings) in layout.encoders.iter_mut().enumerate() {
        let sink = Arc::new(StreamSink {
            stream: index,
            tx: packet_tx.clone(),
        });
        let encoder = create_encoder(device.as_ref(), settings, stream.fps, sink)
            .with_context(|| format!("failed to start encoder {index} ({})", settings.encoder))?;
        encoders.push(encoder);
    }
    // Every sink holds a sender; the channel closes once the encoders drop.
    drop(packet_tx);

    let codecs = layout.encoders.iter().map(|s| s.codec).collect();
    let output_task = tokio::spawn(output::write_streams(cli.output.clone(), codecs, packet_rx));

    let stop = Arc::new(AtomicBool::new(false));
    let frame_loop = FrameLoop {
        device,
        dispatcher: Dispatcher::new(encoders, stream.keyframe_interval),
        pattern: TestPattern::new(layout.width, layout.height),
        frame_interval: Duration::from_secs_f32(1.0 / stream.fps),
        frames: cli.frames,
        stop: stop.clone(),
    };
    let mut frame_task = tokio::task::spawn_blocking(move || frame_loop.run());

    let frames = tokio::select! {
        result = &mut frame_task => result.context("frame loop panicked")??,
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            tracing::info!("Received SIGINT, shutting down");
            stop.store(true, Ordering::Relaxed);
            frame_task.await.context("frame loop panicked")??
        }
    };

    let stats = output_task.await.context("output task panicked")??;
    for (index, s) in stats.iter().enumerate() {
        tracing::info!(stream = index, bytes = s.bytes, frames = s.frames, "Stream closed");
    }
    tracing::info!(frames, "Server stopped");
    Ok(())
}

/// Load config from file and apply CLI overrides.
fn load_and_merge_config(cli: &Cli) -> Result<config::ServerConfig> {
    let cfg = config::load_config(cli.config.as_deref());
    config::merge(
        cfg,
        &config::Overrides {
            width: cli.width,
            height: cli.height,
            fps: cli.fps,
            keyframe_interval: cli.keyframe_interval,
        },
    )
}

/// Backends usable on the host-memory device.
///
/// Hardware sessions need exportable device memory, so only the software
/// encoder is offered.
fn host_capabilities() -> DeviceCapabilities {
    let probed = DeviceCapabilities::probe(0);
    let mut caps = DeviceCapabilities::new(probed.vendor());
    if probed.is_available(EncoderBackend::X265) {
        caps = caps.with_encoder(EncoderBackend::X265);
    }
    for backend in [EncoderBackend::Nvenc, EncoderBackend::Vaapi] {
        if probed.is_available(backend) {
            tracing::info!(%backend, "Skipping hardware encoder on host device");
        }
    }
    caps
}

/// Tags fragments with their stream index for the output task.
struct StreamSink {
    stream: usize,
    tx: mpsc::UnboundedSender<Packet>,
}

impl FragmentSink for StreamSink {
    fn send(&self, data: Bytes, is_last: bool) {
        let packet = Packet {
            stream: self.stream,
            data,
            is_last,
        };
        if self.tx.send(packet).is_err() {
            tracing::debug!(stream = self.stream, "Output closed, dropping fragment");
        }
    }
}

/// Blocking frame producer.
struct FrameLoop {
    device: Arc<HostDevice>,
    dispatcher: Dispatcher,
    pattern: TestPattern,
    frame_interval: Duration,
    frames: Option<u64>,
    stop: Arc<AtomicBool>,
}

impl FrameLoop {
    /// Render, dispatch and pace frames until stopped. Returns the number of
    /// frames encoded.
    fn run(mut self) -> Result<u64> {
        let (width, height) = self.pattern.size();
        let (luma, chroma) = self.pattern.render(0);
        let mut luma_scratch = luma.clone();
        let mut chroma_scratch = chroma.clone();
        let image = self
            .device
            .create_yuv_image(width, height, luma, chroma)
            .context("failed to create source image")?;

        let start = Instant::now();
        let result = loop {
            let frame = self.dispatcher.frames();
            if self.stop.load(Ordering::Relaxed) || self.frames.is_some_and(|n| frame >= n) {
                break Ok(frame);
            }

            self.pattern.render_into(frame, &mut luma_scratch, &mut chroma_scratch);
            if let Err(e) = self
                .device
                .write_image(image.luma, &luma_scratch)
                .and_then(|()| self.device.write_image(image.chroma, &chroma_scratch))
            {
                break Err(e).context("failed to update source image");
            }

            let pts = self.frame_interval.saturating_mul(u32::try_from(frame).unwrap_or(u32::MAX));
            if let Err(e) = self.dispatcher.dispatch(self.device.as_ref(), &image, pts) {
                break Err(e).context(format!("frame {frame} failed"));
            }

            if let Some(wait) = (start + pts + self.frame_interval).checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        };

        self.dispatcher.shutdown();
        result
    }
}
