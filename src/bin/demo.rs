//! demo - end-to-end synthetic run of the sorting line on one machine.
//!
//! Both loops run in this process, joined by the in-memory channel instead of
//! MQTT. The camera is the synthetic `stub://` source, the detector replays a
//! fixed script, and serial commands are written to stdout.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ripeness_sorter::{
    loopback, preview_log_target, Frame, FrameSource, HeadlessOperator, OperatorSurface,
    RelayNode, SerialLink, SorterConfig, StubBackend, TerminalPreview, V4l2Config, V4l2Source,
    VisionNode,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the vision and relay loops against synthetic input")]
struct Args {
    /// Configuration file; the camera, detector and channel sections are ignored.
    #[arg(long, env = "SORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds.
    #[arg(long, default_value_t = 20)]
    duration_secs: u64,

    /// Cooldown between classifications, in milliseconds.
    #[arg(long, default_value_t = 1500)]
    cooldown_ms: u64,

    /// Synthetic camera frame interval, in milliseconds.
    #[arg(long, default_value_t = 50)]
    frame_interval_ms: u64,

    /// Show the synthetic camera in the terminal. Serial output is discarded.
    #[arg(long)]
    preview: bool,

    /// Log file used while the preview owns the terminal.
    #[arg(long, default_value = "demo.log")]
    log_file: PathBuf,
}

/// Synthetic camera throttled to a fixed frame rate.
struct PacedSource {
    inner: V4l2Source,
    interval: Duration,
    next_at: Instant,
}

impl FrameSource for PacedSource {
    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let now = Instant::now();
        if self.next_at > now {
            std::thread::sleep(self.next_at - now);
        }
        self.next_at = Instant::now() + self.interval;
        self.inner.next_frame()
    }
}

/// Ends the run when the shared stop flag is raised or the inner surface quits.
struct StopAware {
    inner: Box<dyn OperatorSurface>,
    stop: Arc<AtomicBool>,
}

impl OperatorSurface for StopAware {
    fn show(&mut self, frame: &Frame) -> Result<()> {
        self.inner.show(frame)
    }

    fn set_status(&mut self, status: &str) {
        self.inner.set_status(status)
    }

    fn quit_requested(&mut self) -> Result<bool> {
        Ok(self.stop.load(Ordering::SeqCst) || self.inner.quit_requested()?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.preview {
        logger.target(preview_log_target(&args.log_file)?);
    }
    logger.init();

    let mut cfg = SorterConfig::load_from(args.config.as_deref())?;
    cfg.camera.device = "stub://belt".to_string();
    cfg.camera.width = 160;
    cfg.camera.height = 120;
    cfg.vision.cooldown = Duration::from_millis(args.cooldown_ms.max(1));

    let stop = Arc::new(AtomicBool::new(false));
    let inner: Box<dyn OperatorSurface> = if args.preview {
        Box::new(TerminalPreview::enter()?)
    } else {
        Box::new(HeadlessOperator::with_ctrlc()?)
    };
    let mut operator = StopAware {
        inner,
        stop: Arc::clone(&stop),
    };

    let (publisher, subscriber) = loopback();
    // Held until the relay is joined so it never sees the channel close.
    let _keepalive = publisher.clone();

    // The preview owns stdout; commands still show up in the log file.
    let serial_out: Box<dyn Write + Send> = if args.preview {
        Box::new(std::io::sink())
    } else {
        Box::new(std::io::stdout())
    };
    let relay_settings = cfg.relay.clone();
    let relay_stop = Arc::clone(&stop);
    let relay = std::thread::Builder::new()
        .name("relay".to_string())
        .spawn(move || {
            let serial = SerialLink::new(serial_out);
            RelayNode::new(&relay_settings, Box::new(subscriber), serial).run(&relay_stop)
        })
        .context("spawn relay thread")?;

    let timer_stop = Arc::clone(&stop);
    let duration = Duration::from_secs(args.duration_secs);
    std::thread::Builder::new()
        .name("demo-timer".to_string())
        .spawn(move || {
            std::thread::sleep(duration);
            timer_stop.store(true, Ordering::SeqCst);
        })
        .context("spawn timer thread")?;

    let mut source = PacedSource {
        inner: V4l2Source::new(V4l2Config::from(&cfg.camera))?,
        interval: Duration::from_millis(args.frame_interval_ms),
        next_at: Instant::now(),
    };
    source.connect()?;

    let node = VisionNode::new(
        cfg.vision.clone(),
        Box::new(source),
        Box::new(StubBackend::new()),
        Box::new(publisher),
    );
    let vision_result = node.run(&mut operator);
    drop(operator);

    stop.store(true, Ordering::SeqCst);
    let relay_result = relay
        .join()
        .map_err(|_| anyhow!("relay thread panicked"))?;

    let vision = vision_result?;
    let relay = relay_result?;
    log::info!(
        "demo finished: {} frame(s) scanned, {} label(s) published, {} command(s) forwarded, {} label(s) ignored",
        vision.frames_scanned,
        vision.published,
        relay.forwarded,
        relay.ignored
    );
    Ok(())
}
