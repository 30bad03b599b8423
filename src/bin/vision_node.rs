//! vision_node - camera station of the ripeness sorting line.
//!
//! 1. Loads the detector model
//! 2. Opens the camera (800x600 MJPG, one buffer)
//! 3. Connects to the MQTT broker and waits for the session
//! 4. Runs the scan / classify / cooldown / flush loop until the operator quits
//!
//! Any startup failure exits non-zero. So does a detector failure mid-run.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use ripeness_sorter::{
    build_backend, preview_log_target, FrameSource, HeadlessOperator, MqttPublisher,
    OperatorSurface, SorterConfig, TerminalPreview, V4l2Config, V4l2Source, VisionNode,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Classify fruit on the line and publish one label per object")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "SORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Show a live preview in the terminal (press q to quit).
    #[arg(long)]
    preview: bool,

    /// Log file used while the preview owns the terminal.
    #[arg(long, default_value = "vision_node.log")]
    log_file: PathBuf,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto, value_name = "MODE")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.preview {
        logger.target(preview_log_target(&args.log_file)?);
    }
    logger.init();
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());

    let cfg = SorterConfig::load_from(args.config.as_deref())?;

    let stage = ui.stage("Load detector");
    let detector = build_backend(&cfg.detector)?;
    stage.done();

    let stage = ui.stage("Open camera");
    let mut source = V4l2Source::new(V4l2Config::from(&cfg.camera))?;
    source.connect()?;
    stage.done();

    let stage = ui.stage("Connect to MQTT broker");
    let publisher = MqttPublisher::connect(&cfg.channel)?;
    stage.done();
    log::info!("publishing classifications on {}", publisher.topic());

    let mut operator: Box<dyn OperatorSurface> = if args.preview {
        Box::new(TerminalPreview::enter()?)
    } else {
        Box::new(HeadlessOperator::with_ctrlc()?)
    };

    let node = VisionNode::new(
        cfg.vision.clone(),
        Box::new(source),
        detector,
        Box::new(publisher),
    );
    let summary = node.run(operator.as_mut())?;
    drop(operator);

    log::info!(
        "scanned {} frame(s), published {} label(s), {} publish failure(s), {} missed frame(s)",
        summary.frames_scanned,
        summary.published,
        summary.publish_failures,
        summary.frames_skipped
    );
    Ok(())
}
