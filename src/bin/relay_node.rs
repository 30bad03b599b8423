//! relay_node - bridge from the classification channel to the sorting mechanism.
//!
//! Subscribes to the classification topic and writes one command per known
//! label (`R\n`, `U\n` or `M\n`) to the serial link. Runs until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ripeness_sorter::{MqttSubscriber, RelayNode, SerialLink, SorterConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Forward classification labels to the sorter's serial link")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "SORTER_CONFIG")]
    config: Option<PathBuf>,

    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto, value_name = "MODE")]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui, std::io::stderr().is_terminal());

    let cfg = SorterConfig::load_from(args.config.as_deref())?;

    let stage = ui.stage("Open serial port");
    let serial = SerialLink::open(
        &cfg.relay.serial_port,
        cfg.relay.baud_rate,
        cfg.relay.write_timeout,
    )?;
    stage.done();

    let stage = ui.stage("Create MQTT client");
    let subscriber = MqttSubscriber::connect(&cfg.channel)?;
    stage.done();
    log::info!("listening on {}", subscriber.topic());

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl+C handler")?;

    let summary = RelayNode::new(&cfg.relay, Box::new(subscriber), serial).run(&stop)?;
    log::info!(
        "forwarded {} command(s), ignored {} label(s), dropped {} undecodable and {} unwritten message(s)",
        summary.forwarded,
        summary.ignored,
        summary.decode_failures,
        summary.write_failures
    );
    Ok(())
}
