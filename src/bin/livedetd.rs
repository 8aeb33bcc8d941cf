//! livedetd - live object-detection stream daemon
//!
//! This daemon:
//! 1. Samples every Kth frame from the configured source
//! 2. Runs the detector and suppresses overlapping boxes
//! 3. Draws the survivors and records them in the prediction log
//! 4. Serves the latest annotated frame as an MJPEG stream
//!
//! It exits when the source runs out of frames or on the first fatal error.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use livedet::{FramePipeline, LivedetConfig};

#[derive(Parser, Debug)]
#[command(name = "livedetd", about = "Live object-detection MJPEG stream daemon")]
struct Args {
    /// Config file (TOML, or JSON with a .json extension)
    #[arg(long, value_name = "PATH", env = "LIVEDET_CONFIG")]
    config: Option<PathBuf>,

    /// Frame source: stub://..., an image directory, a video file or an http(s) camera URL
    #[arg(long, value_name = "URI")]
    source: Option<String>,

    /// Sample every Nth frame
    #[arg(long, value_name = "N")]
    skip_frames: Option<u64>,

    /// Stream listen address, e.g. 0.0.0.0:7000
    #[arg(long, value_name = "ADDR")]
    stream_addr: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Args::parse()) {
        log::error!("livedetd: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut cfg = LivedetConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source = source;
    }
    if let Some(skip_frames) = args.skip_frames {
        cfg.skip_frames = skip_frames;
    }
    if let Some(addr) = args.stream_addr {
        cfg.stream.addr = addr;
    }
    cfg.validate()?;

    log::info!(
        "livedetd {} starting: source={}, skip_frames={}, detector={}",
        env!("CARGO_PKG_VERSION"),
        cfg.source,
        cfg.skip_frames,
        cfg.detector.backend
    );
    log::info!(
        "predictions: {} -> {}/{}",
        cfg.predictions.path.display(),
        cfg.predictions.bucket,
        cfg.predictions.key
    );

    let mut pipeline = FramePipeline::from_config(&cfg)?;
    let report = pipeline.run()?;
    log::info!(
        "livedetd done: {} frames sampled, {} records appended, final state {:?}",
        report.frames_sampled,
        report.records_appended,
        report.final_state
    );
    Ok(())
}
