//! stream_probe - connect to an MJPEG stream and report what arrives.
//!
//! Reads a fixed number of parts, decodes each as JPEG and prints its size and
//! dimensions. Useful for checking a running livedetd without a browser.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};

use livedet::stream::client::MjpegReader;

#[derive(Parser, Debug)]
#[command(name = "stream_probe", about = "Read parts from a livedet MJPEG stream")]
struct Args {
    /// Stream address, e.g. 127.0.0.1:7000
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Number of parts to read before exiting
    #[arg(long, default_value_t = 5)]
    parts: usize,

    /// Read timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut reader = MjpegReader::connect(&args.addr, Duration::from_secs(args.timeout_secs))?;
    println!("connected to {} (boundary '{}')", args.addr, reader.boundary());

    let started = Instant::now();
    for n in 0..args.parts {
        let Some(jpeg) = reader.next_part()? else {
            println!("stream closed after {} parts", n);
            return Ok(());
        };
        let image = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .with_context(|| format!("part {} is not a valid jpeg", n))?;
        println!(
            "part {}: {} bytes, {}x{} (+{} ms)",
            n,
            jpeg.len(),
            image.width(),
            image.height(),
            started.elapsed().as_millis()
        );
    }
    Ok(())
}
