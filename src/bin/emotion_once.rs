//! emotion_once - run the emotion pipeline a single time
//!
//! Captures one frame, classifies it, stores the result in the data
//! directory and prints it to stdout.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use mirror_companion::{ensure_data_files, EmotionPipeline, EmotionResult, MirrorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "MIRROR_CONFIG")]
    config: Option<PathBuf>,
    /// Camera device, e.g. /dev/video0 or stub://test.
    #[arg(long)]
    device: Option<String>,
    /// Exit non-zero when the run ends in "error".
    #[arg(long, default_value_t = false)]
    strict: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = MirrorConfig::load_from(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.camera.device = device;
    }
    ensure_data_files(&config.data_paths())?;

    let pipeline = EmotionPipeline::from_config(&config)?;
    let result = pipeline.run_once();
    println!("{}", result);

    if args.strict && result == EmotionResult::Error {
        std::process::exit(1);
    }
    Ok(())
}
