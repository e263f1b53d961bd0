//! mirrord - smart mirror companion daemon
//!
//! This daemon:
//! 1. Loads configuration and seeds the data directory
//! 2. Serves the mirror page and JSON API
//! 3. Optionally runs emotion detection on a fixed interval

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use mirror_companion::{
    api::{ApiConfig, ApiServer, AppState},
    ensure_data_files, EmotionPipeline, MirrorConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "MIRROR_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address, overriding the configured one.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    let default_level = std::env::var("MIRROR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let args = Args::parse();
    let mut config = MirrorConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    ensure_data_files(&config.data_paths())?;
    log::info!("mirror data directory: {}", config.data_dir.display());

    let pipeline = Arc::new(EmotionPipeline::from_config(&config)?);
    let state = Arc::new(AppState::from_config(&config, pipeline.clone()));
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, state).spawn()?;
    log::info!("mirror api listening on {}", api_handle.addr);

    let (stop_detection, detection) = match config.emotion.detection_interval {
        Some(interval) => {
            let (tx, join) = spawn_detection(pipeline, interval);
            (Some(tx), Some(join))
        }
        None => {
            log::info!("periodic detection disabled; waiting for /emotion requests");
            (None, None)
        }
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("mirrord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    drop(stop_detection);
    if let Some(join) = detection {
        join.join()
            .map_err(|_| anyhow!("detection thread panicked"))?;
    }
    api_handle.stop()?;
    Ok(())
}

/// Runs the pipeline every `interval` until the returned sender is dropped.
fn spawn_detection(
    pipeline: Arc<EmotionPipeline>,
    interval: Duration,
) -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    log::info!("periodic detection every {:?}", interval);
    let join = std::thread::spawn(move || loop {
        pipeline.run_once();
        match rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    });
    (tx, join)
}
