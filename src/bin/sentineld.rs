//! sentineld - webcam sentinel daemon
//!
//! This daemon:
//! 1. Loads process configuration (file + SENTINEL_* env)
//! 2. Restores the last saved webcam settings
//! 3. Runs the capture loop and the HTTP control surface until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use webcam_sentinel::{
    api::{ApiConfig, ApiServer},
    config::SentineldConfig,
    sink::DropboxConnector,
    JsonFileSettingsStore, LogNotifier, Sentinel, SettingsStore, HttpSnapshotSource,
    WEBCAM_MODULE,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Webcam capture, motion detection and frame storage")]
struct Args {
    /// Daemon config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address; overrides the config file.
    #[arg(long)]
    api_addr: Option<String>,

    /// Directory holding saved module settings; overrides the config file.
    #[arg(long)]
    settings_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("SENTINEL_CONFIG", path);
    }
    let mut config = SentineldConfig::load()?;
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    if let Some(dir) = args.settings_dir {
        config.settings_dir = dir;
    }

    let store: Arc<dyn SettingsStore> = Arc::new(JsonFileSettingsStore::open(&config.settings_dir)?);
    let sentinel = Sentinel::builder()
        .source(Arc::new(HttpSnapshotSource::new(config.fetch_timeout)))
        .cloud_connector(Arc::new(DropboxConnector::with_endpoints(
            &config.cloud_api_url,
            &config.cloud_content_url,
            config.fetch_timeout,
        )))
        .notifier(Arc::new(LogNotifier))
        .options(config.sentinel_options())
        .build();

    restore_settings(&sentinel, store.as_ref());

    let capture = sentinel.spawn()?;
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        module_id: WEBCAM_MODULE.id.to_string(),
    };
    let api_handle = ApiServer::new(api_config, sentinel.clone())
        .with_settings_store(Arc::clone(&store))
        .spawn()?;
    for route in WEBCAM_MODULE.routes {
        log::debug!("route {} {}", route.method, route.path);
    }
    log::info!(
        "sentineld running: api on {}, settings in {}",
        api_handle.addr,
        config.settings_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("sentineld waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    capture.stop();
    sentinel.shutdown();

    Ok(())
}

/// Apply the saved settings. Missing or invalid ones leave the defaults in
/// place (capture disabled).
fn restore_settings(sentinel: &Sentinel, store: &dyn SettingsStore) {
    let saved = match store.get(WEBCAM_MODULE.id) {
        Ok(saved) => saved,
        Err(err) => {
            log::warn!("webcam: cannot read saved settings, using defaults: {:#}", err);
            None
        }
    };
    match sentinel.apply_settings(saved.as_ref()) {
        Ok(_) => {}
        Err(err) => {
            log::warn!("webcam: saved settings rejected, using defaults: {}", err);
            if let Err(err) = sentinel.apply_settings(None) {
                log::error!("webcam: default settings rejected: {}", err);
            }
        }
    }
}
