use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vigil_core::{IdentityGallery, PresenceEvent, PresenceTracker, SystemClock};
use vigil_store::SqliteSessionStore;

mod config;
mod monitor;
mod replay;
mod worker;

use config::Config;
use monitor::Monitor;
use replay::{Recording, ReplayRecognizer, ReplaySource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env();

    let store = SqliteSessionStore::open(&config.db_path)
        .with_context(|| format!("failed to open session store {}", config.db_path.display()))?;
    let gallery = IdentityGallery::load_json(&config.gallery_path)
        .with_context(|| format!("failed to load gallery {}", config.gallery_path.display()))?;
    let recording = Recording::load(&config.replay_path)
        .with_context(|| format!("failed to load recording {}", config.replay_path.display()))?;

    if recording.is_empty() {
        tracing::warn!(path = %config.replay_path.display(), "recording has no frames");
    }

    tracing::info!(
        db = %config.db_path.display(),
        identities = gallery.len(),
        frames = recording.len(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let clock = Arc::new(SystemClock);
    let tracker = PresenceTracker::new(Arc::new(store), clock.clone())
        .with_inactivity(config.inactivity())
        .with_rollover(config.rollover_policy())
        .with_listener(|event| match event {
            PresenceEvent::Arrived { id, name } => {
                tracing::debug!(%id, name = %name, "presence: arrived");
            }
            PresenceEvent::Departed { name, record } => {
                tracing::debug!(
                    id = %record.identity_id,
                    name = %name,
                    duration_secs = record.duration_secs,
                    "presence: departed"
                );
            }
        });

    let recording = Arc::new(recording);
    let mut monitor = Monitor::new(
        ReplaySource::new(recording.clone()),
        ReplayRecognizer::new(recording.clone(), config.match_threshold),
        Arc::new(tracker),
        clock,
        config.submit_interval(),
    );
    monitor.start_worker(
        ReplayRecognizer::new(recording, config.match_threshold),
        Arc::new(gallery),
        config.worker_settings(),
    )?;

    tracing::info!("vigild ready");

    let mut ticker = tokio::time::interval(config.tick());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                tracing::info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                let tick = match monitor.tick() {
                    Ok(tick) => tick,
                    Err(e) => {
                        tracing::error!(error = %e, "worker failed");
                        break;
                    }
                };
                for e in &tick.errors {
                    tracing::warn!(error = %e, "session not persisted; will retry");
                }
                if tick.exhausted {
                    tracing::info!("recording finished");
                    break;
                }
            }
        }
    }

    tracing::info!("vigild shutting down");
    let closed = monitor.shutdown()?;
    tracing::info!(sessions = closed.len(), "vigild stopped");

    Ok(())
}
