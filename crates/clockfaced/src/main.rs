use anyhow::{Context, Result};
use clockface_core::{
    AdmissionController, ChannelSink, EmbeddingCache, VerificationPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detector;
mod store;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use detector::CommandFaceDetector;
use store::SqliteIdentityStore;

/// How long shutdown waits for admitted attempts to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("clockfaced starting");

    let config = Config::load().context("failed to load configuration")?;

    let store = Arc::new(
        SqliteIdentityStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );
    let detector = Arc::new(CommandFaceDetector::new(
        config.detector_command.clone(),
        config.detector_args.clone(),
    ));
    let cache = Arc::new(EmbeddingCache::new(config.cache_ttl));
    let admission = Arc::new(AdmissionController::new(config.max_concurrent));
    let (sink, mut progress_rx) = ChannelSink::channel(config.progress_buffer);

    let pipeline = Arc::new(
        VerificationPipeline::new(
            config.pipeline_config(),
            detector,
            store.clone(),
            cache.clone(),
            admission.clone(),
        )
        .with_progress_sink(Arc::new(sink)),
    );

    let connection = config
        .bus
        .builder()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(pipeline, store))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    // Progress signals are sent from their own task so a slow bus never
    // holds up a verification.
    let iface = connection
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await?;
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "progress event not serializable");
                    continue;
                }
            };
            if let Err(e) = AttendanceService::progress(iface.signal_emitter(), &payload).await {
                tracing::debug!(error = %e, "progress signal not sent");
            }
        }
    });

    let sweep_cache = cache.clone();
    let sweep_every = config.cache_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let purged = sweep_cache.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = sweep_cache.len(), "expired cache entries swept");
            }
        }
    });

    tracing::info!(
        bus = ?config.bus,
        db = %config.db_path.display(),
        detector = %config.detector_command,
        max_concurrent = config.max_concurrent,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        geofence_radius_m = config.geofence_radius_m,
        strict_liveness = config.strict_liveness,
        "clockfaced ready"
    );

    tokio::signal::ctrl_c().await?;
    admission.close();
    tracing::info!(in_flight = admission.in_flight(), "clockfaced draining");
    if !admission.wait_idle(SHUTDOWN_GRACE).await {
        tracing::warn!(
            in_flight = admission.in_flight(),
            "attempts still running after shutdown grace period"
        );
    }
    tracing::info!("clockfaced shutting down");

    Ok(())
}
