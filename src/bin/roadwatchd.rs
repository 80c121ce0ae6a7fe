//! roadwatchd - road damage pipeline daemon
//!
//! This daemon:
//! 1. Reads tracked detections from the configured JSONL stream
//! 2. Collapses same-class duplicate boxes per frame
//! 3. Dispatches rate-limited enrichment calls per track
//! 4. Upserts one durable record per track id

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use roadwatch::config::RoadwatchConfig;
use roadwatch::{
    AnalysisClient, DetectionSource, EnrichmentConfig, EnrichmentEngine, HttpAnalysisClient,
    JsonlSource, OverlapResolver, Pipeline, SqliteDamageStore, StubAnalysisClient,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = RoadwatchConfig::load()?;

    let client: Arc<dyn AnalysisClient> = match &cfg.analysis.endpoint {
        Some(endpoint) => {
            log::info!("analysis endpoint: {}", endpoint);
            Arc::new(HttpAnalysisClient::new(endpoint, cfg.analysis.timeout)?)
        }
        None => {
            log::warn!("no analysis endpoint configured, using stub verdicts");
            Arc::new(StubAnalysisClient::default())
        }
    };

    let engine = EnrichmentEngine::new(
        EnrichmentConfig {
            interval_secs: cfg.analysis.enrichment_interval_secs,
            max_concurrent: cfg.analysis.max_concurrent,
        },
        client,
    );
    let store = SqliteDamageStore::open(&cfg.db_path)?;
    let mut pipeline = Pipeline::new(
        cfg.confidence_threshold,
        OverlapResolver::new(cfg.overlap_threshold_percent),
        engine,
        Box::new(store),
    );

    let mut source = JsonlSource::open(std::path::Path::new(&cfg.source_path))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "roadwatchd running. source={}, db={}",
        cfg.source_path,
        cfg.db_path
    );

    let mut frame_count = 0u64;
    let mut kept_total = 0u64;
    let mut suppressed_total = 0u64;
    let mut last_health_log = Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("shutdown signal received");
            break;
        }

        let Some(frame) = source.next_frame()? else {
            log::info!("detection stream ended");
            break;
        };

        frame_count += 1;
        if frame_count % cfg.frame_skip_interval != 0 {
            continue;
        }

        let summary = pipeline.process_frame(frame)?;
        kept_total += summary.kept as u64;
        suppressed_total += summary.suppressed as u64;

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log::info!(
                "health: {} frames read, {} detections kept, {} suppressed",
                frame_count,
                kept_total,
                suppressed_total
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("draining enrichment workers...");
    pipeline.shutdown();
    log::info!(
        "done. {} frames read, {} detections kept, {} suppressed",
        frame_count,
        kept_total,
        suppressed_total
    );
    Ok(())
}
