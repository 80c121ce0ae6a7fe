//! Track-scoped enrichment: throttling and async dispatch.
//!
//! Every confirmed track is periodically submitted to the content-analysis
//! collaborator. The frame path must never wait on that call, so submissions
//! go through a bounded worker pool and results land in a per-track verdict
//! slot that the frame path reads on its next pass.
//!
//! Throttling is optimistic: the per-track dispatch timestamp is recorded at
//! submission, not completion, which bounds the request rate per track even
//! when analysis latency exceeds the throttle interval. The cost is that two
//! calls for one track can be in flight at once; the verdict slot is
//! last-write-wins by completion order. Verdicts are advisory text, so the
//! ordering gap is accepted.

pub mod client;

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::{DamageClass, Detection, Verdict};
use client::{parse_verdict, AnalysisClient};

const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Tuning for the enrichment engine.
#[derive(Clone, Copy, Debug)]
pub struct EnrichmentConfig {
    /// Minimum seconds between dispatches for one track. Zero or negative
    /// means every eligible observation dispatches.
    pub interval_secs: f64,
    /// Worker thread count; also the pending-job queue bound. When the queue
    /// is full a dispatch decision is skipped without consuming the track's
    /// throttle window.
    pub max_concurrent: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// Per-track throttle and result state. Severity and recommendation always
/// travel together inside one `Verdict`; the slot is swapped whole, never
/// field by field.
#[derive(Clone, Debug, Default)]
struct TrackState {
    /// Epoch seconds of the most recent submission, if any.
    last_dispatch_s: Option<f64>,
    /// Most recent completed verdict, if any.
    latest_verdict: Option<Verdict>,
}

struct EnrichmentJob {
    track_id: i64,
    damage_type: DamageClass,
    jpeg: Vec<u8>,
}

type SharedStates = Arc<Mutex<HashMap<i64, TrackState>>>;

/// Owns all per-track enrichment state and the dispatch worker pool.
pub struct EnrichmentEngine {
    config: EnrichmentConfig,
    states: SharedStates,
    sender: Option<SyncSender<EnrichmentJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl EnrichmentEngine {
    pub fn new(config: EnrichmentConfig, client: Arc<dyn AnalysisClient>) -> Self {
        let workers = config.max_concurrent.max(1);
        let states: SharedStates = Arc::new(Mutex::new(HashMap::new()));
        let (sender, receiver) = mpsc::sync_channel::<EnrichmentJob>(workers);
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers)
            .map(|worker_idx| {
                let receiver = receiver.clone();
                let client = client.clone();
                let states = states.clone();
                std::thread::spawn(move || {
                    run_worker(worker_idx, &receiver, client.as_ref(), &states)
                })
            })
            .collect();

        Self {
            config,
            states,
            sender: Some(sender),
            workers: handles,
        }
    }

    /// Frame-path entry point: record an observation of `det` at `now_s`
    /// (epoch seconds), possibly dispatching an enrichment call, and return
    /// the latest completed verdict for the track (`None` until the first
    /// call completes).
    ///
    /// Never blocks on analysis and never fails. A dispatch is attempted iff
    /// the track's throttle window has elapsed (or it was never dispatched)
    /// and the crop has non-zero pixel area. On successful submission the
    /// dispatch timestamp is advanced immediately.
    ///
    /// Verdict slots are swapped whole, so even a poisoned state lock cannot
    /// expose a torn severity/recommendation pair; the guard is recovered
    /// rather than failing the frame path.
    pub fn observe(&self, det: &Detection, now_s: f64) -> Option<Verdict> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(det.track_id).or_default();

        let window_open = self.config.interval_secs <= 0.0
            || state
                .last_dispatch_s
                .map_or(true, |last| now_s - last > self.config.interval_secs);

        if window_open && !det.crop.is_empty() {
            match &self.sender {
                Some(sender) => {
                    let job = EnrichmentJob {
                        track_id: det.track_id,
                        damage_type: det.class,
                        jpeg: det.crop.jpeg.clone(),
                    };
                    match sender.try_send(job) {
                        Ok(()) => {
                            state.last_dispatch_s = Some(now_s);
                            log::debug!(
                                "dispatched enrichment for track {} ({})",
                                det.track_id,
                                det.class
                            );
                        }
                        Err(TrySendError::Full(_)) => {
                            // Backpressure: skip without consuming the
                            // throttle window so the next frame retries.
                            log::debug!(
                                "enrichment queue full, skipping track {}",
                                det.track_id
                            );
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            log::warn!("enrichment workers stopped, skipping dispatch");
                        }
                    }
                }
                None => {
                    log::warn!("enrichment engine shut down, skipping dispatch");
                }
            }
        }

        state.latest_verdict.clone()
    }

    /// Latest completed verdict for a track, if any.
    pub fn latest_verdict(&self, track_id: i64) -> Option<Verdict> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(&track_id).and_then(|s| s.latest_verdict.clone())
    }

    /// Number of tracks with throttle or verdict state.
    pub fn tracked_count(&self) -> usize {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.len()
    }

    /// Stop accepting dispatches and wait for in-flight calls to finish.
    /// In-flight work is bounded by the analysis client's timeout; there is
    /// no cancellation.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("enrichment worker panicked");
            }
        }
    }
}

impl Drop for EnrichmentEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    worker_idx: usize,
    receiver: &Mutex<Receiver<EnrichmentJob>>,
    client: &dyn AnalysisClient,
    states: &SharedStates,
) {
    loop {
        let job = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.recv() {
                Ok(job) => job,
                // Sender dropped: engine shut down, queue drained.
                Err(_) => return,
            }
        };

        let verdict = match client.analyze(job.damage_type, &job.jpeg) {
            Ok(text) => parse_verdict(&text),
            Err(err) => {
                log::warn!(
                    "enrichment failed for track {} on worker {}: {:#}",
                    job.track_id,
                    worker_idx,
                    err
                );
                Verdict::fallback()
            }
        };

        let mut states = states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(job.track_id).or_default();
        state.latest_verdict = Some(verdict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use crate::{BoundingBox, Crop, Severity, StubAnalysisClient};

    fn det(track_id: i64) -> Detection {
        Detection {
            track_id,
            class: DamageClass::Pothole,
            bbox: BoundingBox::new(0, 0, 10, 10),
            confidence: 0.9,
            crop: Crop::new(10, 10, vec![0xff, 0xd8, 0xff]),
        }
    }

    fn counting_client(response: &str) -> (Arc<CountingClient>, Arc<dyn AnalysisClient>) {
        let client = Arc::new(CountingClient {
            response: response.to_string(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        (client.clone(), client)
    }

    struct CountingClient {
        response: String,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl AnalysisClient for CountingClient {
        fn analyze(&self, _damage_type: DamageClass, _jpeg: &[u8]) -> Result<String> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    struct FailingClient;

    impl AnalysisClient for FailingClient {
        fn analyze(&self, _damage_type: DamageClass, _jpeg: &[u8]) -> Result<String> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn first_observation_dispatches_and_returns_none() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let mut engine = EnrichmentEngine::new(EnrichmentConfig::default(), client);

        let verdict = engine.observe(&det(7), 0.0);
        assert!(verdict.is_none());

        engine.shutdown();
        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let latest = engine.latest_verdict(7).unwrap();
        assert_eq!(latest.severity, Severity::Low);
        assert_eq!(latest.recommendation, "Monitor");
    }

    #[test]
    fn throttle_window_blocks_then_reopens() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let config = EnrichmentConfig {
            interval_secs: 5.0,
            // Queue must hold both expected jobs so dispatch never races
            // the worker's dequeue; the throttle is what's under test.
            max_concurrent: 2,
        };
        let mut engine = EnrichmentEngine::new(config, client);

        engine.observe(&det(7), 0.0);
        engine.observe(&det(7), 3.0);
        engine.observe(&det(7), 6.0);

        engine.shutdown();
        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn interval_boundary_is_exclusive() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let config = EnrichmentConfig {
            interval_secs: 5.0,
            max_concurrent: 1,
        };
        let mut engine = EnrichmentEngine::new(config, client);

        engine.observe(&det(7), 0.0);
        // Exactly at the interval: window not yet open.
        engine.observe(&det(7), 5.0);

        engine.shutdown();
        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_interval_dispatches_every_observation() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let config = EnrichmentConfig {
            interval_secs: 0.0,
            // Queue must hold both expected jobs so dispatch never races
            // the worker's dequeue; the zero interval is what's under test.
            max_concurrent: 2,
        };
        let mut engine = EnrichmentEngine::new(config, client);

        engine.observe(&det(7), 0.0);
        engine.observe(&det(7), 0.0);

        engine.shutdown();
        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn tracks_throttle_independently() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let config = EnrichmentConfig {
            interval_secs: 5.0,
            max_concurrent: 2,
        };
        let mut engine = EnrichmentEngine::new(config, client);

        engine.observe(&det(1), 0.0);
        engine.observe(&det(2), 0.0);
        engine.observe(&det(1), 1.0);

        engine.shutdown();
        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(engine.tracked_count(), 2);
    }

    #[test]
    fn empty_crop_never_dispatches() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let mut engine = EnrichmentEngine::new(EnrichmentConfig::default(), client);

        let mut d = det(7);
        d.crop = Crop::default();
        engine.observe(&d, 0.0);

        engine.shutdown();
        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(engine.latest_verdict(7).is_none());
    }

    #[test]
    fn failed_analysis_stores_fallback_verdict() {
        let mut engine =
            EnrichmentEngine::new(EnrichmentConfig::default(), Arc::new(FailingClient));

        engine.observe(&det(7), 0.0);
        engine.shutdown();

        let verdict = engine.latest_verdict(7).unwrap();
        assert_eq!(verdict, Verdict::fallback());
    }

    #[test]
    fn completed_verdict_is_returned_on_next_observation() {
        let mut engine = EnrichmentEngine::new(
            EnrichmentConfig {
                interval_secs: 100.0,
                max_concurrent: 1,
            },
            Arc::new(StubAnalysisClient::new(
                "Severity: high\nRecommendation: Repair immediately.",
            )),
        );

        engine.observe(&det(7), 0.0);
        engine.shutdown();

        // Next frame inside the throttle window still sees the result.
        let verdict = engine.observe(&det(7), 1.0).unwrap();
        assert_eq!(verdict.severity, Severity::High);
        assert_eq!(verdict.recommendation, "Repair immediately.");
    }

    /// Signals call entry, then blocks until the test releases it.
    struct GatedClient {
        calls: std::sync::atomic::AtomicUsize,
        started: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl GatedClient {
        fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (started_tx, started_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let client = Arc::new(Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
                started: started_tx,
                release: Mutex::new(release_rx),
            });
            (client, started_rx, release_tx)
        }
    }

    impl AnalysisClient for GatedClient {
        fn analyze(&self, _damage_type: DamageClass, _jpeg: &[u8]) -> Result<String> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.started.send(()).ok();
            let guard = self.release.lock().map_err(|_| anyhow!("lock poisoned"))?;
            guard.recv().map_err(|_| anyhow!("release channel closed"))?;
            Ok("Severity: low\nRecommendation: Monitor".to_string())
        }
    }

    #[test]
    fn full_queue_skip_does_not_consume_throttle_window() {
        let (client, started, release) = GatedClient::new();
        let config = EnrichmentConfig {
            interval_secs: 5.0,
            max_concurrent: 1,
        };
        let mut engine = EnrichmentEngine::new(config, client.clone());

        // Pin the single worker on track 1's call, then fill the one-slot
        // queue with track 2.
        engine.observe(&det(1), 0.0);
        started.recv().unwrap();
        engine.observe(&det(2), 0.0);

        // Queue is full: track 3's dispatch is skipped.
        engine.observe(&det(3), 0.0);

        // Finish call 1; the worker picks up track 2, draining the queue.
        release.send(()).unwrap();
        started.recv().unwrap();

        // Re-observed well inside what would have been its interval: the
        // skipped dispatch did not consume track 3's throttle window.
        engine.observe(&det(3), 1.0);

        release.send(()).unwrap();
        started.recv().unwrap();
        release.send(()).unwrap();
        engine.shutdown();

        assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(engine.latest_verdict(3).is_some());
    }

    #[test]
    fn observe_survives_poisoned_state_lock() {
        let (counter, client) = counting_client("Severity: low\nRecommendation: Monitor");
        let mut engine = EnrichmentEngine::new(EnrichmentConfig::default(), client);

        let states = engine.states.clone();
        let _ = std::thread::spawn(move || {
            let _guard = states.lock().unwrap();
            panic!("poison the state lock");
        })
        .join();

        assert!(engine.observe(&det(7), 0.0).is_none());
        engine.shutdown();

        assert_eq!(counter.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let verdict = engine.latest_verdict(7).unwrap();
        assert_eq!(verdict.severity, Severity::Low);
    }
}
