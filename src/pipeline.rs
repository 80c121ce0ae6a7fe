//! Frame path wiring.
//!
//! One pipeline instance processes one stream, strictly sequentially: a
//! frame is fully deduplicated, throttle-checked, and persisted before the
//! next frame starts. Only enrichment runs concurrently, on the engine's
//! worker pool.

use anyhow::Result;

use crate::enrich::EnrichmentEngine;
use crate::overlap::OverlapResolver;
use crate::store::DamageRecordStore;
use crate::{now_s, DamageRecord, FrameDetections};

/// Counters for one processed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub frame_index: u64,
    /// Detections received from the source.
    pub received: usize,
    /// Detections surviving confidence filtering and overlap resolution.
    pub kept: usize,
    /// Detections discarded as same-class duplicates.
    pub suppressed: usize,
    /// Records written to the store.
    pub persisted: usize,
    /// Upsert failures (logged, frame continues).
    pub store_errors: usize,
}

pub struct Pipeline {
    confidence_threshold: f32,
    resolver: OverlapResolver,
    engine: EnrichmentEngine,
    store: Box<dyn DamageRecordStore>,
}

impl Pipeline {
    pub fn new(
        confidence_threshold: f32,
        resolver: OverlapResolver,
        engine: EnrichmentEngine,
        store: Box<dyn DamageRecordStore>,
    ) -> Self {
        Self {
            confidence_threshold,
            resolver,
            engine,
            store,
        }
    }

    /// Process one frame's detections end to end.
    ///
    /// Enrichment failures and store write failures degrade the frame
    /// (fallback verdicts, skipped rows) but never abort it; subsequent
    /// frames proceed normally.
    pub fn process_frame(&mut self, frame: FrameDetections) -> Result<FrameSummary> {
        let now = now_s()? as f64;
        self.process_frame_at(frame, now)
    }

    /// `process_frame` with an explicit clock, for deterministic tests.
    pub fn process_frame_at(&mut self, frame: FrameDetections, now_s: f64) -> Result<FrameSummary> {
        let mut summary = FrameSummary {
            frame_index: frame.frame_index,
            received: frame.detections.len(),
            ..FrameSummary::default()
        };

        let confident: Vec<_> = frame
            .detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .collect();
        let filtered = summary.received - confident.len();

        let kept = self.resolver.resolve(confident);
        summary.kept = kept.len();
        summary.suppressed = summary.received - filtered - summary.kept;

        for det in kept {
            let verdict = self.engine.observe(&det, now_s);
            let record = DamageRecord {
                track_id: det.track_id,
                damage_type: det.class,
                confidence: det.confidence,
                location: det.bbox,
                observed_at: now_s as i64,
                verdict,
            };
            match self.store.upsert(&record) {
                Ok(()) => summary.persisted += 1,
                Err(err) => {
                    summary.store_errors += 1;
                    log::error!(
                        "failed to persist track {} from frame {}: {:#}",
                        det.track_id,
                        summary.frame_index,
                        err
                    );
                }
            }
        }

        log::debug!(
            "frame {}: {} received, {} kept, {} suppressed",
            summary.frame_index,
            summary.received,
            summary.kept,
            summary.suppressed
        );
        Ok(summary)
    }

    pub fn store(&self) -> &dyn DamageRecordStore {
        self.store.as_ref()
    }

    /// Stop the enrichment pool, waiting for in-flight calls.
    pub fn shutdown(&mut self) {
        self.engine.shutdown();
    }
}
