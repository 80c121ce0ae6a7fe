//! roadwatch - road damage detection pipeline
//!
//! This crate implements the post-detection pipeline for a road damage
//! monitoring service. An external vision/tracking model produces per-frame
//! detections (bounding box, damage class, confidence, stable track id); this
//! crate takes it from there:
//!
//! 1. **Overlap resolution**: duplicate boxes covering the same physical
//!    damage are collapsed to the highest-confidence instance per cluster.
//! 2. **Track enrichment**: each surviving track is submitted, rate-limited
//!    per track, to an external content-analysis service that grades severity
//!    and suggests a maintenance action. Calls run on a bounded worker pool
//!    and never block the frame path.
//! 3. **Persistence**: one durable record per track id, upserted in place so
//!    repeated observations of the same object converge to a single
//!    up-to-date row.
//!
//! # Module Structure
//!
//! - `overlap`: same-class overlap suppression
//! - `enrich`: per-track throttle state + async dispatch worker pool
//! - `store`: damage record store (SQLite and in-memory)
//! - `source`: detection ingestion (JSONL stream, stub)
//! - `pipeline`: frame path wiring
//! - `config`: daemon configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod enrich;
pub mod overlap;
pub mod pipeline;
pub mod source;
pub mod store;

pub use enrich::client::{parse_verdict, AnalysisClient, HttpAnalysisClient, StubAnalysisClient};
pub use enrich::{EnrichmentConfig, EnrichmentEngine};
pub use overlap::{overlap_ratio_percent, OverlapResolver};
pub use pipeline::{FrameSummary, Pipeline};
pub use source::{DetectionSource, FrameDetections, JsonlSource, StubSource};
pub use store::{DamageRecordStore, InMemoryDamageStore, SqliteDamageStore};

/// Axis-aligned bounding box in pixel coordinates.
///
/// A well-formed box has `x2 > x1` and `y2 > y1`. Degenerate boxes (zero or
/// negative extent) are representable; geometry helpers treat them as having
/// zero area rather than erroring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Pixel area; 0 for degenerate boxes.
    pub fn area(&self) -> i64 {
        let w = i64::from(self.x2) - i64::from(self.x1);
        let h = i64::from(self.y2) - i64::from(self.y1);
        if w <= 0 || h <= 0 {
            return 0;
        }
        w * h
    }

    pub fn is_degenerate(&self) -> bool {
        self.area() == 0
    }
}

/// Recognized damage categories.
///
/// Detections carrying any other class label are dropped before they reach
/// the overlap resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageClass {
    Pothole,
    BrokenEdge,
}

impl DamageClass {
    /// Parse a class label from the upstream model. Case-insensitive.
    /// Returns `None` for labels outside the recognized set.
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "pothole" => Some(Self::Pothole),
            "broken_edge" => Some(Self::BrokenEdge),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pothole => "pothole",
            Self::BrokenEdge => "broken_edge",
        }
    }
}

impl std::fmt::Display for DamageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cropped image region for one detection, already encoded as JPEG.
///
/// Owned by the detection (deep copy of the frame region) so it stays valid
/// after the frame buffer is gone; enrichment needs it across the async
/// boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Crop {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

impl Crop {
    pub fn new(width: u32, height: u32, jpeg: Vec<u8>) -> Self {
        Self {
            width,
            height,
            jpeg,
        }
    }

    /// A crop with zero pixel area is ineligible for enrichment dispatch.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.jpeg.is_empty()
    }
}

/// One detection surviving upstream confidence filtering, for one frame.
#[derive(Clone, Debug)]
pub struct Detection {
    /// Stable identity assigned by the upstream tracker. Unique among
    /// currently-visible objects; may be reused across long gaps.
    pub track_id: i64,
    pub class: DamageClass,
    pub bbox: BoundingBox,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub crop: Crop,
}

/// Severity grade assigned by the content-analysis service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Case-insensitive parse. Returns `None` for anything outside the
    /// three-level scale.
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of content analysis for one track.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub severity: Severity,
    pub recommendation: String,
}

pub const FALLBACK_RECOMMENDATION: &str = "Schedule inspection";

impl Verdict {
    /// Conservative verdict substituted when analysis fails or a response
    /// field cannot be parsed.
    pub fn fallback() -> Self {
        Self {
            severity: Severity::Medium,
            recommendation: FALLBACK_RECOMMENDATION.to_string(),
        }
    }
}

/// Durable record for one track id. Exactly one row per track id ever seen;
/// every later observation of the same track overwrites the row in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DamageRecord {
    pub track_id: i64,
    pub damage_type: DamageClass,
    /// Latest observed confidence.
    pub confidence: f32,
    /// Latest observed bounding box.
    pub location: BoundingBox,
    /// Epoch seconds of the last write.
    pub observed_at: i64,
    /// Latest available verdict; `None` until enrichment first completes
    /// for this track.
    pub verdict: Option<Verdict>,
}

/// Current epoch seconds.
pub fn now_s() -> Result<i64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_secs()
        .try_into()?)
}
