//! Detection ingestion.
//!
//! The vision/tracking model runs out of process; this module is the seam it
//! feeds. Each frame arrives as a batch of already-tracked detections with
//! crops encoded as JPEG. Two sources are provided:
//!
//! - `JsonlSource`: one JSON object per line, for piping model output from a
//!   file or FIFO. Crop bytes are hex-encoded.
//! - `StubSource`: scripted frames for demos and tests.
//!
//! Class labels outside the recognized set are dropped at decode with a
//! debug log; they never reach the overlap resolver.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{BoundingBox, Crop, DamageClass, Detection};

/// All detections for one processed frame.
#[derive(Clone, Debug, Default)]
pub struct FrameDetections {
    pub frame_index: u64,
    pub detections: Vec<Detection>,
}

pub trait DetectionSource {
    /// Next frame's detections, or `None` when the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<FrameDetections>>;
}

#[derive(Debug, Deserialize)]
struct FrameLine {
    frame: u64,
    detections: Vec<DetectionLine>,
}

#[derive(Debug, Deserialize)]
struct DetectionLine {
    track_id: i64,
    class: String,
    #[serde(rename = "box")]
    bbox: [i32; 4],
    confidence: f32,
    #[serde(default)]
    crop: Option<CropLine>,
}

#[derive(Debug, Deserialize)]
struct CropLine {
    width: u32,
    height: u32,
    jpeg_hex: String,
}

/// Reads frames as JSON lines from a file or FIFO.
pub struct JsonlSource {
    reader: BufReader<File>,
    line_no: u64,
}

impl JsonlSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open detection stream {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            line_no: 0,
        })
    }
}

impl DetectionSource for JsonlSource {
    fn next_frame(&mut self) -> Result<Option<FrameDetections>> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .context("read detection stream")?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match decode_frame_line(&line) {
                Ok(frame) => return Ok(Some(frame)),
                // A bad line degrades that frame only; the stream continues.
                Err(err) => {
                    log::warn!(
                        "skipping malformed detection stream line {}: {:#}",
                        self.line_no,
                        err
                    );
                }
            }
        }
    }
}

fn decode_frame_line(line: &str) -> Result<FrameDetections> {
    let parsed: FrameLine = serde_json::from_str(line).context("parse frame json")?;

    let mut detections = Vec::with_capacity(parsed.detections.len());
    for det in parsed.detections {
        let Some(class) = DamageClass::parse(&det.class) else {
            log::debug!(
                "dropping track {} with unrecognized class '{}'",
                det.track_id,
                det.class
            );
            continue;
        };
        let crop = match det.crop {
            Some(crop) => {
                let jpeg = hex::decode(&crop.jpeg_hex).context("decode crop hex")?;
                Crop::new(crop.width, crop.height, jpeg)
            }
            None => Crop::default(),
        };
        let [x1, y1, x2, y2] = det.bbox;
        detections.push(Detection {
            track_id: det.track_id,
            class,
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence: det.confidence,
            crop,
        });
    }

    Ok(FrameDetections {
        frame_index: parsed.frame,
        detections,
    })
}

/// Scripted source for demos and tests.
#[derive(Debug, Default)]
pub struct StubSource {
    frames: std::collections::VecDeque<FrameDetections>,
}

impl StubSource {
    pub fn new(frames: Vec<FrameDetections>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl DetectionSource for StubSource {
    fn next_frame(&mut self) -> Result<Option<FrameDetections>> {
        Ok(self.frames.pop_front())
    }
}
