//! Same-class overlap suppression.
//!
//! The upstream model frequently emits several boxes for one physical damage
//! patch (partial occlusion, track churn at low confidence). This module
//! collapses each cluster of same-class overlapping boxes to its
//! highest-confidence member.
//!
//! The overlap measure is intersection area over the *smaller* of the two
//! box areas, not standard IoU. A small box fully inside a larger same-class
//! box therefore scores 100% and is always suppressed, which is the behavior
//! we want for nested duplicate detections.

use crate::{BoundingBox, Detection};

/// Overlap between two boxes as a percentage of the smaller box's area.
///
/// Returns 0.0 when the intersection has no positive area or when either box
/// is degenerate, so degenerate geometry can never suppress anything and
/// never divides by zero.
pub fn overlap_ratio_percent(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (i64::from(x2) - i64::from(x1)) * (i64::from(y2) - i64::from(y1));
    let smaller = a.area().min(b.area());
    if smaller <= 0 {
        return 0.0;
    }

    (intersection as f32 / smaller as f32) * 100.0
}

/// Collapses duplicate same-class detections within one frame.
#[derive(Clone, Copy, Debug)]
pub struct OverlapResolver {
    /// Overlap percentage above which the lower-confidence same-class
    /// detection is discarded.
    threshold_percent: f32,
}

impl OverlapResolver {
    pub fn new(threshold_percent: f32) -> Self {
        Self { threshold_percent }
    }

    /// Returns the subset of `detections` that survive suppression, ordered
    /// by confidence descending (ties keep original input order).
    ///
    /// Greedy over the confidence-sorted list: a candidate is discarded iff
    /// it overlaps an already-kept detection of the same class by strictly
    /// more than the threshold. Different classes never suppress each other,
    /// even with coincident boxes.
    pub fn resolve(&self, detections: Vec<Detection>) -> Vec<Detection> {
        if detections.len() <= 1 {
            return detections;
        }

        let mut order: Vec<usize> = (0..detections.len()).collect();
        // Stable sort keeps input order for equal confidences.
        order.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .partial_cmp(&detections[a].confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
        for idx in order {
            let candidate = &detections[idx];
            let suppressed = kept.iter().any(|k| {
                k.class == candidate.class
                    && overlap_ratio_percent(&candidate.bbox, &k.bbox) > self.threshold_percent
            });
            if suppressed {
                log::debug!(
                    "suppressed track {} ({}, conf {:.2}) as duplicate",
                    candidate.track_id,
                    candidate.class,
                    candidate.confidence
                );
            } else {
                kept.push(candidate.clone());
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Crop, DamageClass};

    fn det(track_id: i64, class: DamageClass, bbox: BoundingBox, confidence: f32) -> Detection {
        Detection {
            track_id,
            class,
            bbox,
            confidence,
            crop: Crop::new(4, 4, vec![0xff, 0xd8]),
        }
    }

    #[test]
    fn ratio_of_nested_box_is_full_overlap() {
        let outer = BoundingBox::new(0, 0, 10, 10);
        let inner = BoundingBox::new(1, 1, 9, 9);
        assert_eq!(overlap_ratio_percent(&outer, &inner), 100.0);
        assert_eq!(overlap_ratio_percent(&inner, &outer), 100.0);
    }

    #[test]
    fn ratio_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(20, 20, 30, 30);
        assert_eq!(overlap_ratio_percent(&a, &b), 0.0);
    }

    #[test]
    fn ratio_of_edge_touching_boxes_is_zero() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(10, 0, 20, 10);
        assert_eq!(overlap_ratio_percent(&a, &b), 0.0);
    }

    #[test]
    fn degenerate_box_never_overlaps() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let zero_w = BoundingBox::new(5, 0, 5, 10);
        let inverted = BoundingBox::new(8, 8, 2, 2);
        assert_eq!(overlap_ratio_percent(&a, &zero_w), 0.0);
        assert_eq!(overlap_ratio_percent(&zero_w, &a), 0.0);
        assert_eq!(overlap_ratio_percent(&a, &inverted), 0.0);
    }

    #[test]
    fn partial_overlap_ratio() {
        // 10x10 boxes offset by 5 in x: intersection 5x10 = 50, smaller 100.
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 15, 10);
        let ratio = overlap_ratio_percent(&a, &b);
        assert!((ratio - 50.0).abs() < 1e-4);
    }

    #[test]
    fn nested_same_class_keeps_higher_confidence() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(1, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.9),
            det(2, DamageClass::Pothole, BoundingBox::new(1, 1, 9, 9), 0.6),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].track_id, 1);
    }

    #[test]
    fn higher_confidence_wins_regardless_of_input_order() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(2, DamageClass::Pothole, BoundingBox::new(1, 1, 9, 9), 0.6),
            det(1, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.9),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].track_id, 1);
    }

    #[test]
    fn different_classes_never_suppress() {
        let resolver = OverlapResolver::new(50.0);
        let bbox = BoundingBox::new(0, 0, 10, 10);
        let input = vec![
            det(1, DamageClass::Pothole, bbox, 0.9),
            det(2, DamageClass::BrokenEdge, bbox, 0.3),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn overlap_at_exactly_threshold_is_not_suppressed() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(1, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.9),
            det(2, DamageClass::Pothole, BoundingBox::new(5, 0, 15, 10), 0.8),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn ties_keep_original_order() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(5, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.7),
            det(6, DamageClass::Pothole, BoundingBox::new(2, 2, 8, 8), 0.7),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].track_id, 5);
    }

    #[test]
    fn output_is_confidence_descending() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(1, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.4),
            det(2, DamageClass::Pothole, BoundingBox::new(50, 50, 60, 60), 0.9),
            det(3, DamageClass::BrokenEdge, BoundingBox::new(90, 0, 99, 9), 0.6),
        ];
        let kept = resolver.resolve(input);
        let confs: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.6, 0.4]);
    }

    #[test]
    fn degenerate_candidate_survives_and_suppresses_nothing() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(1, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.9),
            det(2, DamageClass::Pothole, BoundingBox::new(5, 5, 5, 5), 0.8),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn chain_of_overlaps_collapses_to_strongest() {
        let resolver = OverlapResolver::new(50.0);
        let input = vec![
            det(1, DamageClass::Pothole, BoundingBox::new(0, 0, 10, 10), 0.5),
            det(2, DamageClass::Pothole, BoundingBox::new(1, 1, 9, 9), 0.7),
            det(3, DamageClass::Pothole, BoundingBox::new(2, 2, 8, 8), 0.9),
        ];
        let kept = resolver.resolve(input);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].track_id, 3);
    }
}
