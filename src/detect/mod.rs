//! Object detection
//!
//! A [`Detector`] backend turns an image into scored candidates. The
//! [`DetectionAdapter`] sits between backends and the rest of the service: it
//! asks the backend for everything above the loose threshold, keeps what clears
//! the strict threshold, orders the result and substitutes the sentinel entry
//! when nothing is left.

use image::DynamicImage;
use log::{debug, info};
use std::sync::Arc;

use crate::config::{DetectorBackendKind, DetectorConfig};
use crate::db::DynError;
use crate::record::{normalize_detections, Detection};

pub mod fixed;
#[cfg(feature = "backend-tract")]
pub mod tract;

pub use fixed::FixedDetector;
#[cfg(feature = "backend-tract")]
pub use tract::TractYolo;

/// A scored box produced by a backend, in source-image pixels
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub label: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
}

/// Detector backend
///
/// Backends are loaded once and shared across requests; `detect` takes `&self`
/// and must not keep per-call state.
pub trait Detector: Send + Sync {
    /// Backend identifier
    fn name(&self) -> &'static str;

    /// Candidates whose confidence is at least `min_confidence`
    fn detect(&self, image: &DynamicImage, min_confidence: f64) -> Result<Vec<Candidate>, DynError>;
}

/// Two-stage confidence policy
///
/// `loose` is handed to the backend as its candidate cutoff; `strict` decides
/// what is accepted. Candidates in between are reported as soft rejects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub loose: f64,
    pub strict: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            loose: 0.5,
            strict: 0.6,
        }
    }
}

/// Wraps a backend with the threshold policy and sentinel rule
#[derive(Clone)]
pub struct DetectionAdapter {
    detector: Arc<dyn Detector>,
    policy: ThresholdPolicy,
}

impl DetectionAdapter {
    pub fn new(detector: Arc<dyn Detector>, policy: ThresholdPolicy) -> Self {
        Self { detector, policy }
    }

    pub fn backend_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Accepted detections, highest confidence first
    ///
    /// Never empty: when no candidate clears the strict threshold the result is
    /// the single sentinel entry.
    pub fn run(&self, image: &DynamicImage) -> Result<Vec<Detection>, DynError> {
        let candidates = self.detector.detect(image, self.policy.loose)?;
        Ok(self.accept(candidates))
    }

    fn accept(&self, candidates: Vec<Candidate>) -> Vec<Detection> {
        let mut accepted = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if candidate.confidence >= self.policy.strict {
                info!(
                    "Detected: {} (confidence: {:.2})",
                    candidate.label, candidate.confidence
                );
                accepted.push(Detection::new(
                    candidate.label,
                    candidate.confidence,
                    Some(candidate.bbox),
                ));
            } else if candidate.confidence >= self.policy.loose {
                debug!(
                    "Soft reject: {} (confidence: {:.2}, strict threshold {:.2})",
                    candidate.label, candidate.confidence, self.policy.strict
                );
            }
        }

        if accepted.is_empty() {
            info!("No objects detected");
        }

        normalize_detections(accepted)
    }
}

/// Build the configured backend
pub fn build_detector(config: &DetectorConfig) -> Result<Arc<dyn Detector>, DynError> {
    match config.backend {
        DetectorBackendKind::Fixed => Ok(Arc::new(FixedDetector::from_config(&config.fixed))),
        DetectorBackendKind::Tract => build_tract(config),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(config: &DetectorConfig) -> Result<Arc<dyn Detector>, DynError> {
    let model_path = config
        .model_path
        .as_ref()
        .ok_or("detector.model_path is required for the tract backend")?;
    let detector = TractYolo::load(
        model_path,
        config.labels.clone(),
        config.input_size,
        config.iou_threshold as f64,
    )?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_config: &DetectorConfig) -> Result<Arc<dyn Detector>, DynError> {
    Err("detector.backend = \"tract\" requires building with the `backend-tract` feature".into())
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes
pub fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Class-aware non-maximum suppression
///
/// Keeps the highest-confidence box of every cluster of same-label boxes
/// overlapping by more than `iou_threshold`. Output is sorted by descending
/// confidence.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len().min(100));
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.label == candidate.label && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
