use image::DynamicImage;

use super::{Candidate, Detector};
use crate::config::FixedDetectionConfig;
use crate::db::DynError;

/// Backend that reports the same candidates for every image
///
/// Boxes are clipped to the image they are reported for.
pub struct FixedDetector {
    candidates: Vec<Candidate>,
}

impl FixedDetector {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn from_config(entries: &[FixedDetectionConfig]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|entry| Candidate {
                    label: entry.label.clone(),
                    confidence: entry.score,
                    bbox: entry.bbox,
                })
                .collect(),
        )
    }
}

impl Detector for FixedDetector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(&self, image: &DynamicImage, min_confidence: f64) -> Result<Vec<Candidate>, DynError> {
        let width = image.width() as f64;
        let height = image.height() as f64;

        Ok(self
            .candidates
            .iter()
            .filter(|c| c.confidence >= min_confidence)
            .map(|c| {
                let [x1, y1, x2, y2] = c.bbox;
                Candidate {
                    label: c.label.clone(),
                    confidence: c.confidence,
                    bbox: [
                        x1.clamp(0.0, width),
                        y1.clamp(0.0, height),
                        x2.clamp(0.0, width),
                        y2.clamp(0.0, height),
                    ],
                }
            })
            .collect())
    }
}
