//! Detection records as stored and served
//!
//! A [`DetectionRecord`] is one image capture. Its detections are kept sorted
//! by descending confidence and are never empty: a capture with nothing above
//! threshold carries exactly one sentinel [`Detection`].

use serde::{Deserialize, Serialize};

use crate::constants::SENTINEL_LABEL;

/// One recognized object, or the "nothing recognized" sentinel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in [0, 1]
    pub score: f64,
    /// `[x1, y1, x2, y2]` in source-image pixels; serialized as `[]` when absent
    #[serde(rename = "box", with = "bbox_format", default)]
    pub bbox: Option<[f64; 4]>,
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f64, bbox: Option<[f64; 4]>) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }

    /// The placeholder entry for a capture with no accepted detections
    pub fn sentinel() -> Self {
        Self::new(SENTINEL_LABEL, 0.0, None)
    }

    pub fn is_sentinel(&self) -> bool {
        self.bbox.is_none() && self.label == SENTINEL_LABEL
    }
}

/// One image capture and its detections
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub id: String,
    pub device_id: String,
    /// Capture time, unix seconds
    pub captured_at: i64,
    /// Stored source image filename, relative to the upload directory
    pub file: String,
    pub detections: Vec<Detection>,
}

impl DetectionRecord {
    /// Number of real detections, sentinel excluded
    pub fn detection_count(&self) -> usize {
        self.detections.iter().filter(|d| !d.is_sentinel()).count()
    }
}

/// Sort by descending confidence; equal scores keep their relative order
pub fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Sort and replace an empty list with the single sentinel entry
pub fn normalize_detections(mut detections: Vec<Detection>) -> Vec<Detection> {
    if detections.is_empty() {
        return vec![Detection::sentinel()];
    }
    sort_by_confidence(&mut detections);
    detections
}

/// `Option<[f64; 4]>` <-> `[x1, y1, x2, y2]` or `[]`
mod bbox_format {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bbox: &Option<[f64; 4]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bbox {
            Some(coords) => serializer.collect_seq(coords.iter()),
            None => serializer.collect_seq(std::iter::empty::<f64>()),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[f64; 4]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let coords = Option::<Vec<f64>>::deserialize(deserializer)?.unwrap_or_default();
        match coords.as_slice() {
            [] => Ok(None),
            [x1, y1, x2, y2] => Ok(Some([*x1, *y1, *x2, *y2])),
            other => Err(D::Error::custom(format!(
                "box must have 0 or 4 coordinates, got {}",
                other.len()
            ))),
        }
    }
}
