use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackendKind {
    /// Returns the detections listed under `[[detector.fixed]]` for every image
    ///
    /// Useful for dry runs and wiring tests without a model file
    Fixed,
    /// ONNX YOLO model executed with tract (requires the `backend-tract` feature)
    Tract,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_database() -> PathBuf {
    PathBuf::from("results.db")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_camera_prefix() -> String {
    "esp32".to_string()
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_input_size() -> u32 {
    640
}

fn default_loose_threshold() -> f64 {
    0.5
}

fn default_strict_threshold() -> f64 {
    0.6
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_box_thickness() -> u32 {
    8
}

fn default_jpeg_quality() -> u8 {
    90
}

/// Server configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Directory where uploaded source images are stored (default: uploads)
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// SQLite database file (default: results.db)
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on (default: 9090)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL used when building `image_url` (default: derived from the Host header)
    pub public_base_url: Option<String>,
    /// Device id prefix that marks a record as coming from a camera (default: esp32)
    #[serde(default = "default_camera_prefix")]
    pub camera_prefix: String,
    /// Maximum accepted request body in bytes (default: 20 MiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Detector settings (maps to [detector] section in TOML)
    pub detector: DetectorConfig,
    /// Annotation settings (maps to [render] section in TOML)
    #[serde(default)]
    pub render: RenderConfig,
}

/// Detector configuration (maps to [detector] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Which backend runs inference
    pub backend: DetectorBackendKind,
    /// Path to the ONNX model (required for the tract backend)
    pub model_path: Option<PathBuf>,
    /// Class names indexed by class id
    #[serde(default)]
    pub labels: Vec<String>,
    /// Square model input size in pixels (default: 640)
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Candidate cutoff handed to the backend (default: 0.5)
    #[serde(default = "default_loose_threshold")]
    pub loose_threshold: f64,
    /// Acceptance cutoff applied to the backend output (default: 0.6)
    #[serde(default = "default_strict_threshold")]
    pub strict_threshold: f64,
    /// IoU above which overlapping boxes are suppressed (default: 0.45)
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Detections returned by the fixed backend
    #[serde(default)]
    pub fixed: Vec<FixedDetectionConfig>,
}

/// One entry of `[[detector.fixed]]`
#[derive(Debug, Clone, Deserialize)]
pub struct FixedDetectionConfig {
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: [f64; 4],
}

/// Annotation configuration (maps to [render] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Rectangle stroke width in pixels (default: 8)
    #[serde(default = "default_box_thickness")]
    pub box_thickness: u32,
    /// JPEG quality of the annotated image, 1-100 (default: 90)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            box_thickness: default_box_thickness(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl ServerConfig {
    /// Read and validate a TOML config file
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges and cross-field requirements
    pub fn validate(&self) -> Result<(), String> {
        let detector = &self.detector;

        for (name, value) in [
            ("loose_threshold", detector.loose_threshold),
            ("strict_threshold", detector.strict_threshold),
            ("iou_threshold", detector.iou_threshold as f64),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("detector.{} must be within [0, 1], got {}", name, value));
            }
        }

        if detector.loose_threshold > detector.strict_threshold {
            return Err(format!(
                "detector.loose_threshold ({}) must not exceed detector.strict_threshold ({})",
                detector.loose_threshold, detector.strict_threshold
            ));
        }

        if detector.backend == DetectorBackendKind::Tract {
            if detector.model_path.is_none() {
                return Err("detector.backend = \"tract\" requires detector.model_path".to_string());
            }
            if detector.labels.is_empty() {
                return Err("detector.backend = \"tract\" requires detector.labels".to_string());
            }
            if detector.input_size == 0 {
                return Err("detector.input_size must be greater than 0".to_string());
            }
        }

        if self.render.box_thickness == 0 {
            return Err("render.box_thickness must be at least 1".to_string());
        }

        if !(1..=100).contains(&self.render.jpeg_quality) {
            return Err(format!(
                "render.jpeg_quality must be within 1-100, got {}",
                self.render.jpeg_quality
            ));
        }

        Ok(())
    }

    /// Human-readable model identifier reported by `/health`
    pub fn model_name(&self) -> String {
        match (&self.detector.backend, &self.detector.model_path) {
            (DetectorBackendKind::Tract, Some(path)) => path.display().to_string(),
            (DetectorBackendKind::Tract, None) => "tract".to_string(),
            (DetectorBackendKind::Fixed, _) => "fixed".to_string(),
        }
    }
}
