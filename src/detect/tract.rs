#![cfg(feature = "backend-tract")]

use image::imageops::{self, FilterType};
use image::DynamicImage;
use log::debug;
use std::path::Path;
use tract_onnx::prelude::*;

use super::{non_max_suppression, Candidate, Detector};
use crate::db::DynError;

/// Gray value used to pad the letterboxed input
const PAD_VALUE: f32 = 114.0 / 255.0;

/// How the source image was scaled and padded into the model input
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f64,
    pad_x: f64,
    pad_y: f64,
}

impl Letterbox {
    /// Map a model-space box back onto the source image
    fn unmap(&self, bbox: [f64; 4], width: f64, height: f64) -> [f64; 4] {
        [
            ((bbox[0] - self.pad_x) / self.scale).clamp(0.0, width),
            ((bbox[1] - self.pad_y) / self.scale).clamp(0.0, height),
            ((bbox[2] - self.pad_x) / self.scale).clamp(0.0, width),
            ((bbox[3] - self.pad_y) / self.scale).clamp(0.0, height),
        ]
    }
}

/// YOLOv8-style ONNX detector executed with tract
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + C, N]` (or
/// transposed `[1, N, 4 + C]`) output of center-format boxes followed by one
/// score per class.
pub struct TractYolo {
    model: RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>,
    labels: Vec<String>,
    input_size: u32,
    iou_threshold: f64,
}

impl TractYolo {
    pub fn load(
        model_path: &Path,
        labels: Vec<String>,
        input_size: u32,
        iou_threshold: f64,
    ) -> Result<Self, DynError> {
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| format!("failed to load ONNX model from {}: {}", model_path.display(), e))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )?
            .into_optimized()?
            .into_runnable()?;

        debug!(
            "Loaded {} ({} classes, input {}x{})",
            model_path.display(),
            labels.len(),
            input_size,
            input_size
        );

        Ok(Self {
            model,
            labels,
            input_size,
            iou_threshold,
        })
    }

    fn build_input(&self, image: &DynamicImage) -> (Tensor, Letterbox) {
        let side = self.input_size;
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let scale = (side as f64 / width as f64).min(side as f64 / height as f64);
        let new_w = ((width as f64 * scale).round() as u32).clamp(1, side);
        let new_h = ((height as f64 * scale).round() as u32).clamp(1, side);
        let pad_x = (side - new_w) / 2;
        let pad_y = (side - new_h) / 2;

        let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

        let side = side as usize;
        let mut input = tract_ndarray::Array4::<f32>::from_elem((1, 3, side, side), PAD_VALUE);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let px = (x + pad_x) as usize;
            let py = (y + pad_y) as usize;
            for channel in 0..3 {
                input[(0, channel, py, px)] = pixel[channel] as f32 / 255.0;
            }
        }

        (
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f64,
                pad_y: pad_y as f64,
            },
        )
    }

    fn decode(
        &self,
        output: &Tensor,
        letterbox: Letterbox,
        width: f64,
        height: f64,
        min_confidence: f64,
    ) -> Result<Vec<Candidate>, DynError> {
        let view = output
            .to_array_view::<f32>()?
            .into_dimensionality::<tract_ndarray::Ix3>()?;
        let features = 4 + self.labels.len();

        let shape = view.shape();
        let (anchors, channels_first) = if shape[1] == features {
            (shape[2], true)
        } else if shape[2] == features {
            (shape[1], false)
        } else {
            return Err(format!(
                "unexpected output shape {:?} for {} labels",
                shape,
                self.labels.len()
            )
            .into());
        };

        let value = |anchor: usize, feature: usize| -> f64 {
            if channels_first {
                view[[0, feature, anchor]] as f64
            } else {
                view[[0, anchor, feature]] as f64
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, confidence) = (0..self.labels.len())
                .map(|class| (class, value(anchor, 4 + class)))
                .fold((0, f64::NEG_INFINITY), |best, current| {
                    if current.1 > best.1 {
                        current
                    } else {
                        best
                    }
                });

            if confidence < min_confidence {
                continue;
            }

            let cx = value(anchor, 0);
            let cy = value(anchor, 1);
            let w = value(anchor, 2);
            let h = value(anchor, 3);
            let bbox = letterbox.unmap(
                [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                width,
                height,
            );

            candidates.push(Candidate {
                label: self.labels[class_id].clone(),
                confidence,
                bbox,
            });
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

impl Detector for TractYolo {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, image: &DynamicImage, min_confidence: f64) -> Result<Vec<Candidate>, DynError> {
        let (input, letterbox) = self.build_input(image);
        let outputs = self.model.run(tvec!(input.into()))?;
        let output = outputs.first().ok_or("model produced no outputs")?;

        self.decode(
            output,
            letterbox,
            image.width() as f64,
            image.height() as f64,
            min_confidence,
        )
    }
}
