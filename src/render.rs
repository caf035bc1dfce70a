//! Annotated image rendering
//!
//! Draws one colored rectangle per detection onto a copy of the source image
//! and encodes the result as JPEG.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageResult, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::config::RenderConfig;
use crate::record::Detection;

const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const GRAY: Rgb<u8> = Rgb([128, 128, 128]);

/// Box color for a label
///
/// Matched case-insensitively. "unfertile" contains "fertile", so it is
/// checked first.
pub fn label_color(label: &str) -> Rgb<u8> {
    let label = label.to_lowercase();
    if label.contains("unfertil") {
        ORANGE
    } else if label.contains("fertile") {
        GREEN
    } else {
        GRAY
    }
}

/// Wrap JPEG bytes in a `data:` URI
pub fn to_data_uri(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg))
}

#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    box_thickness: u32,
    jpeg_quality: u8,
}

impl Renderer {
    pub fn new(box_thickness: u32, jpeg_quality: u8) -> Self {
        Self {
            box_thickness: box_thickness.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.box_thickness, config.jpeg_quality)
    }

    /// JPEG of `image` with a rectangle drawn for each boxed detection
    ///
    /// Sentinel entries and detections without a box draw nothing. The source
    /// image is not modified.
    pub fn render(&self, image: &DynamicImage, detections: &[Detection]) -> ImageResult<Vec<u8>> {
        let mut canvas = image.to_rgb8();

        for detection in detections {
            if detection.is_sentinel() {
                continue;
            }
            if let Some(bbox) = detection.bbox {
                self.draw_box(&mut canvas, bbox, label_color(&detection.label));
            }
        }

        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality);
        encoder.encode_image(&canvas)?;
        Ok(jpeg)
    }

    /// Stroke centered on the box edge, `box_thickness` pixels wide
    ///
    /// Coordinates are clamped to the canvas first, so stored boxes with
    /// out-of-range or non-finite values draw along the border instead.
    fn draw_box(&self, canvas: &mut image::RgbImage, bbox: [f64; 4], color: Rgb<u8>) {
        let (width, height) = canvas.dimensions();
        let clamp = |v: f64, max: u32| -> i32 {
            if v.is_nan() {
                0
            } else {
                v.clamp(0.0, max as f64) as i32
            }
        };
        let x1 = clamp(bbox[0], width);
        let y1 = clamp(bbox[1], height);
        let x2 = clamp(bbox[2], width);
        let y2 = clamp(bbox[3], height);
        let half = (self.box_thickness / 2) as i32;

        for step in 0..self.box_thickness as i32 {
            let inset = step - half;
            let width = (x2 - x1) - 2 * inset;
            let height = (y2 - y1) - 2 * inset;
            if width <= 0 || height <= 0 {
                continue;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(jpeg: &[u8]) -> image::RgbImage {
        image::load_from_memory(jpeg).unwrap().to_rgb8()
    }

    #[test]
    fn test_label_colors() {
        assert_eq!(label_color("fertile"), GREEN);
        assert_eq!(label_color("Fertile egg"), GREEN);
        assert_eq!(label_color("unfertile"), ORANGE);
        assert_eq!(label_color("UNFERTILIZED"), ORANGE);
        assert_eq!(label_color("crack"), GRAY);
    }

    #[test]
    fn test_render_draws_box_in_label_color() {
        let renderer = Renderer::new(8, 95);
        let image = DynamicImage::new_rgb8(100, 100);
        let detections = vec![Detection::new("fertile", 0.91, Some([10.0, 10.0, 50.0, 50.0]))];

        let output = decode(&renderer.render(&image, &detections).unwrap());
        assert_eq!(output.dimensions(), (100, 100));

        let edge = output.get_pixel(10, 30);
        assert!(edge[1] > 150, "expected green edge, got {:?}", edge);
        assert!(edge[0] < 100 && edge[2] < 100, "expected green edge, got {:?}", edge);

        let inside = output.get_pixel(30, 30);
        assert!(inside[0] < 40 && inside[1] < 40 && inside[2] < 40);
    }

    #[test]
    fn test_sentinel_draws_nothing() {
        let renderer = Renderer::new(8, 95);
        let image = DynamicImage::new_rgb8(40, 30);

        let output = decode(&renderer.render(&image, &[Detection::sentinel()]).unwrap());
        assert_eq!(output.dimensions(), (40, 30));
        assert!(output.pixels().all(|p| p[0] < 30 && p[1] < 30 && p[2] < 30));
    }

    #[test]
    fn test_box_outside_image_is_clipped() {
        let renderer = Renderer::new(4, 90);
        let image = DynamicImage::new_rgb8(20, 20);
        let detections = vec![Detection::new("unfertile", 0.7, Some([-10.0, -10.0, 500.0, 500.0]))];
        assert!(renderer.render(&image, &detections).is_ok());
    }

    #[test]
    fn test_extreme_coordinates_are_clamped() {
        let renderer = Renderer::new(8, 90);
        let image = DynamicImage::new_rgb8(20, 20);
        let detections = vec![
            Detection::new("fertile", 0.9, Some([-f64::MAX, -1e300, f64::MAX, f64::INFINITY])),
            Detection::new("unfertile", 0.8, Some([f64::NAN, 2.0, 3e12, f64::NAN])),
        ];

        let output = decode(&renderer.render(&image, &detections).unwrap());
        assert_eq!(output.dimensions(), (20, 20));

        // The first box spans the whole canvas, so its stroke runs along the border
        let corner = output.get_pixel(1, 10);
        assert!(corner[1] > 100, "expected stroke on the border, got {:?}", corner);
    }

    #[test]
    fn test_data_uri_prefix() {
        let uri = to_data_uri(&[0xff, 0xd8, 0xff]);
        assert_eq!(uri, "data:image/jpeg;base64,/9j/");
    }
}
