//! Per-camera image adjustments applied before inference and streaming

use crate::camera_state::CameraRecord;
use crate::frame_source::Frame;
use image::{imageops, RgbImage};

/// Brightness/contrast/focus multipliers (1.0 = unchanged)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustments {
    pub brightness: f64,
    pub contrast: f64,
    pub focus: f64,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            contrast: 1.0,
            focus: 1.0,
        }
    }
}

impl From<&CameraRecord> for Adjustments {
    fn from(record: &CameraRecord) -> Self {
        Self {
            brightness: record.brightness,
            contrast: record.contrast,
            focus: record.focus,
        }
    }
}

impl Adjustments {
    fn scales_pixels(&self) -> bool {
        self.brightness != 1.0 || self.contrast != 1.0
    }

    fn sharpens(&self) -> bool {
        self.focus > 0.0 && self.focus != 1.0
    }
}

/// Apply adjustments, sharing the input buffer when nothing changes.
///
/// `p' = saturate(|p * contrast + (brightness - 1) * 255|)`, then for
/// focus != 1 an unsharp mask `p' * (1 + focus) - blur(p', sigma = focus) * focus`.
pub fn apply(frame: &Frame, adj: &Adjustments) -> Frame {
    if !adj.scales_pixels() && !adj.sharpens() {
        return frame.clone();
    }

    let mut image = if adj.scales_pixels() {
        scale_abs(&frame.image, adj.contrast, ((adj.brightness - 1.0) * 255.0).trunc())
    } else {
        frame.image.as_ref().clone()
    };

    if adj.sharpens() {
        image = unsharp(&image, adj.focus);
    }

    Frame {
        image: std::sync::Arc::new(image),
        captured_at: frame.captured_at,
    }
}

fn saturate(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn scale_abs(src: &RgbImage, alpha: f64, beta: f64) -> RgbImage {
    let mut out = src.clone();
    for p in out.iter_mut() {
        *p = saturate((*p as f64 * alpha + beta).abs());
    }
    out
}

fn unsharp(src: &RgbImage, focus: f64) -> RgbImage {
    let blurred = imageops::blur(src, focus as f32);
    let mut out = src.clone();
    for (p, b) in out.iter_mut().zip(blurred.iter()) {
        *p = saturate(*p as f64 * (1.0 + focus) - *b as f64 * focus);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::Arc;

    fn flat(value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(12, 12, Rgb([value, value, value])))
    }

    #[test]
    fn test_identity_shares_buffer() {
        let frame = flat(80);
        let out = apply(&frame, &Adjustments::default());
        assert!(Arc::ptr_eq(&frame.image, &out.image));
    }

    #[test]
    fn test_brightness_offset() {
        let out = apply(
            &flat(100),
            &Adjustments {
                brightness: 1.5,
                ..Adjustments::default()
            },
        );
        assert_eq!(out.image.get_pixel(3, 3)[0], 227);
    }

    #[test]
    fn test_contrast_saturates() {
        let out = apply(
            &flat(200),
            &Adjustments {
                contrast: 2.0,
                ..Adjustments::default()
            },
        );
        assert_eq!(out.image.get_pixel(0, 0)[1], 255);
    }

    #[test]
    fn test_negative_values_take_absolute() {
        // 10 * 1 + (0 - 1) * 255 = -245 -> 245
        let out = apply(
            &flat(10),
            &Adjustments {
                brightness: 0.0,
                ..Adjustments::default()
            },
        );
        assert_eq!(out.image.get_pixel(5, 5)[2], 245);
    }

    #[test]
    fn test_sharpen_keeps_flat_image() {
        let out = apply(
            &flat(120),
            &Adjustments {
                focus: 2.0,
                ..Adjustments::default()
            },
        );
        let center = out.image.get_pixel(6, 6)[0];
        assert!((center as i32 - 120).abs() <= 1);
    }
}
