//! Image preprocessing for the embedding network.
//!
//! Faces are cropped straight from the detector box (no landmark alignment),
//! resized to the embedder input resolution and normalized to [-1, 1].

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array3;

use crate::types::Detection;

/// Embedder input resolution (square).
pub const EMBED_INPUT_SIZE: usize = 112;
const EMBED_MEAN: f32 = 0.5;
const EMBED_STD: f32 = 0.5;

/// Decode an image from raw bytes (format sniffed from the content).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

/// Crop a detected face out of the image.
///
/// The box is clamped to the image bounds first. Returns `None` when the
/// clamped box has no area (a detection entirely outside the image).
pub fn crop_face(image: &DynamicImage, det: &Detection) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();

    let x1 = det.x_min.max(0.0) as u32;
    let y1 = det.y_min.max(0.0) as u32;
    let x2 = (det.x_max.max(0.0) as u32).min(width);
    let y2 = (det.y_max.max(0.0) as u32).min(height);

    let w = x2.saturating_sub(x1);
    let h = y2.saturating_sub(y1);
    if w == 0 || h == 0 {
        return None;
    }

    Some(image.crop_imm(x1, y1, w, h))
}

/// Resize a face crop to the embedder input and normalize into a CHW tensor.
///
/// Pixel mapping: v/255 centered on 0.5 with std 0.5, so 0 → -1.0 and 255 → 1.0.
pub fn embedder_input(crop: &DynamicImage) -> Array3<f32> {
    let size = EMBED_INPUT_SIZE;
    let resized = crop
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let mut tensor = Array3::<f32>::zeros((3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[c, y as usize, x as usize]] =
                (pixel[c] as f32 / 255.0 - EMBED_MEAN) / EMBED_STD;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn solid_image(w: u32, h: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, image::Rgb([value; 3])))
    }

    fn det(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Detection {
        Detection {
            x_min,
            y_min,
            x_max,
            y_max,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_crop_clamps_to_image_bounds() {
        let image = solid_image(100, 80, 10);
        let crop = crop_face(&image, &det(-20.0, -10.0, 120.0, 90.0)).unwrap();
        assert_eq!(crop.dimensions(), (100, 80));
    }

    #[test]
    fn test_crop_interior_box() {
        let image = solid_image(100, 80, 10);
        let crop = crop_face(&image, &det(10.0, 20.0, 60.0, 50.0)).unwrap();
        assert_eq!(crop.dimensions(), (50, 30));
    }

    #[test]
    fn test_crop_degenerate_box_is_none() {
        let image = solid_image(100, 80, 10);
        assert!(crop_face(&image, &det(30.0, 30.0, 30.0, 60.0)).is_none());
        // Entirely outside the image.
        assert!(crop_face(&image, &det(200.0, 200.0, 300.0, 300.0)).is_none());
    }

    #[test]
    fn test_embedder_input_shape() {
        let crop = solid_image(37, 53, 128);
        let tensor = embedder_input(&crop);
        assert_eq!(tensor.shape(), &[3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE]);
    }

    #[test]
    fn test_embedder_input_normalization_extremes() {
        let black = embedder_input(&solid_image(10, 10, 0));
        assert!((black[[0, 0, 0]] + 1.0).abs() < 1e-6);

        let white = embedder_input(&solid_image(10, 10, 255));
        assert!((white[[2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedder_input_midpoint_near_zero() {
        let gray = embedder_input(&solid_image(10, 10, 128));
        // 128/255 = 0.50196… → (v - 0.5) / 0.5 ≈ 0.0078
        assert!(gray[[1, 3, 3]].abs() < 0.01);
    }
}
