use image::imageops::{self, FilterType};
use image::DynamicImage;
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InferenceError;

/// Pixel resolution a model consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSize {
    pub height: u32,
    pub width: u32,
}

impl InputSize {
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }
}

impl fmt::Display for InputSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Batch of one RGB image, NHWC `(1, H, W, 3)`, values in [0, 1].
#[derive(Debug, Clone)]
pub struct PreprocessedTensor {
    data: Array4<f32>,
}

impl PreprocessedTensor {
    pub fn from_array(data: Array4<f32>) -> Result<Self, InferenceError> {
        let (batch, height, width, channels) = data.dim();
        if batch != 1 || channels != 3 || height == 0 || width == 0 {
            return Err(InferenceError::InvalidTensor(format!(
                "expected shape (1, H, W, 3), got {:?}",
                data.dim()
            )));
        }
        if data.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(InferenceError::InvalidTensor(
                "values must lie in [0, 1]".to_string(),
            ));
        }
        Ok(Self { data })
    }

    pub fn size(&self) -> InputSize {
        let (_, height, width, _) = self.data.dim();
        InputSize::new(height as u32, width as u32)
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }
}

pub fn decode(image_bytes: &[u8]) -> Result<DynamicImage, InferenceError> {
    Ok(image::load_from_memory(image_bytes)?)
}

/// Decodes, converts to RGB, resizes straight to `target` and scales to [0, 1].
pub fn preprocess(
    image_bytes: &[u8],
    target: InputSize,
) -> Result<PreprocessedTensor, InferenceError> {
    let image = decode(image_bytes)?;
    preprocess_image(&image, target)
}

pub fn preprocess_image(
    image: &DynamicImage,
    target: InputSize,
) -> Result<PreprocessedTensor, InferenceError> {
    if target.height == 0 || target.width == 0 {
        return Err(InferenceError::ShapeMismatch {
            expected: target,
            actual: InputSize::new(image.height(), image.width()),
        });
    }

    // Bilinear, no aspect-ratio preservation: same as the training loader.
    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, target.width, target.height, FilterType::Triangle);

    let shape = (1, target.height as usize, target.width as usize, 3);
    let values: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();
    let data = Array4::from_shape_vec(shape, values)
        .map_err(|e| InferenceError::InvalidTensor(e.to_string()))?;

    Ok(PreprocessedTensor { data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, RgbaImage};
    use rand::Rng;
    use std::io::Cursor;

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    #[test]
    fn test_preprocess_random_images_match_declared_sizes() {
        let mut rng = rand::rng();
        for target in [InputSize::square(224), InputSize::square(299), InputSize::new(17, 31)] {
            for _ in 0..4 {
                let (w, h) = (rng.random_range(1..=96), rng.random_range(1..=96));
                let img = RgbImage::from_fn(w, h, |_, _| {
                    Rgb([rng.random::<u8>(), rng.random::<u8>(), rng.random::<u8>()])
                });
                let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

                let tensor = preprocess(&bytes, target).unwrap();
                assert_eq!(
                    tensor.as_array().dim(),
                    (1, target.height as usize, target.width as usize, 3)
                );
                assert_eq!(tensor.size(), target);
                assert!(tensor.view().iter().all(|v| (0.0..=1.0).contains(v)));
            }
        }
    }

    #[test]
    fn test_preprocess_scales_pixel_values() {
        let img = RgbImage::from_pixel(8, 8, Rgb([255, 0, 51]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let tensor = preprocess(&bytes, InputSize::square(4)).unwrap();
        let data = tensor.as_array();
        assert!((data[[0, 2, 2, 0]] - 1.0).abs() < 0.005);
        assert!(data[[0, 2, 2, 1]].abs() < 0.005);
        assert!((data[[0, 2, 2, 2]] - 0.2).abs() < 0.005);
    }

    #[test]
    fn test_preprocess_drops_alpha_and_accepts_jpeg() {
        let rgba = RgbaImage::from_pixel(10, 6, image::Rgba([10, 20, 30, 0]));
        let png = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Png);
        let tensor = preprocess(&png, InputSize::square(5)).unwrap();
        assert_eq!(tensor.as_array().dim(), (1, 5, 5, 3));

        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(12, 12, image::Luma([128])));
        let jpeg = encode(gray, ImageFormat::Jpeg);
        let tensor = preprocess(&jpeg, InputSize::square(7)).unwrap();
        assert_eq!(tensor.as_array().dim(), (1, 7, 7, 3));
    }

    #[test]
    fn test_preprocess_rejects_garbage_bytes() {
        let err = preprocess(b"definitely not an image", InputSize::square(224)).unwrap_err();
        assert!(matches!(err, InferenceError::Decode(_)));
    }

    #[test]
    fn test_preprocess_rejects_zero_target() {
        let img = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let err = preprocess_image(&DynamicImage::ImageRgb8(img), InputSize::new(0, 224)).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_array_validates_shape() {
        assert!(PreprocessedTensor::from_array(Array4::zeros((1, 4, 4, 3))).is_ok());
        assert!(matches!(
            PreprocessedTensor::from_array(Array4::zeros((2, 4, 4, 3))),
            Err(InferenceError::InvalidTensor(_))
        ));
        assert!(matches!(
            PreprocessedTensor::from_array(Array4::from_elem((1, 4, 4, 3), 2.0)),
            Err(InferenceError::InvalidTensor(_))
        ));
    }
}
