//! 图像质量检查
//!
//! 使用拉普拉斯方差衡量清晰度，方差越低越模糊。

use acne_core::{AcneError, ImageFormat, Result};
use image::{DynamicImage, GrayImage};
use tracing::debug;

/// 默认模糊阈值
pub const DEFAULT_BLUR_THRESHOLD: f64 = 75.0;

/// 解码图像，并校验实际编码与声明的格式一致
pub fn decode_image(bytes: &[u8], declared: ImageFormat) -> Result<DynamicImage> {
    let detected = image::guess_format(bytes)
        .map_err(|e| AcneError::Validation(format!("无效的图像数据: {}", e)))?;

    let matches = matches!(
        (declared, detected),
        (ImageFormat::Png, image::ImageFormat::Png) | (ImageFormat::Jpeg, image::ImageFormat::Jpeg)
    );
    if !matches {
        return Err(AcneError::Validation(format!(
            "图像内容为 {:?}，与声明的类型 {} 不符",
            detected, declared
        )));
    }

    image::load_from_memory_with_format(bytes, detected)
        .map_err(|e| AcneError::Validation(format!("无效的图像数据: {}", e)))
}

/// 3x3 拉普拉斯核 `[0,1,0; 1,-4,1; 0,1,0]` 响应的方差
pub fn laplacian_variance(img: &GrayImage) -> f64 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = img.get_pixel(x, y).0[0] as f64;
            let top = img.get_pixel(x, y - 1).0[0] as f64;
            let bottom = img.get_pixel(x, y + 1).0[0] as f64;
            let left = img.get_pixel(x - 1, y).0[0] as f64;
            let right = img.get_pixel(x + 1, y).0[0] as f64;

            let laplacian = top + bottom + left + right - 4.0 * center;
            sum += laplacian;
            sum_sq += laplacian * laplacian;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64) - (mean * mean);
    variance.max(0.0)
}

/// 模糊检测器
#[derive(Debug, Clone)]
pub struct BlurDetector {
    threshold: f64,
}

impl BlurDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 已解码图像是否模糊
    pub fn is_image_blurred(&self, img: &DynamicImage) -> bool {
        let variance = laplacian_variance(&img.to_luma8());
        debug!(
            "Laplacian variance {:.2} (threshold {:.2})",
            variance, self.threshold
        );
        variance < self.threshold
    }

    /// 原始字节是否模糊，无法解码时返回验证错误
    pub fn is_blurred(&self, bytes: &[u8]) -> Result<bool> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| AcneError::Validation(format!("无效的图像数据: {}", e)))?;
        Ok(self.is_image_blurred(&img))
    }
}

impl Default for BlurDetector {
    fn default() -> Self {
        Self::new(DEFAULT_BLUR_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(img: RgbImage, format: ImageOutputFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), format)
            .unwrap();
        buf
    }

    fn checkerboard(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn test_uniform_image_has_zero_variance() {
        let gray = GrayImage::from_pixel(20, 20, Luma([128]));
        assert_eq!(laplacian_variance(&gray), 0.0);
    }

    #[test]
    fn test_tiny_image_is_zero() {
        let gray = GrayImage::from_pixel(2, 2, Luma([10]));
        assert_eq!(laplacian_variance(&gray), 0.0);
    }

    #[test]
    fn test_blur_threshold() {
        let detector = BlurDetector::default();
        let sharp = encode(checkerboard(32), ImageOutputFormat::Png);
        let flat = encode(RgbImage::from_pixel(32, 32, Rgb([90, 60, 40])), ImageOutputFormat::Png);

        assert!(!detector.is_blurred(&sharp).unwrap());
        assert!(detector.is_blurred(&flat).unwrap());
    }

    #[test]
    fn test_configurable_threshold() {
        let flat = encode(RgbImage::from_pixel(16, 16, Rgb([1, 2, 3])), ImageOutputFormat::Png);
        assert!(!BlurDetector::new(0.0).is_blurred(&flat).unwrap());
    }

    #[test]
    fn test_decode_rejects_mismatched_format() {
        let png = encode(checkerboard(8), ImageOutputFormat::Png);
        assert!(decode_image(&png, ImageFormat::Png).is_ok());
        assert!(matches!(
            decode_image(&png, ImageFormat::Jpeg),
            Err(AcneError::Validation(_))
        ));

        let jpeg = encode(checkerboard(8), ImageOutputFormat::Jpeg(90));
        assert!(decode_image(&jpeg, ImageFormat::Jpeg).is_ok());
    }

    #[test]
    fn test_garbage_bytes_are_invalid() {
        assert!(BlurDetector::default().is_blurred(b"not an image").is_err());
        assert!(decode_image(b"not an image", ImageFormat::Png).is_err());
    }
}
