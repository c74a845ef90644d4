//! 结果图渲染
//!
//! 在区域图像上绘制检测框，输出 JPEG。

use acne_core::{AcneError, BoundingBox, LesionDetection, LesionType, Result};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;

const BOX_THICKNESS: u32 = 2;
const JPEG_QUALITY: u8 = 90;

fn lesion_color(lesion_type: LesionType) -> Rgb<u8> {
    match lesion_type {
        LesionType::Comedones => Rgb([255, 221, 0]),
        LesionType::Papules => Rgb([255, 140, 0]),
        LesionType::Pustules => Rgb([230, 40, 40]),
        LesionType::Nodules => Rgb([160, 0, 200]),
        LesionType::Other => Rgb([128, 128, 128]),
    }
}

/// 绘制空心矩形，坐标裁剪到图像范围内
fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let (x0, x1) = (clamp_x(bbox.x0.min(bbox.x1)), clamp_x(bbox.x0.max(bbox.x1)));
    let (y0, y1) = (clamp_y(bbox.y0.min(bbox.y1)), clamp_y(bbox.y0.max(bbox.y1)));

    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            img.put_pixel(x, (y0 + t).min(y1), color);
            img.put_pixel(x, y1.saturating_sub(t).max(y0), color);
        }
        for y in y0..=y1 {
            img.put_pixel((x0 + t).min(x1), y, color);
            img.put_pixel(x1.saturating_sub(t).max(x0), y, color);
        }
    }
}

/// 渲染带检测框的结果图
pub fn render_result_visual(image_bytes: &[u8], detections: &[LesionDetection]) -> Result<Vec<u8>> {
    let mut canvas = image::load_from_memory(image_bytes)
        .map_err(|e| AcneError::Validation(format!("无效的图像数据: {}", e)))?
        .to_rgb8();

    for detection in detections {
        if let Some(bbox) = &detection.bbox {
            draw_box(&mut canvas, bbox, lesion_color(detection.lesion_type));
        }
    }

    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(JPEG_QUALITY))
        .map_err(|e| AcneError::Internal(format!("结果图编码失败: {}", e)))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_png(w: u32, h: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([255, 255, 255])))
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_draw_box_marks_edges_only() {
        let mut img = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let bbox = BoundingBox {
            x0: 2.0,
            y0: 2.0,
            x1: 15.0,
            y1: 15.0,
        };
        draw_box(&mut img, &bbox, Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(2, 2), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(15, 10), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(9, 9), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_out_of_bounds_box_is_clamped() {
        let mut img = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        let bbox = BoundingBox {
            x0: -5.0,
            y0: 3.0,
            x1: 400.0,
            y1: 900.0,
        };
        draw_box(&mut img, &bbox, Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(9, 9), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_render_outputs_jpeg() {
        let detections = vec![LesionDetection::new(LesionType::Papules, 0.4).with_bbox(BoundingBox {
            x0: 1.0,
            y0: 1.0,
            x1: 6.0,
            y1: 6.0,
        })];
        let out = render_result_visual(&white_png(12, 12), &detections).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn test_render_rejects_invalid_bytes() {
        assert!(render_result_visual(b"garbage", &[]).is_err());
    }
}
