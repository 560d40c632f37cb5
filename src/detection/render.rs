//! 检测结果标注 (在帧的副本上画框和标签)

use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use super::types::BoundingBox;

const BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TEXT_BG_COLOR: Rgba<u8> = Rgba([0, 0, 0, 128]);
const STROKE_WIDTH: i32 = 2;
const TEXT_SIZE: f32 = 32.0;

/// 标注器: 类别名称表 + 可选字体
///
/// 没有字体或类别名称时只画框
pub struct Annotator {
    labels: Vec<String>,
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(labels: Vec<String>, font: Option<FontVec>) -> Self {
        Self { labels, font }
    }

    /// 从字体文件加载 (ttf/otf)
    pub fn load_font(path: &std::path::Path) -> anyhow::Result<FontVec> {
        let data = std::fs::read(path)?;
        FontVec::try_from_vec(data).map_err(|e| anyhow::anyhow!("invalid font {}: {}", path.display(), e))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, class_index: usize) -> Option<&str> {
        self.labels.get(class_index).map(String::as_str)
    }

    /// 在原图副本上画出所有检测框
    pub fn annotate(&self, frame: &DynamicImage, boxes: &[BoundingBox]) -> RgbaImage {
        let mut canvas = frame.to_rgba8();
        let (width, height) = canvas.dimensions();
        if width == 0 || height == 0 {
            return canvas;
        }

        for bbox in boxes {
            let (x1, y1, x2, y2) = bbox.to_pixels(width, height);
            let (x1, y1) = (x1.round() as i32, y1.round() as i32);
            let (x2, y2) = (x2.round() as i32, y2.round() as i32);

            for s in 0..STROKE_WIDTH {
                let w = (x2 - x1 - 2 * s).max(1) as u32;
                let h = (y2 - y1 - 2 * s).max(1) as u32;
                draw_hollow_rect_mut(&mut canvas, Rect::at(x1 + s, y1 + s).of_size(w, h), BOX_COLOR);
            }

            if let (Some(font), Some(name)) = (self.font.as_ref(), self.label(bbox.class_index)) {
                let text = format!("{} {}%", name, (bbox.confidence * 100.0) as i32);
                let scale = PxScale::from(TEXT_SIZE);
                let (tw, th) = text_size(scale, font, &text);
                let text_y = (y1 - th as i32 - STROKE_WIDTH).max(0);
                if tw > 0 && th > 0 {
                    draw_filled_rect_mut(&mut canvas, Rect::at(x1, text_y).of_size(tw, th), TEXT_BG_COLOR);
                }
                draw_text_mut(&mut canvas, TEXT_COLOR, x1, text_y, scale, font, &text);
            }
        }

        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_draws_box_outline() {
        let frame = DynamicImage::new_rgb8(100, 100);
        let bbox = BoundingBox::from_cxcywh(0.5, 0.5, 0.4, 0.4, 0.9, 0);
        let annotator = Annotator::new(vec!["tricycle".to_string()], None);

        let out = annotator.annotate(&frame, &[bbox]);
        assert_eq!(out.dimensions(), (100, 100));
        assert_eq!(*out.get_pixel(30, 50), BOX_COLOR);
        assert_eq!(*out.get_pixel(50, 30), BOX_COLOR);
        // 框内部保持原样
        assert_eq!(out.get_pixel(50, 50).0[0], 0);
        // 原图不变
        assert_eq!(frame.to_rgba8().get_pixel(30, 50).0[0], 0);
    }

    #[test]
    fn test_label_lookup() {
        let annotator = Annotator::new(vec!["a".into(), "b".into()], None);
        assert_eq!(annotator.label(1), Some("b"));
        assert_eq!(annotator.label(2), None);
    }
}
