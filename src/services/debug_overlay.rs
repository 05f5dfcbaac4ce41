//! 调试叠加图 - 业务能力层
//!
//! 在页面图上画出锚点（红）、图/表（绿）和最终裁剪（蓝），保存为 `debug_P###.jpg`。

use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::error::AppResult;
use crate::models::{Anchor, BBox, Crop, LayoutObject};

const ANCHOR_COLOR: Rgb<u8> = Rgb([220, 30, 30]);
const OBJECT_COLOR: Rgb<u8> = Rgb([30, 170, 60]);
const CROP_COLOR: Rgb<u8> = Rgb([30, 80, 220]);

/// 线宽（像素）
const STROKE: i32 = 3;

pub fn overlay_file_name(page_number: u32) -> String {
    format!("debug_P{:03}.jpg", page_number)
}

/// 画出叠加图，不落盘
pub fn render(
    page: &DynamicImage,
    anchors: &[Anchor],
    objects: &[LayoutObject],
    crops: &[Crop],
) -> RgbImage {
    let mut canvas = page.to_rgb8();

    for obj in objects.iter().filter(|o| o.kind.is_illustration()) {
        draw_box(&mut canvas, &obj.bbox, OBJECT_COLOR);
    }
    for crop in crops {
        draw_box(&mut canvas, &crop.bbox, CROP_COLOR);
    }
    for anchor in anchors {
        draw_box(&mut canvas, &anchor.bbox, ANCHOR_COLOR);
    }
    canvas
}

/// 画出并保存到 `dir/debug_P###.jpg`
pub fn save(
    dir: &Path,
    page_number: u32,
    page: &DynamicImage,
    anchors: &[Anchor],
    objects: &[LayoutObject],
    crops: &[Crop],
) -> AppResult<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| crate::error::AppError::file_write_failed(dir, e))?;
    let path = dir.join(overlay_file_name(page_number));
    render(page, anchors, objects, crops).save(&path)?;
    Ok(path)
}

fn draw_box(canvas: &mut RgbImage, bbox: &BBox, color: Rgb<u8>) {
    for inset in 0..STROKE {
        let w = bbox.width() - 2 * inset;
        let h = bbox.height() - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, LayoutKind, Strictness};

    #[test]
    fn test_render_colors_each_layer() {
        let page = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([255, 255, 255])));
        let anchors = vec![Anchor {
            id: 1,
            bbox: BBox::new(10, 10, 40, 30),
            column: Column::Left,
            strictness: Strictness::Strict,
        }];
        let objects = vec![
            LayoutObject {
                kind: LayoutKind::Figure,
                bbox: BBox::new(50, 50, 120, 120),
            },
            LayoutObject {
                kind: LayoutKind::Text,
                bbox: BBox::new(150, 150, 190, 190),
            },
        ];
        let crops = vec![Crop {
            seq: 1,
            id: 1,
            bbox: BBox::new(5, 5, 195, 140),
            column: Column::Left,
        }];

        let canvas = render(&page, &anchors, &objects, &crops);
        assert_eq!(*canvas.get_pixel(10, 20), ANCHOR_COLOR);
        assert_eq!(*canvas.get_pixel(50, 80), OBJECT_COLOR);
        assert_eq!(*canvas.get_pixel(5, 100), CROP_COLOR);
        // 文本块不画
        assert_eq!(*canvas.get_pixel(150, 170), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_save_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let page = DynamicImage::ImageRgb8(RgbImage::new(64, 64));
        let path = save(dir.path(), 7, &page, &[], &[], &[]).unwrap();
        assert_eq!(path.file_name().unwrap(), "debug_P007.jpg");
        assert!(path.exists());
    }
}
