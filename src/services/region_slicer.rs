//! 区域切片 - 业务能力层
//!
//! 按栏处理：每个锚点向下延伸到下一个锚点之前，图/表不切断，
//! 栏间不越界，栏内冲突整栏放弃。

use serde::{Deserialize, Serialize};

use crate::models::{Anchor, BBox, Column, LayoutObject, RegionCandidate};

/// 切片参数（比例都相对页面尺寸）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceTuning {
    pub margin_min: i32,
    pub margin_frac: f64,
    pub pad_x_min: i32,
    pub pad_x_frac: f64,
    pub pad_y_min: i32,
    pub pad_y_frac: f64,
    /// 左栏右边界的上限（右栏左边界下限为 `1 - column_limit`）
    pub column_limit: f64,
    /// 相邻区域重叠超过该比例即为冲突
    pub conflict_frac: f64,
}

impl Default for SliceTuning {
    fn default() -> Self {
        Self {
            margin_min: 10,
            margin_frac: 0.01,
            pad_x_min: 30,
            pad_x_frac: 0.015,
            pad_y_min: 30,
            pad_y_frac: 0.015,
            column_limit: 0.60,
            conflict_frac: 0.15,
        }
    }
}

fn scaled(min: i32, frac: f64, dim: i32) -> i32 {
    min.max((frac * dim as f64) as i32)
}

impl SliceTuning {
    pub fn margin(&self, page_h: i32) -> i32 {
        scaled(self.margin_min, self.margin_frac, page_h)
    }

    pub fn pad_x(&self, page_w: i32) -> i32 {
        scaled(self.pad_x_min, self.pad_x_frac, page_w)
    }

    pub fn pad_y(&self, page_h: i32) -> i32 {
        scaled(self.pad_y_min, self.pad_y_frac, page_h)
    }
}

/// 一页的切片结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceOutcome {
    /// 已外扩、已裁到页面内的区域，按 (栏, 上边) 排序
    pub regions: Vec<RegionCandidate>,
    pub errors: usize,
    /// 因重叠冲突被整栏放弃的栏
    pub conflicts: Vec<Column>,
}

pub struct RegionSlicer {
    tuning: SliceTuning,
}

impl RegionSlicer {
    pub fn new(tuning: SliceTuning) -> Self {
        Self { tuning }
    }

    pub fn slice(
        &self,
        anchors: &[Anchor],
        objects: &[LayoutObject],
        page_w: i32,
        page_h: i32,
    ) -> SliceOutcome {
        let mut outcome = SliceOutcome::default();
        let pad_x = self.tuning.pad_x(page_w);
        let pad_y = self.tuning.pad_y(page_h);

        for column in Column::ALL {
            let (raw, errors) = self.build_column(column, anchors, objects, page_w, page_h);
            outcome.errors += errors;

            match self.resolve_overlaps(raw, page_h) {
                Some(resolved) => outcome.regions.extend(resolved.into_iter().map(|mut r| {
                    r.bbox = r.bbox.padded(pad_x, pad_y, page_w, page_h);
                    r
                })),
                None => {
                    outcome.errors += 1;
                    outcome.conflicts.push(column);
                }
            }
        }

        outcome
    }

    /// 一栏的原始区域（未外扩），以及被跳过的锚点数
    pub fn build_column(
        &self,
        column: Column,
        anchors: &[Anchor],
        objects: &[LayoutObject],
        page_w: i32,
        page_h: i32,
    ) -> (Vec<RegionCandidate>, usize) {
        let margin = self.tuning.margin(page_h);
        let half = (page_w as f64 * 0.5) as i32;
        let (span_x1, span_x2) = match column {
            Column::Left => (0, half),
            Column::Right => (half, page_w),
        };
        let left_limit = (page_w as f64 * self.tuning.column_limit) as i32;
        let right_limit = (page_w as f64 * (1.0 - self.tuning.column_limit)) as i32;

        let mut col_anchors: Vec<&Anchor> = anchors.iter().filter(|a| a.column == column).collect();
        col_anchors.sort_by_key(|a| a.bbox.y1);

        let mut regions = Vec::new();
        let mut errors = 0;
        for (i, anchor) in col_anchors.iter().enumerate() {
            let top = anchor.bbox.y1;
            let bottom = match col_anchors.get(i + 1) {
                Some(next) => next.bbox.y1 - margin,
                None => page_h,
            };
            if bottom <= top {
                errors += 1;
                continue;
            }

            let mut bbox = BBox::new(span_x1, top, span_x2, bottom);
            for obj in objects.iter().filter(|o| o.kind.is_illustration()) {
                let (cx, cy) = obj.bbox.center();
                if bbox.contains_point(cx, cy) {
                    bbox = bbox.union(&obj.bbox);
                }
            }

            match column {
                Column::Left => bbox.x2 = bbox.x2.min(left_limit),
                Column::Right => bbox.x1 = bbox.x1.max(right_limit),
            }
            if bbox.x2 <= bbox.x1 {
                errors += 1;
                continue;
            }

            regions.push(RegionCandidate::new(anchor.id, bbox, column));
        }

        regions.sort_by_key(|r| r.bbox.y1);
        (regions, errors)
    }

    /// 轻微重叠时把后一个区域的上边推到前一个下边之后；重叠过大返回 `None`
    pub fn resolve_overlaps(
        &self,
        mut regions: Vec<RegionCandidate>,
        page_h: i32,
    ) -> Option<Vec<RegionCandidate>> {
        let margin = self.tuning.margin(page_h);
        let tolerance = (self.tuning.conflict_frac * page_h as f64) as i32;

        for i in 1..regions.len() {
            let prev_bottom = regions[i - 1].bbox.y2;
            let next = &mut regions[i].bbox;
            let overlap = prev_bottom - next.y1;
            if overlap <= 0 {
                continue;
            }
            if overlap > tolerance {
                return None;
            }
            next.y1 = prev_bottom + margin;
            if next.y1 >= next.y2 {
                return None;
            }
        }
        Some(regions)
    }
}
