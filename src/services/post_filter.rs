//! 候选区域后处理 - 业务能力层
//!
//! 去重 → 重叠截断 → 垃圾过滤，最后编号成裁剪框。

use serde::{Deserialize, Serialize};

use crate::models::{Column, Crop, ItemKind, RegionCandidate};

/// 后处理参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterTuning {
    pub dedup_iou: f64,
    /// 小框至少有该比例落在大框内即视为重复
    pub containment: f64,
    pub cut_gap_min: i32,
    pub cut_gap_frac: f64,
    /// 两个上边距离不小于该值才截断前一个
    pub cut_distance_min: i32,
    pub cut_distance_frac: f64,
    pub min_area_frac: f64,
    pub min_height_min: i32,
    pub min_height_frac: f64,
    /// 解答题的高度下限
    pub response_min_height_min: i32,
    pub response_min_height_frac: f64,
    pub banner_width_frac: f64,
    pub banner_height_frac: f64,
}

impl Default for FilterTuning {
    fn default() -> Self {
        Self {
            dedup_iou: 0.70,
            containment: 0.80,
            cut_gap_min: 10,
            cut_gap_frac: 0.01,
            cut_distance_min: 180,
            cut_distance_frac: 0.18,
            min_area_frac: 0.01,
            min_height_min: 100,
            min_height_frac: 0.08,
            response_min_height_min: 180,
            response_min_height_frac: 0.15,
            banner_width_frac: 0.70,
            banner_height_frac: 0.12,
        }
    }
}

fn scaled(min: i32, frac: f64, dim: i32) -> i32 {
    min.max((frac * dim as f64) as i32)
}

/// 合并两个重复框的类型：选择题优先，其次是已知类型
fn merge_kind(kept: ItemKind, other: ItemKind) -> ItemKind {
    match (kept, other) {
        (ItemKind::Choice, _) | (_, ItemKind::Choice) => ItemKind::Choice,
        (ItemKind::Unknown, k) => k,
        (k, _) => k,
    }
}

pub struct PostFilter {
    tuning: FilterTuning,
}

impl PostFilter {
    pub fn new(tuning: FilterTuning) -> Self {
        Self { tuning }
    }

    /// 完整后处理，返回按 (栏, 上边) 排序的候选
    pub fn apply(&self, items: Vec<RegionCandidate>, page_w: i32, page_h: i32) -> Vec<RegionCandidate> {
        let items = self.dedup(items);
        let items = self.overlap_cut(items, page_h);
        let mut items = self.drop_garbage(items, page_w, page_h);
        items.sort_by_key(|r| (r.column, r.bbox.y1));
        items
    }

    /// 按 (上, 左) 排序后去重：IoU 过高或一方基本包含另一方时只留较大的框
    pub fn dedup(&self, mut items: Vec<RegionCandidate>) -> Vec<RegionCandidate> {
        items.sort_by_key(|r| (r.bbox.y1, r.bbox.x1));
        let mut kept: Vec<RegionCandidate> = Vec::with_capacity(items.len());

        for item in items {
            let duplicate = kept.iter_mut().find(|k| {
                item.bbox.iou(&k.bbox) >= self.tuning.dedup_iou
                    || k.bbox.contains_ratio(&item.bbox, self.tuning.containment)
                    || item.bbox.contains_ratio(&k.bbox, self.tuning.containment)
            });

            match duplicate {
                Some(existing) => {
                    if item.bbox.area() > existing.bbox.area() {
                        let kind = merge_kind(item.kind, existing.kind);
                        *existing = item;
                        existing.kind = kind;
                    } else {
                        existing.kind = merge_kind(existing.kind, item.kind);
                    }
                }
                None => kept.push(item),
            }
        }
        kept
    }

    /// 栏内按上边排序；与下一个相距足够远时，把下边截到下一个上边之前
    ///
    /// 相距近的一对不动，所以重复执行结果不变。
    pub fn overlap_cut(&self, items: Vec<RegionCandidate>, page_h: i32) -> Vec<RegionCandidate> {
        let gap = scaled(self.tuning.cut_gap_min, self.tuning.cut_gap_frac, page_h);
        let min_distance = scaled(
            self.tuning.cut_distance_min,
            self.tuning.cut_distance_frac,
            page_h,
        );

        let mut out = Vec::with_capacity(items.len());
        for column in Column::ALL {
            let mut col: Vec<RegionCandidate> =
                items.iter().filter(|r| r.column == column).cloned().collect();
            col.sort_by_key(|r| r.bbox.y1);
            for i in 1..col.len() {
                let next_top = col[i].bbox.y1;
                let cur = &mut col[i - 1].bbox;
                if next_top - cur.y1 >= min_distance {
                    let cut = next_top - gap;
                    if cut < cur.y2 {
                        cur.y2 = cut;
                    }
                }
            }
            out.extend(col);
        }
        out
    }

    /// 去掉面积过小、高度不足、以及细长横幅
    pub fn drop_garbage(
        &self,
        items: Vec<RegionCandidate>,
        page_w: i32,
        page_h: i32,
    ) -> Vec<RegionCandidate> {
        let t = &self.tuning;
        let min_area = (t.min_area_frac * page_w as f64 * page_h as f64) as i64;
        let base_min_h = scaled(t.min_height_min, t.min_height_frac, page_h);
        let response_min_h = scaled(t.response_min_height_min, t.response_min_height_frac, page_h);

        items
            .into_iter()
            .filter(|r| {
                let (w, h) = (r.bbox.width(), r.bbox.height());
                if r.bbox.area() < min_area {
                    return false;
                }
                let min_h = match r.kind {
                    ItemKind::Response => response_min_h,
                    _ => base_min_h,
                };
                if h < min_h {
                    return false;
                }
                let banner = w as f64 > page_w as f64 * t.banner_width_frac
                    && (h as f64) < page_h as f64 * t.banner_height_frac;
                !banner
            })
            .collect()
    }
}

/// 按 (栏, 上边) 顺序编号，题号限制在 0..=9999
pub fn number_crops(items: &[RegionCandidate]) -> Vec<Crop> {
    let mut ordered: Vec<&RegionCandidate> = items.iter().collect();
    ordered.sort_by_key(|r| (r.column, r.bbox.y1));
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, r)| Crop {
            seq: idx + 1,
            id: r.id.min(9999),
            bbox: r.bbox,
            column: r.column,
        })
        .collect()
}
