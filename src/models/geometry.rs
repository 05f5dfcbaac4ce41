//! 页面像素坐标下的轴对齐矩形
//!
//! 所有坐标都是整数像素，`x1 < x2`、`y1 < y2`。
//! 框可能来自不可信的引擎输出，算术一律不溢出。

use serde::{Deserialize, Serialize};

/// `hi - lo`，负数取 0，超出 `i32` 时取上限
fn span(lo: i32, hi: i32) -> i32 {
    (hi as i64 - lo as i64).clamp(0, i32::MAX as i64) as i32
}

/// 轴对齐包围框 `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl From<[i32; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 由任意两个角点构造；退化（零宽或零高）时返回 `None`
    pub fn from_corners(xa: i32, ya: i32, xb: i32, yb: i32) -> Option<Self> {
        let (x1, x2) = (xa.min(xb), xa.max(xb));
        let (y1, y2) = (ya.min(yb), ya.max(yb));
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    pub fn width(&self) -> i32 {
        span(self.x1, self.x2)
    }

    pub fn height(&self) -> i32 {
        span(self.y1, self.y2)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// 点是否落在框内（含边界）
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.x1 as f64 <= x && x <= self.x2 as f64 && self.y1 as f64 <= y && y <= self.y2 as f64
    }

    pub fn intersection_area(&self, other: &BBox) -> i64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        span(ix1, ix2) as i64 * span(iy1, iy2) as i64
    }

    pub fn iou(&self, other: &BBox) -> f64 {
        let inter = self.intersection_area(other);
        if inter <= 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }

    /// `small` 有至少 `ratio` 比例的面积落在 `self` 内
    pub fn contains_ratio(&self, small: &BBox, ratio: f64) -> bool {
        let small_area = small.area();
        small_area > 0 && self.intersection_area(small) as f64 / small_area as f64 >= ratio
    }

    /// 最小外接框
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// 四周外扩后裁到 `[0, width] × [0, height]`
    pub fn padded(&self, pad_x: i32, pad_y: i32, width: i32, height: i32) -> BBox {
        BBox {
            x1: self.x1.saturating_sub(pad_x).clamp(0, (width - 1).max(0)),
            y1: self.y1.saturating_sub(pad_y).clamp(0, (height - 1).max(0)),
            x2: self.x2.saturating_add(pad_x).clamp(1, width.max(1)),
            y2: self.y2.saturating_add(pad_y).clamp(1, height.max(1)),
        }
    }

    /// 纵向重叠像素数（不重叠时为负或零）
    pub fn vertical_overlap(&self, below: &BBox) -> i32 {
        self.y2.saturating_sub(below.y1)
    }
}

impl std::fmt::Display for BBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x1, self.y1, self.x2, self.y2)
    }
}
