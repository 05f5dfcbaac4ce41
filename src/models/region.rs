//! 区域候选与最终裁剪框

use serde::{Deserialize, Serialize};

use super::anchor::Column;
use super::geometry::BBox;

/// 题目类型标签（引擎或上游能提供时）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// 未知
    #[default]
    Unknown,
    /// 选择题（信息更丰富的一类，去重时向幸存框传播）
    Choice,
    /// 解答题（高度下限更严格）
    Response,
}

/// 一个锚点对应的临时裁剪区域
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCandidate {
    pub id: u32,
    pub bbox: BBox,
    pub column: Column,
    #[serde(default)]
    pub kind: ItemKind,
}

impl RegionCandidate {
    pub fn new(id: u32, bbox: BBox, column: Column) -> Self {
        Self {
            id,
            bbox,
            column,
            kind: ItemKind::Unknown,
        }
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = kind;
        self
    }
}

/// 最终要落盘的裁剪
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Crop {
    /// 页内序号，从 1 开始
    pub seq: usize,
    /// 题号，限制在 0..=9999
    pub id: u32,
    pub bbox: BBox,
    pub column: Column,
}

impl Crop {
    /// `P{page:03}_Q{seq:03}_N{id:04}.png`
    pub fn file_name(&self, page_number: u32) -> String {
        format!("P{:03}_Q{:03}_N{:04}.png", page_number, self.seq, self.id)
    }
}
