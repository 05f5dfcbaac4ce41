//! 题号锚点与版面对象

use serde::{Deserialize, Serialize};

use super::geometry::BBox;

/// 双栏版面中的栏位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    /// 左栏
    Left,
    /// 右栏
    Right,
}

impl Column {
    pub const ALL: [Column; 2] = [Column::Left, Column::Right];

    /// 按水平中点与页宽一半比较归栏
    pub fn of(bbox: &BBox, page_width: i32) -> Self {
        let (cx, _) = bbox.center();
        if cx < page_width as f64 * 0.5 {
            Column::Left
        } else {
            Column::Right
        }
    }

    pub fn index(self) -> usize {
        match self {
            Column::Left => 0,
            Column::Right => 1,
        }
    }
}

/// 题号匹配强度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// 文本只有题号本身
    Strict,
    /// 题号作为前缀或从文本中抽出
    Weak,
}

/// 通过模式与几何过滤的题号锚点
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub id: u32,
    pub bbox: BBox,
    pub column: Column,
    pub strictness: Strictness,
}

/// 版面对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    Figure,
    Table,
    Text,
}

impl LayoutKind {
    /// 由引擎给出的块类型名归类
    pub fn classify(label: &str) -> Self {
        let label = label.to_lowercase();
        if label.contains("figure") || label.contains("image") {
            LayoutKind::Figure
        } else if label.contains("table") {
            LayoutKind::Table
        } else {
            LayoutKind::Text
        }
    }

    /// 切片时不允许被切断的对象
    pub fn is_illustration(self) -> bool {
        matches!(self, LayoutKind::Figure | LayoutKind::Table)
    }
}

/// 版面对象（图、表、文本块）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutObject {
    pub kind: LayoutKind,
    pub bbox: BBox,
}
