//! 在引擎返回的 JSON 树里找 (文本, 框)
//!
//! 引擎版本不同，结构也不同，所以这里只做有界深度的防御式遍历，
//! 不对字段布局做任何假设。

use std::collections::HashSet;

use serde_json::Value as JsonValue;

use crate::models::BBox;

/// 遍历的最大深度
pub const MAX_DEPTH: usize = 4;

const TEXT_KEYS: [&str; 5] = ["text", "ocrText", "rec_text", "content", "transcription"];
const BBOX_KEYS: [&str; 6] = ["text_region", "bbox", "xyxy", "points", "polygon", "poly"];
const NESTED_BOX_KEYS: [&str; 6] = ["points", "bbox", "xyxy", "box", "polygon", "text_region"];
const TOKEN_KEYS: [&str; 5] = ["ocr", "text", "rec", "word", "line"];

/// 一段文本及其框（可能没有框）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextCandidate {
    pub text: String,
    pub bbox: Option<BBox>,
}

/// 坐标绝对值上限，超出视为无效框
pub const COORD_LIMIT: f64 = 1_000_000.0;

fn as_coord(value: &JsonValue) -> Option<i32> {
    value
        .as_f64()
        .filter(|v| v.is_finite() && v.abs() <= COORD_LIMIT)
        .map(|v| v as i32)
}

fn is_container(value: &JsonValue) -> bool {
    value.is_object() || value.is_array()
}

/// 把各种形态的框/多边形归一成 `BBox`
///
/// 支持：带 `points`/`bbox`/... 键的对象、带 `x1..y2` 的对象、
/// 扁平的 `[x1, y1, x2, y2]`、以及至少 4 个点的多边形。
/// 退化的框、以及任一坐标超出 `COORD_LIMIT` 的框返回 `None`。
pub fn poly_to_bbox(poly: &JsonValue) -> Option<BBox> {
    if let JsonValue::Object(obj) = poly {
        for key in NESTED_BOX_KEYS {
            if let Some(inner) = obj.get(key) {
                return poly_to_bbox(inner);
            }
        }
        let corners: Option<Vec<i32>> = ["x1", "y1", "x2", "y2"]
            .iter()
            .map(|k| obj.get(*k).and_then(as_coord))
            .collect();
        return corners.and_then(|c| BBox::from_corners(c[0], c[1], c[2], c[3]));
    }

    let items = poly.as_array()?;

    if items.len() == 4 && items.iter().all(JsonValue::is_number) {
        let c: Vec<i32> = items.iter().map(as_coord).collect::<Option<_>>()?;
        return BBox::from_corners(c[0], c[1], c[2], c[3]);
    }

    if items.len() < 4 {
        return None;
    }

    let mut xs = Vec::with_capacity(items.len());
    let mut ys = Vec::with_capacity(items.len());
    for point in items {
        let Some(pair) = point.as_array() else {
            continue;
        };
        if pair.len() < 2 {
            continue;
        }
        xs.push(as_coord(&pair[0])?);
        ys.push(as_coord(&pair[1])?);
    }
    if xs.len() < 2 {
        return None;
    }

    let x1 = *xs.iter().min()?;
    let x2 = *xs.iter().max()?;
    let y1 = *ys.iter().min()?;
    let y2 = *ys.iter().max()?;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(BBox::new(x1, y1, x2, y2))
}

/// `source` 本身是数组就返回它，否则按顺序取第一个数组类型的键
pub fn pick_list_by_keys<'a>(source: &'a JsonValue, keys: &[&str]) -> &'a [JsonValue] {
    match source {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => keys
            .iter()
            .find_map(|k| obj.get(*k).and_then(JsonValue::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

fn display_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// 递归收集 (文本, 框)，最多 `cap` 条
pub fn extract_text_candidates(item: &JsonValue, cap: usize) -> Vec<TextCandidate> {
    let mut out = Vec::new();
    walk(item, 0, cap, &mut out);
    out
}

fn walk(item: &JsonValue, depth: usize, cap: usize, out: &mut Vec<TextCandidate>) {
    if depth > MAX_DEPTH || out.len() >= cap {
        return;
    }

    match item {
        JsonValue::Object(obj) => {
            let text = TEXT_KEYS
                .iter()
                .filter_map(|k| obj.get(*k).and_then(JsonValue::as_str))
                .map(str::trim)
                .find(|t| !t.is_empty());
            if let Some(text) = text {
                let bbox = BBOX_KEYS
                    .iter()
                    .filter_map(|k| obj.get(*k))
                    .find_map(poly_to_bbox);
                out.push(TextCandidate {
                    text: text.to_string(),
                    bbox,
                });
                if out.len() >= cap {
                    return;
                }
            }

            parallel_arrays(obj, cap, out);

            for value in obj.values() {
                if out.len() >= cap {
                    break;
                }
                if is_container(value) {
                    walk(value, depth + 1, cap, out);
                }
            }
        }
        JsonValue::Array(items) => {
            if items.len() >= 2 {
                // 只认字符串，避免把坐标数组里的数字当成文本
                let text = match &items[1] {
                    JsonValue::Array(info) => info
                        .first()
                        .and_then(JsonValue::as_str)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                    JsonValue::String(s) => s.trim().to_string(),
                    _ => String::new(),
                };
                if !text.is_empty() {
                    out.push(TextCandidate {
                        text,
                        bbox: poly_to_bbox(&items[0]),
                    });
                    if out.len() >= cap {
                        return;
                    }
                }
            }
            for node in items {
                if out.len() >= cap {
                    break;
                }
                if is_container(node) {
                    walk(node, depth + 1, cap, out);
                }
            }
        }
        _ => {}
    }
}

/// OCR 结果常见的并列数组：`rec_texts[i]` 对应 `rec_boxes[i]` / `rec_polys[i]`
fn parallel_arrays(
    obj: &serde_json::Map<String, JsonValue>,
    cap: usize,
    out: &mut Vec<TextCandidate>,
) {
    let Some(texts) = obj.get("rec_texts").and_then(JsonValue::as_array) else {
        return;
    };
    let boxes = ["rec_boxes", "rec_polys", "dt_polys"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(JsonValue::as_array));
    let Some(boxes) = boxes else {
        return;
    };

    for (text, bbox) in texts.iter().zip(boxes) {
        if out.len() >= cap {
            return;
        }
        let text = display_text(text);
        if text.is_empty() {
            continue;
        }
        out.push(TextCandidate {
            text,
            bbox: poly_to_bbox(bbox),
        });
    }
}

/// 找出键名含 ocr/text/rec/word/line 的子树，作为额外的文本来源
pub fn collect_token_sources(root: &JsonValue) -> Vec<&JsonValue> {
    let mut out = Vec::new();
    collect_tokens(root, 0, &mut out);
    out
}

fn collect_tokens<'a>(root: &'a JsonValue, depth: usize, out: &mut Vec<&'a JsonValue>) {
    if depth > MAX_DEPTH {
        return;
    }
    match root {
        JsonValue::Object(obj) => {
            for (key, value) in obj {
                if !is_container(value) {
                    continue;
                }
                let key = key.to_lowercase();
                if TOKEN_KEYS.iter().any(|tok| key.contains(tok)) {
                    out.push(value);
                }
                collect_tokens(value, depth + 1, out);
            }
        }
        JsonValue::Array(items) => {
            for item in items.iter().filter(|v| is_container(v)) {
                collect_tokens(item, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// 按节点身份去重的来源列表
#[derive(Default)]
pub struct SourceSet<'a> {
    seen: HashSet<*const JsonValue>,
    sources: Vec<&'a JsonValue>,
}

impl<'a> SourceSet<'a> {
    pub fn push(&mut self, source: Option<&'a JsonValue>) {
        let Some(source) = source.filter(|s| !s.is_null()) else {
            return;
        };
        if self.seen.insert(source as *const JsonValue) {
            self.sources.push(source);
        }
    }

    pub fn extend(&mut self, sources: impl IntoIterator<Item = &'a JsonValue>) {
        for source in sources {
            self.push(Some(source));
        }
    }

    pub fn into_vec(self) -> Vec<&'a JsonValue> {
        self.sources
    }
}
