//! 锚点提取 - 业务能力层
//!
//! 引擎结果 → 干净的题号锚点 + 版面对象。
//!
//! 步骤：收集 (文本, 框) → 题号模式匹配 → 按栏归位 → A/B/C 三级几何过滤
//! （首个有结果的层级胜出，层内严格匹配优先）→ 去重排序。

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::error::Stage;
use crate::models::{
    Anchor, BBox, Column, DetectFailure, Detection, LayoutKind, LayoutObject, Strictness,
};
use crate::services::payload_walker::{
    collect_token_sources, extract_text_candidates, pick_list_by_keys, poly_to_bbox, SourceSet,
};
use crate::utils::logging::truncate_text;

const LAYOUT_KEYS: [&str; 6] = ["prunedResult", "res", "result", "layout", "outputs", "regions"];
const LINE_KEYS: [&str; 6] = ["res", "words", "lines", "text_lines", "ocr", "ocr_result"];
const TEXT_BLOCK_TYPES: [&str; 4] = ["text", "title", "list", "paragraph"];
const BLOCK_TYPE_KEYS: [&str; 4] = ["type", "label", "block_label", "category"];
const BLOCK_BBOX_KEYS: [&str; 3] = ["bbox", "block_bbox", "coordinate"];

struct Patterns {
    strict: Regex,
    weak: Regex,
    leading: Regex,
    strict_num: Regex,
    fallback: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        strict: Regex::new(r"^\s*\d{4}\s*$").expect("strict pattern"),
        weak: Regex::new(r"^\s*0*\d{1,4}\s*$").expect("weak pattern"),
        leading: Regex::new(r"^\s*0*(\d{1,4})([.)]|\s|$)").expect("leading pattern"),
        strict_num: Regex::new(r"^\s*0*(\d{1,4})\s*([.)]|$)").expect("strict number pattern"),
        fallback: Regex::new(r"\b0*(\d{1,4})\b").expect("fallback pattern"),
    })
}

fn valid_id(digits: &str) -> Option<u32> {
    digits.parse::<u32>().ok().filter(|id| (1..=9999).contains(id))
}

/// 从文本解析题号
///
/// 先要求题号在开头（可带 `.`/`)` 或空白）；`allow_fallback` 时再在文本任意位置找。
pub fn parse_item_id(text: &str, allow_fallback: bool) -> Option<u32> {
    let p = patterns();
    if let Some(caps) = p.leading.captures(text).or_else(|| p.strict_num.captures(text)) {
        return valid_id(caps.get(1)?.as_str());
    }
    if !allow_fallback {
        return None;
    }
    valid_id(p.fallback.captures(text)?.get(1)?.as_str())
}

/// 文本只有题号本身（严格的 4 位或带前导零的 1-4 位）
pub fn is_bare_number(text: &str) -> bool {
    let p = patterns();
    p.strict.is_match(text) || p.weak.is_match(text)
}

/// 一级几何过滤的阈值（都是页面尺寸的比例）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBounds {
    pub name: String,
    pub max_height: f64,
    pub max_width: f64,
    /// 左栏锚点的 x1 上限
    pub left_x1_max: f64,
    /// 右栏锚点的 x1 下限
    pub right_x1_min: f64,
}

impl TierBounds {
    fn new(name: &str, max_height: f64, max_width: f64, left_x1_max: f64, right_x1_min: f64) -> Self {
        Self {
            name: name.to_string(),
            max_height,
            max_width,
            left_x1_max,
            right_x1_min,
        }
    }

    pub fn admits(&self, bbox: &BBox, page_w: i32, page_h: i32) -> bool {
        let (w, h) = (page_w as f64, page_h as f64);
        if bbox.height() as f64 > self.max_height * h || bbox.width() as f64 > self.max_width * w {
            return false;
        }
        match Column::of(bbox, page_w) {
            Column::Left => bbox.x1 as f64 <= self.left_x1_max * w,
            Column::Right => bbox.x1 as f64 >= self.right_x1_min * w,
        }
    }
}

/// 锚点提取参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorTuning {
    /// 按顺序尝试的几何层级
    pub tiers: Vec<TierBounds>,
    pub candidate_cap: usize,
    /// 每个文本块最多挖出的行数
    pub block_line_cap: usize,
    /// 诊断信息里保留的样本数
    pub sample_cap: usize,
}

impl Default for AnchorTuning {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierBounds::new("A", 0.12, 0.20, 0.35, 0.50),
                TierBounds::new("B", 0.18, 0.30, 0.35, 0.50),
                TierBounds::new("C", 0.22, 0.35, 0.40, 0.45),
            ],
            candidate_cap: 500,
            block_line_cap: 120,
            sample_cap: 40,
        }
    }
}

/// 提取过程的诊断信息，零锚点时写进错误旁路文件
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionTrace {
    pub pp_json_keys: Vec<String>,
    pub pp_json_sample: Map<String, JsonValue>,
    pub text_candidates: Vec<JsonValue>,
    pub pp_meta: JsonValue,
    pub trace_stats: BTreeMap<String, usize>,
    pub pp_obj_keys: Vec<String>,
    pub parse_errors: Vec<String>,
}

impl ExtractionTrace {
    fn bump(&mut self, key: &str) {
        *self.trace_stats.entry(key.to_string()).or_default() += 1;
    }

    pub fn to_extras(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// 一页的提取结果
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub anchors: Vec<Anchor>,
    pub objects: Vec<LayoutObject>,
    pub trace: ExtractionTrace,
}

impl Extraction {
    /// 没有锚点时转成 `zero-anchors` 失败，附带诊断信息
    pub fn require_anchors(self) -> Result<Extraction, DetectFailure> {
        if self.anchors.is_empty() {
            return Err(DetectFailure::new(Stage::ZeroAnchors, "anchors=0")
                .with_extras(self.trace.to_extras()));
        }
        Ok(self)
    }
}

/// 通过模式匹配之前的文本记录
struct TextRecord {
    text: String,
    bbox: BBox,
    column: Column,
    bare: bool,
}

struct IdCandidate {
    id: u32,
    bbox: BBox,
    column: Column,
    strict: bool,
}

/// 锚点提取器
pub struct AnchorExtractor {
    tuning: AnchorTuning,
}

impl AnchorExtractor {
    pub fn new(tuning: AnchorTuning) -> Self {
        Self { tuning }
    }

    pub fn extract(&self, detection: &Detection, page_w: i32, page_h: i32) -> Extraction {
        let mut trace = ExtractionTrace {
            pp_meta: detection.meta.clone(),
            ..Default::default()
        };
        for key in ["candidate_texts", "candidate_with_bbox", "regex_pass", "anchors"] {
            trace.trace_stats.insert(key.to_string(), 0);
        }
        for tier in &self.tuning.tiers {
            trace.trace_stats.insert(format!("pass{}", tier.name), 0);
        }

        let reparsed = reparse_res_string(&detection.payload, &mut trace.parse_errors);
        let payload = reparsed.as_ref().unwrap_or(&detection.payload);
        let fields = &detection.fields;

        let layout = layout_blocks(payload, fields);
        let mut records = Vec::new();
        let mut seen = HashSet::new();

        for source in self.text_sources(payload, fields) {
            self.collect_records(source, self.tuning.candidate_cap, page_w, &mut records, &mut seen, &mut trace);
            if records.len() >= self.tuning.candidate_cap {
                break;
            }
        }

        let mut objects = Vec::new();
        for block in layout {
            if !block.is_object() {
                continue;
            }
            let btype = block_type(block);
            let bbox = BLOCK_BBOX_KEYS
                .iter()
                .filter_map(|k| block.get(*k))
                .find_map(poly_to_bbox)
                .or_else(|| poly_to_bbox(block));
            if let Some(bbox) = bbox {
                objects.push(LayoutObject {
                    kind: LayoutKind::classify(&btype),
                    bbox,
                });
            }

            if records.len() >= self.tuning.candidate_cap
                || !TEXT_BLOCK_TYPES.contains(&btype.as_str())
            {
                continue;
            }
            let lines = pick_list_by_keys(block, &LINE_KEYS);
            for line in std::iter::once(block).chain(lines.iter()) {
                self.collect_records(line, self.tuning.block_line_cap, page_w, &mut records, &mut seen, &mut trace);
                if records.len() >= self.tuning.candidate_cap {
                    break;
                }
            }
        }

        trace.text_candidates = records
            .iter()
            .take(self.tuning.sample_cap)
            .map(|r| json!({"text": r.text, "bbox": r.bbox}))
            .collect();

        let candidates = match_ids(&records, &mut trace);
        let anchors = self.apply_tiers(candidates, page_w, page_h, &mut trace);

        trace.trace_stats.insert("anchors".to_string(), anchors.len());
        if let JsonValue::Object(obj) = payload {
            trace.pp_json_keys = obj.keys().cloned().collect();
            trace.pp_json_keys.sort();
            for (k, v) in obj.iter().take(5) {
                let text = match v {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                trace
                    .pp_json_sample
                    .insert(k.clone(), JsonValue::String(truncate_text(&text, 200)));
            }
        }
        if anchors.is_empty() {
            if let JsonValue::Object(obj) = fields {
                let mut keys: Vec<String> = obj.keys().cloned().collect();
                keys.sort();
                keys.truncate(50);
                trace.pp_obj_keys = keys;
            }
        }

        Extraction {
            anchors,
            objects,
            trace,
        }
    }

    /// 文本来源：整页 OCR → 每个解析块的 OCR → 区域/版面检测 → 键名含 token 的子树
    fn text_sources<'a>(&self, payload: &'a JsonValue, fields: &'a JsonValue) -> Vec<&'a JsonValue> {
        let mut set = SourceSet::default();
        set.push(fields.get("overall_ocr_res"));
        if let Some(items) = fields.get("parsing_res_list").and_then(JsonValue::as_array) {
            for item in items {
                set.push(item.get("overall_ocr_res"));
            }
        }
        set.push(fields.get("region_det_res"));
        set.push(fields.get("layout_det_res"));
        set.extend(collect_token_sources(fields));
        if payload.is_object() {
            set.extend(collect_token_sources(payload));
            if let Some(res) = payload.get("res").filter(|r| r.is_object()) {
                set.extend(collect_token_sources(res));
            }
        }
        set.into_vec()
    }

    fn collect_records(
        &self,
        source: &JsonValue,
        cap: usize,
        page_w: i32,
        records: &mut Vec<TextRecord>,
        seen: &mut HashSet<(String, BBox)>,
        trace: &mut ExtractionTrace,
    ) {
        for candidate in extract_text_candidates(source, cap) {
            trace.bump("candidate_texts");
            let Some(bbox) = candidate.bbox else {
                continue;
            };
            trace.bump("candidate_with_bbox");
            if !seen.insert((candidate.text.clone(), bbox)) {
                continue;
            }
            records.push(TextRecord {
                bare: is_bare_number(&candidate.text),
                column: Column::of(&bbox, page_w),
                text: candidate.text,
                bbox,
            });
            if records.len() >= self.tuning.candidate_cap {
                return;
            }
        }
    }

    fn apply_tiers(
        &self,
        candidates: Vec<IdCandidate>,
        page_w: i32,
        page_h: i32,
        trace: &mut ExtractionTrace,
    ) -> Vec<Anchor> {
        let mut chosen = Vec::new();
        for tier in &self.tuning.tiers {
            let passed: Vec<&IdCandidate> = candidates
                .iter()
                .filter(|c| tier.admits(&c.bbox, page_w, page_h))
                .collect();
            trace
                .trace_stats
                .insert(format!("pass{}", tier.name), passed.len());
            if passed.is_empty() {
                continue;
            }
            let strict: Vec<&IdCandidate> = passed.iter().copied().filter(|c| c.strict).collect();
            chosen = if strict.is_empty() { passed } else { strict };
            break;
        }

        let mut seen = HashSet::new();
        let mut anchors: Vec<Anchor> = chosen
            .into_iter()
            .filter(|c| seen.insert((c.id, c.bbox, c.column)))
            .map(|c| Anchor {
                id: c.id,
                bbox: c.bbox,
                column: c.column,
                strictness: if c.strict {
                    Strictness::Strict
                } else {
                    Strictness::Weak
                },
            })
            .collect();
        anchors.sort_by_key(|a| (a.column, a.bbox.y1, a.bbox.x1));
        anchors
    }
}

/// 题号匹配：先只认开头的题号；一个严格匹配都没有时，才放宽到文本任意位置
fn match_ids(records: &[TextRecord], trace: &mut ExtractionTrace) -> Vec<IdCandidate> {
    let mut out = Vec::new();
    let mut matched = HashSet::new();
    for (idx, rec) in records.iter().enumerate() {
        if let Some(id) = parse_item_id(&rec.text, false) {
            trace.bump("regex_pass");
            matched.insert(idx);
            out.push(IdCandidate {
                id,
                bbox: rec.bbox,
                column: rec.column,
                strict: rec.bare,
            });
        }
    }

    if out.iter().any(|c| c.strict) {
        return out;
    }

    for (idx, rec) in records.iter().enumerate() {
        if matched.contains(&idx) {
            continue;
        }
        if let Some(id) = parse_item_id(&rec.text, true) {
            trace.bump("regex_pass");
            out.push(IdCandidate {
                id,
                bbox: rec.bbox,
                column: rec.column,
                strict: false,
            });
        }
    }
    out
}

/// `res` 是字符串时重新解析成对象
fn reparse_res_string(payload: &JsonValue, parse_errors: &mut Vec<String>) -> Option<JsonValue> {
    let raw = payload.get("res")?.as_str()?;
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(parsed @ JsonValue::Object(_)) => {
            let mut copy = payload.clone();
            copy["res"] = parsed;
            Some(copy)
        }
        Ok(_) => {
            parse_errors.push("stage=parse_json res string did not evaluate to dict".to_string());
            None
        }
        Err(e) => {
            parse_errors.push(format!("stage=parse_json res string parse failed err={}", e));
            None
        }
    }
}

/// 版面块列表；顶层没有时退回到常见的嵌套位置
fn layout_blocks<'a>(payload: &'a JsonValue, fields: &'a JsonValue) -> &'a [JsonValue] {
    let direct = pick_list_by_keys(payload, &LAYOUT_KEYS);
    if !direct.is_empty() {
        return direct;
    }
    let res = payload.get("res");
    [
        res.and_then(|r| r.get("parsing_res_list")),
        res.and_then(|r| r.get("layout_det_res"))
            .and_then(|l| l.get("boxes")),
        fields.get("parsing_res_list"),
        fields.get("layout_det_res").and_then(|l| l.get("boxes")),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_array().filter(|a| !a.is_empty()))
    .map(Vec::as_slice)
    .unwrap_or(&[])
}

fn block_type(block: &JsonValue) -> String {
    BLOCK_TYPE_KEYS
        .iter()
        .find_map(|k| block.get(*k))
        .map(|v| match v {
            JsonValue::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        })
        .unwrap_or_else(|| "text".to_string())
}
