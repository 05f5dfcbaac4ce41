//! 引擎检测结果与 runner 的 stdout 行协议

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{EngineFault, Stage};

/// 引擎成功返回的结构化结果
///
/// 结构由引擎版本决定，这里只当作不可信的 JSON 树持有，
/// 用完即丢，不跨页保留。
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// 引擎的 JSON 结果（协议字段 `pp_json`）
    pub payload: JsonValue,
    /// 从引擎结果对象上挑出的字段（协议字段 `pp_obj`）
    pub fields: JsonValue,
    /// 计时与 profile 等信息（协议字段 `pp_meta`）
    pub meta: JsonValue,
}

/// 检测失败：阶段 + 消息，可附带诊断信息
#[derive(Debug, Clone, PartialEq)]
pub struct DetectFailure {
    pub stage: Stage,
    pub message: String,
    pub extras: Option<JsonValue>,
}

impl DetectFailure {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            extras: None,
        }
    }

    pub fn with_extras(mut self, extras: JsonValue) -> Self {
        self.extras = Some(extras);
        self
    }
}

impl From<EngineFault> for DetectFailure {
    fn from(fault: EngineFault) -> Self {
        DetectFailure::new(fault.stage(), fault.message())
    }
}

pub type DetectResult = Result<Detection, DetectFailure>;

/// runner 写到 stdout 的一行
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerLine {
    pub ok: bool,
    #[serde(default)]
    pub page_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp_json: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp_obj: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pp_meta: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_init_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_predict_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_page_total_ms: Option<f64>,
}

/// 旧版 runner 用来表示批次级失败的占位文件名
pub const BATCH_PAGE_FILE: &str = "__BATCH__";

impl RunnerLine {
    pub fn success(page_file: impl Into<String>, detection: Detection) -> Self {
        Self {
            ok: true,
            page_file: page_file.into(),
            pp_json: Some(detection.payload),
            pp_obj: Some(detection.fields),
            pp_meta: Some(detection.meta),
            ..Default::default()
        }
    }

    pub fn failure(page_file: impl Into<String>, stage: Stage, err: impl Into<String>) -> Self {
        Self {
            ok: false,
            page_file: page_file.into(),
            stage: Some(stage.as_str().to_string()),
            err: Some(err.into()),
            ..Default::default()
        }
    }

    /// 不属于任何页面的失败行：子进程整体不可用
    pub fn is_batch_fatal(&self) -> bool {
        !self.ok && (self.page_file.is_empty() || self.page_file == BATCH_PAGE_FILE)
    }

    pub fn stage(&self) -> Stage {
        self.stage
            .as_deref()
            .map(Stage::from_wire)
            .unwrap_or(Stage::ProcessPage)
    }

    /// 转成检测结果；成功行缺少对象型 `pp_json` 视为结构无效
    pub fn into_detect_result(self) -> DetectResult {
        if !self.ok {
            let stage = self.stage();
            let message = self.err.clone().unwrap_or_else(|| "runner page failed".to_string());
            let extras = serde_json::to_value(&self).ok().map(|v| {
                let mut m = Map::new();
                m.insert("runner_payload".to_string(), v);
                JsonValue::Object(m)
            });
            let failure = DetectFailure::new(stage, message);
            return Err(match extras {
                Some(e) => failure.with_extras(e),
                None => failure,
            });
        }
        match self.pp_json {
            Some(payload @ JsonValue::Object(_)) => Ok(Detection {
                payload,
                fields: self.pp_obj.unwrap_or_else(|| JsonValue::Object(Map::new())),
                meta: self.pp_meta.unwrap_or_else(|| JsonValue::Object(Map::new())),
            }),
            _ => Err(DetectFailure::new(
                Stage::PayloadShapeInvalid,
                "invalid json payload",
            )),
        }
    }
}
