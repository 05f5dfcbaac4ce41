//! 结构识别引擎的抽象
//!
//! 引擎本身是黑盒，这里只约定它的输入输出：
//! 一张页面图片 + 一组开关 → 一棵松散的 JSON 树。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use phf::phf_map;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::EngineFault;
use crate::models::Detection;
use crate::infrastructure::command_engine::CommandEngine;
use crate::infrastructure::fixture_engine::FixtureEngine;

/// 引擎对象上会被挑出来的字段（`pp_obj`）
pub const ENGINE_OBJECT_FIELDS: [&str; 5] = [
    "overall_ocr_res",
    "parsing_res_list",
    "region_det_res",
    "layout_det_res",
    "table_res_list",
];

/// 出现在错误文本中即表示原生运行时不兼容
static RUNTIME_INCOMPATIBLE_MARKERS: phf::Map<&'static str, &'static str> = phf_map! {
    "ConvertPirAttribute2RuntimeAttribute" => "pir attribute conversion",
    "onednn_instruction" => "onednn instruction",
    "(Unimplemented)" => "unimplemented kernel",
};

/// 按错误文本归类引擎异常
pub fn classify_predict_error(message: &str) -> EngineFault {
    if let Some((_, reason)) = RUNTIME_INCOMPATIBLE_MARKERS
        .entries()
        .find(|(marker, _)| message.contains(**marker))
    {
        tracing::debug!("识别到运行时不兼容: {}", reason);
        return EngineFault::RuntimeIncompatible(message.to_string());
    }
    EngineFault::Predict(message.to_string())
}

/// 引擎配置档位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// 关闭所有可选子功能
    #[default]
    Fast,
    /// 引擎默认行为
    Full,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Fast => "fast",
            Profile::Full => "full",
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Profile::Fast),
            "full" => Ok(Profile::Full),
            other => Err(format!("未知的 profile: {}", other)),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 区域检测开关的覆盖值，命令行上写作 -1/0/1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegionOverride {
    /// 跟随 profile
    #[default]
    Auto,
    Off,
    On,
}

impl RegionOverride {
    pub fn from_flag(value: i32) -> Self {
        match value {
            0 => RegionOverride::Off,
            1 => RegionOverride::On,
            _ => RegionOverride::Auto,
        }
    }

    pub fn as_flag(self) -> i32 {
        match self {
            RegionOverride::Auto => -1,
            RegionOverride::Off => 0,
            RegionOverride::On => 1,
        }
    }
}

/// 传给引擎的预测开关
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictFlags(pub BTreeMap<String, bool>);

impl PredictFlags {
    const FAST_DISABLED: [&'static str; 10] = [
        "use_table_recognition",
        "use_formula_recognition",
        "use_chart_recognition",
        "use_region_detection",
        "use_doc_orientation_classify",
        "use_doc_unwarping",
        "use_textline_orientation",
        "use_seal_recognition",
        "visualize",
        "format_block_content",
    ];

    pub fn for_profile(profile: Profile, region: RegionOverride) -> Self {
        let mut flags = BTreeMap::new();
        if profile == Profile::Fast {
            for key in Self::FAST_DISABLED {
                flags.insert(key.to_string(), false);
            }
        }
        match region {
            RegionOverride::Auto => {}
            RegionOverride::Off => {
                flags.insert("use_region_detection".to_string(), false);
            }
            RegionOverride::On => {
                flags.insert("use_region_detection".to_string(), true);
            }
        }
        Self(flags)
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.0.get(key).copied()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::Bool(*v)))
                .collect(),
        )
    }
}

/// 引擎的一次预测输出
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// 结果的 JSON 视图
    pub result: JsonValue,
    /// 结果对象上的原始字段
    pub fields: JsonValue,
}

impl EngineOutput {
    /// 只保留 `ENGINE_OBJECT_FIELDS` 中列出的字段
    pub fn selected_fields(&self) -> JsonValue {
        let mut out = Map::new();
        if let JsonValue::Object(fields) = &self.fields {
            for key in ENGINE_OBJECT_FIELDS {
                if let Some(v) = fields.get(key) {
                    out.insert(key.to_string(), v.clone());
                }
            }
        }
        JsonValue::Object(out)
    }
}

/// 结构识别引擎
pub trait StructureEngine: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, image: &Path, flags: &PredictFlags) -> Result<EngineOutput, EngineFault>;

    /// 首次预测前的空跑，默认什么也不做
    fn warm_up(&self, _flags: &PredictFlags) -> Result<(), EngineFault> {
        Ok(())
    }

    /// 调用方放弃等待时终止引擎；之后的预测应立即失败
    fn abort(&self) {}
}

/// 单页检测：解码图片、调用引擎、取出 JSON 视图
///
/// runner 子进程与进程内模式共用这一步。
pub fn run_detection(
    engine: &dyn StructureEngine,
    image: &Path,
    flags: &PredictFlags,
    profile: Profile,
) -> Result<Detection, EngineFault> {
    image::open(image)
        .map_err(|e| EngineFault::ImageLoad(format!("{}: {}", image.display(), e)))?;

    let started = Instant::now();
    let output = engine.predict(image, flags)?;
    let t_predict_ms = started.elapsed().as_secs_f64() * 1000.0;

    if !output.result.is_object() {
        return Err(EngineFault::PayloadShape(
            "引擎结果不是 JSON 对象".to_string(),
        ));
    }

    let fields = output.selected_fields();
    let meta = serde_json::json!({
        "profile": profile.as_str(),
        "flags": flags.to_json(),
        "t_predict_ms": t_predict_ms,
    });
    Ok(Detection {
        payload: output.result,
        fields,
        meta,
    })
}

/// 引擎适配器类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// 回放预存的结果
    Fixture,
    /// 外部引擎程序，按行交换 JSON
    #[default]
    Command,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Fixture => "fixture",
            EngineKind::Command => "command",
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixture" => Ok(EngineKind::Fixture),
            "command" => Ok(EngineKind::Command),
            other => Err(format!("未知的引擎类型: {}", other)),
        }
    }
}

/// 构建引擎所需的全部信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSpec {
    pub kind: EngineKind,
    /// 外部引擎命令行（`Command` 使用）
    pub command: Option<String>,
    /// 预存结果目录，缺省为图片所在目录（`Fixture` 使用）
    pub fixture_dir: Option<PathBuf>,
}

impl EngineSpec {
    pub fn build(&self) -> Result<Arc<dyn StructureEngine>, EngineFault> {
        match self.kind {
            EngineKind::Fixture => Ok(Arc::new(FixtureEngine::new(self.fixture_dir.clone()))),
            EngineKind::Command => {
                let command = self
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| EngineFault::Unavailable("未配置引擎命令".to_string()))?;
                Ok(Arc::new(CommandEngine::spawn(command)?))
            }
        }
    }

    /// 转成 runner 命令行参数
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--engine".to_string(), self.kind.as_str().to_string()];
        if let Some(cmd) = &self.command {
            args.push("--engine-cmd".to_string());
            args.push(cmd.clone());
        }
        if let Some(dir) = &self.fixture_dir {
            args.push("--fixture-dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fast_profile_disables_optional_features() {
        let flags = PredictFlags::for_profile(Profile::Fast, RegionOverride::Auto);
        assert_eq!(flags.0.len(), 10);
        assert_eq!(flags.get("use_table_recognition"), Some(false));
        assert_eq!(flags.get("use_region_detection"), Some(false));
    }

    #[test]
    fn test_full_profile_sends_no_flags_unless_forced() {
        assert!(PredictFlags::for_profile(Profile::Full, RegionOverride::Auto)
            .0
            .is_empty());

        let forced = PredictFlags::for_profile(Profile::Fast, RegionOverride::On);
        assert_eq!(forced.get("use_region_detection"), Some(true));
        assert_eq!(forced.get("visualize"), Some(false));
    }

    #[test]
    fn test_region_override_flag_values() {
        assert_eq!(RegionOverride::from_flag(-1), RegionOverride::Auto);
        assert_eq!(RegionOverride::from_flag(0), RegionOverride::Off);
        assert_eq!(RegionOverride::from_flag(1), RegionOverride::On);
        assert_eq!(RegionOverride::On.as_flag(), 1);
    }

    #[test]
    fn test_classify_runtime_incompatibility() {
        assert!(matches!(
            classify_predict_error("error: (Unimplemented) kernel not found"),
            EngineFault::RuntimeIncompatible(_)
        ));
        assert!(matches!(
            classify_predict_error("out of memory"),
            EngineFault::Predict(_)
        ));
    }

    #[test]
    fn test_selected_fields_filters_unknown_keys() {
        let output = EngineOutput {
            result: json!({}),
            fields: json!({"overall_ocr_res": {"rec_texts": []}, "img": "big"}),
        };
        let selected = output.selected_fields();
        assert!(selected.get("overall_ocr_res").is_some());
        assert!(selected.get("img").is_none());
    }

    #[test]
    fn test_command_spec_without_command_is_unavailable() {
        let spec = EngineSpec::default();
        assert!(matches!(spec.build(), Err(EngineFault::Unavailable(_))));
    }

    struct EchoEngine(JsonValue);

    impl StructureEngine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }

        fn predict(&self, _: &Path, _: &PredictFlags) -> Result<EngineOutput, EngineFault> {
            Ok(EngineOutput {
                result: self.0.clone(),
                fields: json!({"layout_det_res": {"boxes": []}, "extra": 1}),
            })
        }
    }

    #[test]
    fn test_run_detection_decodes_then_predicts() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("P001.png");
        image::RgbImage::new(8, 8).save(&page).unwrap();

        let engine = EchoEngine(json!({"res": {}}));
        let flags = PredictFlags::for_profile(Profile::Fast, RegionOverride::Auto);
        let detection = run_detection(&engine, &page, &flags, Profile::Fast).unwrap();
        assert_eq!(detection.meta["profile"], "fast");
        assert!(detection.fields.get("extra").is_none());

        let broken = dir.path().join("P002.png");
        std::fs::write(&broken, b"not a png").unwrap();
        assert!(matches!(
            run_detection(&engine, &broken, &flags, Profile::Fast),
            Err(EngineFault::ImageLoad(_))
        ));

        let scalar = EchoEngine(json!("text"));
        assert!(matches!(
            run_detection(&scalar, &page, &flags, Profile::Fast),
            Err(EngineFault::PayloadShape(_))
        ));
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("FULL".parse::<Profile>().unwrap(), Profile::Full);
        assert!("turbo".parse::<Profile>().is_err());
    }
}
