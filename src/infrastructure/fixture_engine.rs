use std::path::{Path, PathBuf};

use serde_json::{Map, Value as JsonValue};

use crate::error::EngineFault;
use crate::infrastructure::engine::{EngineOutput, PredictFlags, StructureEngine};

/// 回放预存结果的引擎
///
/// 对 `P003.png` 读取 `P003.json`。文件可以是 `{"pp_json": .., "pp_obj": ..}`，
/// 也可以直接是结果本身。
pub struct FixtureEngine {
    dir: Option<PathBuf>,
}

impl FixtureEngine {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn fixture_path(&self, image: &Path) -> Result<PathBuf, EngineFault> {
        let stem = image
            .file_stem()
            .ok_or_else(|| EngineFault::ImageLoad(format!("无效的图片路径: {}", image.display())))?;
        let dir = match &self.dir {
            Some(d) => d.clone(),
            None => image.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        Ok(dir.join(format!("{}.json", stem.to_string_lossy())))
    }
}

impl StructureEngine for FixtureEngine {
    fn name(&self) -> &str {
        "fixture"
    }

    fn predict(&self, image: &Path, _flags: &PredictFlags) -> Result<EngineOutput, EngineFault> {
        let path = self.fixture_path(image)?;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| EngineFault::Predict(format!("读取预存结果失败 {}: {}", path.display(), e)))?;
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| EngineFault::PayloadShape(format!("{}: {}", path.display(), e)))?;

        match value {
            JsonValue::Object(mut obj) if obj.contains_key("pp_json") => {
                let result = obj.remove("pp_json").unwrap_or(JsonValue::Null);
                let fields = obj
                    .remove("pp_obj")
                    .unwrap_or_else(|| JsonValue::Object(Map::new()));
                Ok(EngineOutput { result, fields })
            }
            other => Ok(EngineOutput {
                result: other,
                fields: JsonValue::Object(Map::new()),
            }),
        }
    }
}
