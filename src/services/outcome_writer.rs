//! 结果落盘服务 - 业务能力层
//!
//! 只负责"写裁剪图和失败旁路文件"能力，是唯一接触持久化存储的组件。
//! 所有文件名都带页码前缀，多个 worker 同时写同一文档不会互相覆盖。

use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, Stage};
use crate::models::{Crop, PageTask};

/// 旁路文件里 `raw` 字段的最大字符数
pub const RAW_LIMIT: usize = 10_000;

/// 结果落盘服务
///
/// 职责：
/// - 把裁剪框从页面图里切出来，保存到 `out_crops/<doc>/`
/// - 把失败页的原图和诊断 JSON 写到 `errors/<doc>/`
/// - 不关心检测与切片流程
#[derive(Debug, Clone)]
pub struct OutcomeWriter {
    crops_dir: PathBuf,
    errors_dir: PathBuf,
}

impl OutcomeWriter {
    /// 按输出根目录和文档名创建
    pub fn new(output_root: &Path, doc_name: &str) -> Self {
        Self {
            crops_dir: output_root.join("out_crops").join(doc_name),
            errors_dir: output_root.join("errors").join(doc_name),
        }
    }

    pub fn crops_dir(&self) -> &Path {
        &self.crops_dir
    }

    pub fn errors_dir(&self) -> &Path {
        &self.errors_dir
    }

    /// 保存一页的所有裁剪，返回保存数量
    ///
    /// 裁剪框会再夹一次到图片范围内；夹完为空的框跳过。
    pub fn save_crops(
        &self,
        page: &DynamicImage,
        page_number: u32,
        crops: &[Crop],
    ) -> AppResult<usize> {
        if crops.is_empty() {
            return Ok(0);
        }
        ensure_dir(&self.crops_dir)?;

        let (img_w, img_h) = (page.width() as i32, page.height() as i32);
        let mut saved = 0;
        for crop in crops {
            let x1 = crop.bbox.x1.clamp(0, img_w);
            let y1 = crop.bbox.y1.clamp(0, img_h);
            let x2 = crop.bbox.x2.clamp(0, img_w);
            let y2 = crop.bbox.y2.clamp(0, img_h);
            if x2 <= x1 || y2 <= y1 {
                warn!("[P{:03}] ⚠️ 裁剪框越界，跳过: {}", page_number, crop.bbox);
                continue;
            }

            let piece = page.crop_imm(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32);
            let path = self.crops_dir.join(crop.file_name(page_number));
            piece.save(&path)?;
            debug!("保存裁剪: {}", path.display());
            saved += 1;
        }
        Ok(saved)
    }

    /// 写失败旁路文件：原页图副本 + `P###.json`
    ///
    /// `extras` 为对象时展开到顶层，否则放在 `extras` 字段下。
    pub fn write_failure(
        &self,
        task: &PageTask,
        stage: Stage,
        raw: &str,
        extras: Option<&JsonValue>,
    ) -> AppResult<PathBuf> {
        ensure_dir(&self.errors_dir)?;
        let label = task.label();

        let image_copy = self.errors_dir.join(format!("{}.png", label));
        if let Err(e) = fs::copy(&task.image_path, &image_copy) {
            warn!("[{}] ⚠️ 复制失败页图片失败: {}", label, e);
        }

        let mut body = Map::new();
        body.insert("page".to_string(), json!(task.page_number));
        body.insert("stage".to_string(), json!(stage.as_str()));
        body.insert("raw".to_string(), json!(truncate_raw(raw)));
        body.insert("timestamp".to_string(), json!(unix_seconds()));
        match extras {
            Some(JsonValue::Object(map)) => {
                for (k, v) in map {
                    body.insert(k.clone(), v.clone());
                }
            }
            Some(other) => {
                body.insert("extras".to_string(), other.clone());
            }
            None => {}
        }

        let path = self.errors_dir.join(format!("{}.json", label));
        let text = serde_json::to_string_pretty(&JsonValue::Object(body))?;
        fs::write(&path, text).map_err(|e| AppError::file_write_failed(&path, e))?;
        debug!("写入失败旁路: {}", path.display());
        Ok(path)
    }
}

fn ensure_dir(dir: &Path) -> AppResult<()> {
    fs::create_dir_all(dir).map_err(|e| AppError::file_write_failed(dir, e))
}

/// 截断到 [`RAW_LIMIT`] 个字符，不追加省略号
fn truncate_raw(raw: &str) -> String {
    if raw.chars().count() > RAW_LIMIT {
        raw.chars().take(RAW_LIMIT).collect()
    } else {
        raw.to_string()
    }
}

fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
