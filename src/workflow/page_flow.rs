//! 单页处理流程 - 流程层
//!
//! 核心职责：定义"一页"的完整处理流程
//!
//! 流程顺序：
//! 1. 检测（池化模式由本流程调用；隔离模式由 runner 的输出行传入）
//! 2. 锚点提取；零锚点且为 fast 档时强制开启区域检测重试一次
//! 3. 按栏切片；没有任何区域且有错误即为切片冲突
//! 4. 后处理 → 编号 → 落盘（裁剪、调试叠加图）
//!
//! 任何阶段失败都只影响本页：写失败旁路文件，返回失败结果，不中断批次。
//! 处理过程中的 panic 同样按 `process-page` 失败处理。

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use image::DynamicImage;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Stage;
use crate::infrastructure::{EngineClient, Profile, RegionOverride};
use crate::models::{Crop, DetectFailure, DetectResult, PageOutcome};
use crate::services::{
    debug_overlay, number_crops, AnchorExtractor, Extraction, OutcomeWriter, PostFilter,
    RegionSlicer,
};
use crate::utils::logging::{log_page_outcome, truncate_text};
use crate::workflow::page_ctx::PageCtx;

/// 单页处理流程
///
/// - 编排 提取 → 切片 → 后处理 → 落盘
/// - 决定何时重试、何时写失败旁路
/// - 不持有引擎，检测能力由 `EngineClient` 提供
pub struct PageFlow {
    extractor: AnchorExtractor,
    slicer: RegionSlicer,
    filter: PostFilter,
    writer: OutcomeWriter,
    profile: Profile,
    debug_overlay: bool,
}

/// 成功切完一页后的中间结果
struct Sliced {
    anchors: usize,
    crops: Vec<Crop>,
    errors: usize,
    extraction: Extraction,
}

impl PageFlow {
    /// 创建新的单页流程（每个文档一个）
    pub fn new(config: &Config, writer: OutcomeWriter) -> Self {
        Self {
            extractor: AnchorExtractor::new(config.tuning.anchor.clone()),
            slicer: RegionSlicer::new(config.tuning.slice.clone()),
            filter: PostFilter::new(config.tuning.filter.clone()),
            writer,
            profile: config.profile,
            debug_overlay: config.debug_overlay,
        }
    }

    /// 池化模式：自己调用检测
    pub async fn run(&self, client: &EngineClient, ctx: &PageCtx) -> PageOutcome {
        let detected = client.detect(ctx.image_path(), RegionOverride::Auto).await;
        self.process(ctx, detected, client).await
    }

    /// 处理已经拿到的检测结果；`retry_client` 只用于零锚点重试
    pub async fn process(
        &self,
        ctx: &PageCtx,
        detected: DetectResult,
        retry_client: &EngineClient,
    ) -> PageOutcome {
        self.guarded(ctx, self.try_process(ctx, detected, retry_client))
            .await
    }

    /// 等待一页的处理结果，把错误和 panic 都收敛为失败旁路
    async fn guarded<F>(&self, ctx: &PageCtx, work: F) -> PageOutcome
    where
        F: Future<Output = Result<PageOutcome, DetectFailure>>,
    {
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(failure)) => self.fail(ctx, failure).await,
            Err(panic) => self.fail_unexpected(ctx, panic_message(panic.as_ref())).await,
        }
    }

    /// 非预期的异常（panic、任务中断）按 `process-page` 失败处理
    pub async fn fail_unexpected(&self, ctx: &PageCtx, message: String) -> PageOutcome {
        self.fail(ctx, DetectFailure::new(Stage::ProcessPage, message))
            .await
    }

    async fn try_process(
        &self,
        ctx: &PageCtx,
        detected: DetectResult,
        retry_client: &EngineClient,
    ) -> Result<PageOutcome, DetectFailure> {
        let detection = detected?;
        let page = Arc::new(load_page(ctx.image_path().to_path_buf()).await?);
        let (w, h) = (page.width() as i32, page.height() as i32);

        let extraction = match self.extractor.extract(&detection, w, h).require_anchors() {
            Ok(extraction) => extraction,
            Err(failure) if failure.stage == Stage::ZeroAnchors && self.profile == Profile::Fast => {
                warn!("{} ⚠️ 未找到锚点，开启区域检测重试一次", ctx);
                let retried = retry_client
                    .detect(ctx.image_path(), RegionOverride::On)
                    .await?;
                self.extractor.extract(&retried, w, h).require_anchors()?
            }
            Err(failure) => return Err(failure),
        };

        let sliced = self.slice(extraction, w, h)?;
        let anchors = sliced.anchors;
        let (saved, overlay) = self.write(ctx, page, sliced.crops.clone(), &sliced.extraction).await?;

        let outcome = PageOutcome::success(
            ctx.page_number(),
            saved,
            anchors.saturating_sub(saved),
            sliced.errors,
        )
        .with_overlay(overlay);
        log_page_outcome(anchors, &outcome);
        Ok(outcome)
    }

    fn slice(&self, extraction: Extraction, w: i32, h: i32) -> Result<Sliced, DetectFailure> {
        let slice = self
            .slicer
            .slice(&extraction.anchors, &extraction.objects, w, h);

        if slice.regions.is_empty() && slice.errors > 0 {
            let extras = json!({
                "anchors": extraction.anchors,
                "objects": extraction.objects,
                "errors": slice.errors,
            });
            return Err(DetectFailure::new(
                Stage::SliceConflict,
                format!("slice errors={}", slice.errors),
            )
            .with_extras(extras));
        }

        let filtered = self.filter.apply(slice.regions, w, h);
        Ok(Sliced {
            anchors: extraction.anchors.len(),
            crops: number_crops(&filtered),
            errors: slice.errors,
            extraction,
        })
    }

    /// 裁剪与叠加图落盘，在阻塞线程池里执行
    async fn write(
        &self,
        ctx: &PageCtx,
        page: Arc<DynamicImage>,
        crops: Vec<Crop>,
        extraction: &Extraction,
    ) -> Result<(usize, Option<PathBuf>), DetectFailure> {
        let writer = self.writer.clone();
        let page_number = ctx.page_number();
        let overlay = self
            .debug_overlay
            .then(|| (extraction.anchors.clone(), extraction.objects.clone()));

        tokio::task::spawn_blocking(move || {
            let saved = writer.save_crops(&page, page_number, &crops)?;
            let overlay_path = match overlay {
                Some((anchors, objects)) => Some(debug_overlay::save(
                    writer.crops_dir(),
                    page_number,
                    &page,
                    &anchors,
                    &objects,
                    &crops,
                )?),
                None => None,
            };
            Ok::<_, crate::error::AppError>((saved, overlay_path))
        })
        .await
        .map_err(|e| DetectFailure::new(Stage::ProcessPage, format!("写入任务异常: {}", e)))?
        .map_err(|e| DetectFailure::new(Stage::ProcessPage, e.to_string()))
    }

    /// 写失败旁路文件并返回失败结果
    async fn fail(&self, ctx: &PageCtx, failure: DetectFailure) -> PageOutcome {
        error!(
            "{} ❌ {}: {}",
            ctx,
            failure.stage,
            truncate_text(&failure.message, 200)
        );

        let writer = self.writer.clone();
        let task = ctx.task.clone();
        let stage = failure.stage;
        let written = tokio::task::spawn_blocking(move || {
            writer.write_failure(&task, stage, &failure.message, failure.extras.as_ref())
        })
        .await;
        match written {
            Ok(Ok(path)) => info!("{} 失败旁路已写入: {}", ctx, path.display()),
            Ok(Err(e)) => warn!("{} ⚠️ 写失败旁路失败: {}", ctx, e),
            Err(e) => warn!("{} ⚠️ 写失败旁路任务异常: {}", ctx, e),
        }

        let outcome = PageOutcome::failed(ctx.page_number(), stage);
        log_page_outcome(0, &outcome);
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let text = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知 panic".to_string());
    format!("处理过程 panic: {}", text)
}

async fn load_page(path: PathBuf) -> Result<DynamicImage, DetectFailure> {
    tokio::task::spawn_blocking(move || {
        image::open(&path).map_err(|e| {
            DetectFailure::new(
                Stage::ImageLoadFailed,
                format!("{}: {}", path.display(), e),
            )
        })
    })
    .await
    .map_err(|e| DetectFailure::new(Stage::ProcessPage, format!("解码任务异常: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineFault;
    use crate::infrastructure::{EngineOutput, PredictFlags, StructureEngine};
    use crate::models::PageTask;
    use serde_json::Value as JsonValue;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    /// 依次返回预设结果，并记录收到的开关
    struct ScriptedEngine {
        replies: Mutex<VecDeque<JsonValue>>,
        seen: Mutex<Vec<PredictFlags>>,
    }

    impl ScriptedEngine {
        fn new(replies: Vec<JsonValue>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl StructureEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn predict(&self, _: &Path, flags: &PredictFlags) -> Result<EngineOutput, EngineFault> {
            self.seen.lock().unwrap().push(flags.clone());
            let result = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EngineFault::Predict("no more replies".to_string()))?;
            Ok(EngineOutput {
                result,
                fields: json!({}),
            })
        }
    }

    fn two_anchor_payload() -> JsonValue {
        json!({"res": [
            {"text": "0001", "bbox": [50, 100, 110, 120]},
            {"text": "0002", "bbox": [50, 800, 110, 820]},
        ]})
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        out: PathBuf,
        ctx: PageCtx,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("P001.png");
        image::RgbImage::from_pixel(1000, 1500, image::Rgb([255, 255, 255]))
            .save(&page)
            .unwrap();
        Fixture {
            out: dir.path().join("out"),
            ctx: PageCtx::new("doc", PageTask::new(1, 1, page)),
            _dir: dir,
        }
    }

    fn flow(out: &Path, profile: Profile) -> PageFlow {
        let config = Config {
            profile,
            ..Config::default()
        };
        PageFlow::new(&config, OutcomeWriter::new(out, "doc"))
    }

    #[tokio::test]
    async fn test_two_anchors_produce_two_crops() {
        let fx = fixture();
        let engine = ScriptedEngine::new(vec![two_anchor_payload()]);
        let client = EngineClient::in_process(engine, Profile::Fast, None);

        let outcome = flow(&fx.out, Profile::Fast).run(&client, &fx.ctx).await;
        assert!(!outcome.is_error());
        assert_eq!(outcome.saved, 2);
        assert_eq!(outcome.dropped, 0);

        let crops = fx.out.join("out_crops").join("doc");
        assert!(crops.join("P001_Q001_N0001.png").exists());
        assert!(crops.join("P001_Q002_N0002.png").exists());
        assert_eq!(outcome.overlay_path, Some(crops.join("debug_P001.jpg")));
    }

    #[tokio::test]
    async fn test_zero_anchors_retries_with_region_detection() {
        let fx = fixture();
        let engine = ScriptedEngine::new(vec![json!({"res": {}}), two_anchor_payload()]);
        let client = EngineClient::in_process(engine.clone(), Profile::Fast, None);

        let outcome = flow(&fx.out, Profile::Fast).run(&client, &fx.ctx).await;
        assert_eq!(outcome.saved, 2);

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].get("use_region_detection"), Some(false));
        assert_eq!(seen[1].get("use_region_detection"), Some(true));
    }

    #[tokio::test]
    async fn test_zero_anchors_fails_with_sidecar() {
        let fx = fixture();
        let engine = ScriptedEngine::new(vec![json!({"res": {}}), json!({"res": {}})]);
        let client = EngineClient::in_process(engine, Profile::Fast, None);

        let outcome = flow(&fx.out, Profile::Fast).run(&client, &fx.ctx).await;
        assert!(outcome.is_error());
        assert_eq!(outcome.errors, 1);
        assert_eq!(outcome.failed_stage, Some(Stage::ZeroAnchors));

        let sidecar = fx.out.join("errors").join("doc").join("P001.json");
        let body: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(body["stage"], "zero-anchors");
        assert_eq!(body["trace_stats"]["anchors"], 0);
        assert!(fx.out.join("errors").join("doc").join("P001.png").exists());
    }

    #[tokio::test]
    async fn test_full_profile_does_not_retry() {
        let fx = fixture();
        let engine = ScriptedEngine::new(vec![json!({"res": {}}), two_anchor_payload()]);
        let client = EngineClient::in_process(engine.clone(), Profile::Full, None);

        let outcome = flow(&fx.out, Profile::Full).run(&client, &fx.ctx).await;
        assert_eq!(outcome.failed_stage, Some(Stage::ZeroAnchors));
        assert_eq!(engine.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detect_failure_is_page_local() {
        let fx = fixture();
        let engine = ScriptedEngine::new(vec![]);
        let client = EngineClient::in_process(engine, Profile::Fast, None);

        let outcome = flow(&fx.out, Profile::Fast).run(&client, &fx.ctx).await;
        assert_eq!(outcome.failed_stage, Some(Stage::PredictFailed));
    }

    #[tokio::test]
    async fn test_skipped_anchor_counts_as_error() {
        let fx = fixture();
        // 第一个锚点到下一个锚点不足一个边距，被跳过
        let payload = json!({"res": [
            {"text": "0001", "bbox": [50, 100, 110, 120]},
            {"text": "0002", "bbox": [50, 105, 110, 125]},
        ]});
        let engine = ScriptedEngine::new(vec![payload]);
        let client = EngineClient::in_process(engine, Profile::Fast, None);

        let outcome = flow(&fx.out, Profile::Fast).run(&client, &fx.ctx).await;
        assert!(!outcome.is_error());
        assert_eq!(outcome.errors, 1);
        assert_eq!(outcome.saved, 1);
        assert_eq!(outcome.dropped, 1);
    }

    #[tokio::test]
    async fn test_slice_conflict_fails_page() {
        let fx = fixture();
        // 图中心落在第二个区域，把它的上边拉到 150，与第一个区域重叠 335 > 225
        let payload = json!({"layout": [
            {"type": "figure", "bbox": [50, 150, 300, 1300]},
            {"type": "text", "bbox": [40, 90, 120, 130],
             "lines": [{"text": "0001", "bbox": [50, 100, 110, 120]}]},
            {"type": "text", "bbox": [40, 490, 120, 530],
             "lines": [{"text": "0002", "bbox": [50, 500, 110, 520]}]},
        ]});
        let engine = ScriptedEngine::new(vec![payload]);
        let client = EngineClient::in_process(engine, Profile::Fast, None);

        let outcome = flow(&fx.out, Profile::Fast).run(&client, &fx.ctx).await;
        assert_eq!(outcome.failed_stage, Some(Stage::SliceConflict));

        let sidecar = fx.out.join("errors").join("doc").join("P001.json");
        let body: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(body["errors"], 1);
        assert_eq!(body["anchors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panic_during_processing_writes_sidecar() {
        let fx = fixture();
        let flow = flow(&fx.out, Profile::Fast);

        let outcome = flow
            .guarded(&fx.ctx, async {
                let widths: Vec<i32> = Vec::new();
                Ok(PageOutcome::success(1, widths[3] as usize, 0, 0))
            })
            .await;
        assert_eq!(outcome.failed_stage, Some(Stage::ProcessPage));

        let sidecar = fx.out.join("errors").join("doc").join("P001.json");
        let body: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(body["stage"], "process-page");
        assert!(body["raw"].as_str().unwrap().contains("panic"));
    }

    #[tokio::test]
    async fn test_huge_coordinates_do_not_abort_page() {
        let fx = fixture();
        let payload = json!({"res": [
            {"text": "0001", "bbox": [-3.0e9, 100, 3.0e9, 140]},
            {"text": "0002", "bbox": [50, 800, 110, 820]},
        ]});
        let engine = ScriptedEngine::new(vec![payload]);
        let client = EngineClient::in_process(engine, Profile::Full, None);

        let outcome = flow(&fx.out, Profile::Full).run(&client, &fx.ctx).await;
        assert!(!outcome.is_error());
        assert_eq!(outcome.saved, 1);
    }
}
