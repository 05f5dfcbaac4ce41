//! 单个文档处理器（池化模式）- 编排层
//!
//! ## 职责
//!
//! 一个文档共享一个已预热的引擎，N 个 worker 流水线处理页任务：
//! 最多 N 页在途，一页完成立刻补下一页。
//!
//! ## 核心功能
//!
//! 1. **构建引擎**：失败时整份文档所有页记为 `engine-unavailable`
//! 2. **预热**：可选，失败只告警
//! 3. **并发控制**：Semaphore 限制在途页数，每次提交前检查取消令牌；
//!    单页引擎调用受 `page_timeout_secs` 约束
//! 4. **结果汇总**：按页码收集 `PageOutcome`，取消后未提交的页记为 `batch-fatal`

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Stage;
use crate::infrastructure::EngineClient;
use crate::models::{Document, DocumentReport};
use crate::services::OutcomeWriter;
use crate::utils::CancelToken;
use crate::workflow::{PageCtx, PageFlow};

/// 池化模式处理一个文档
pub async fn process_document(
    config: &Config,
    document: &Document,
    cancel: &CancelToken,
) -> Result<DocumentReport> {
    let flow = Arc::new(PageFlow::new(
        config,
        OutcomeWriter::new(&config.output_root, &document.name),
    ));

    let spec = config.engine_spec();
    let built = tokio::task::spawn_blocking(move || spec.build())
        .await
        .context("引擎构建任务异常")?;
    let engine = match built {
        Ok(engine) => engine,
        Err(fault) => {
            error!("[{}] ❌ 引擎不可用: {}", document.name, fault);
            let mut report = DocumentReport {
                batch_failure: Some(fault.to_string()),
                ..Default::default()
            };
            report.fail_remaining(&document.tasks, Stage::EngineUnavailable);
            return Ok(report);
        }
    };

    let client = EngineClient::in_process(engine, config.profile, Some(config.runner()))
        .with_timeout(config.page_timeout());
    if config.warmup {
        match client.warm_up().await {
            Ok(()) => info!("[{}] ✓ 引擎预热完成", document.name),
            Err(e) => warn!("[{}] ⚠️ 引擎预热失败，继续处理: {}", document.name, e),
        }
    }

    run_pages(config.worker_count(), &client, flow, document, cancel).await
}

/// 以最多 `workers` 页在途的方式处理文档的所有页
pub async fn run_pages(
    workers: usize,
    client: &EngineClient,
    flow: Arc<PageFlow>,
    document: &Document,
    cancel: &CancelToken,
) -> Result<DocumentReport> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(document.tasks.len());

    for task in &document.tasks {
        let permit = semaphore.clone().acquire_owned().await?;
        if cancel.is_cancelled() {
            warn!("[{}] ⚠️ 已取消，停止提交新页", document.name);
            break;
        }

        let ctx = PageCtx::new(document.name.clone(), task.clone());
        let client = client.clone();
        let page_flow = flow.clone();
        let page_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            page_flow.run(&client, &page_ctx).await
        });
        handles.push((ctx, handle));
    }

    let finished = join_all(
        handles
            .into_iter()
            .map(|(ctx, handle)| async move { (ctx, handle.await) }),
    )
    .await;

    let mut report = DocumentReport::default();
    for (ctx, joined) in finished {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} 任务执行失败: {}", ctx, e);
                flow.fail_unexpected(&ctx, format!("页任务异常: {}", e))
                    .await
            }
        };
        report.record(outcome);
    }

    if cancel.is_cancelled() {
        let skipped = report.fail_remaining(&document.tasks, Stage::BatchFatal);
        if skipped > 0 {
            warn!("[{}] ⚠️ 取消时还有 {} 页未处理", document.name, skipped);
        }
        report.batch_failure = Some("cancelled".to_string());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineFault;
    use crate::infrastructure::{EngineKind, EngineOutput, PredictFlags, Profile, StructureEngine};
    use crate::models::loaders::build_tasks;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 记录最大并发调用数
    struct SlowEngine {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StructureEngine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }

        fn predict(&self, _: &Path, _: &PredictFlags) -> Result<EngineOutput, EngineFault> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(EngineOutput {
                result: json!({"res": {}}),
                fields: json!({}),
            })
        }
    }

    fn document(dir: &Path, pages: u32) -> Document {
        let files: Vec<PathBuf> = (1..=pages)
            .map(|n| {
                let path = dir.join(format!("P{:03}.png", n));
                image::RgbImage::new(40, 60).save(&path).unwrap();
                path
            })
            .collect();
        Document {
            name: "doc".to_string(),
            pages_dir: dir.to_path_buf(),
            tasks: build_tasks(&files),
        }
    }

    fn config(out: &Path) -> Config {
        Config {
            output_root: out.to_path_buf(),
            profile: Profile::Full,
            debug_overlay: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_in_flight_pages() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(dir.path(), 6);
        let cfg = config(&dir.path().join("out"));
        let engine = Arc::new(SlowEngine {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let client = EngineClient::in_process(engine.clone(), Profile::Full, None);
        let flow = Arc::new(PageFlow::new(&cfg, OutcomeWriter::new(&cfg.output_root, "doc")));

        let report = run_pages(2, &client, flow, &doc, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.done_pages(), 6);
        // 空结果：每页都是零锚点失败
        assert_eq!(report.failed_pages(), 6);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_fails_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(dir.path(), 3);
        let cfg = config(&dir.path().join("out"));
        let engine = Arc::new(SlowEngine {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let client = EngineClient::in_process(engine.clone(), Profile::Full, None);
        let flow = Arc::new(PageFlow::new(&cfg, OutcomeWriter::new(&cfg.output_root, "doc")));

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = run_pages(2, &client, flow, &doc, &cancel).await.unwrap();
        assert_eq!(engine.peak.load(Ordering::SeqCst), 0);
        assert_eq!(report.done_pages(), 3);
        assert_eq!(report.failed_pages(), 3);
        assert!(report
            .outcomes
            .values()
            .all(|o| o.failed_stage == Some(Stage::BatchFatal)));
        assert_eq!(report.batch_failure.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_engine_build_failure_fails_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(dir.path(), 3);
        let cfg = Config {
            engine: EngineKind::Command,
            engine_command: None,
            ..config(&dir.path().join("out"))
        };

        let report = process_document(&cfg, &doc, &CancelToken::new()).await.unwrap();
        assert_eq!(report.failed_pages(), 3);
        assert!(report
            .outcomes
            .values()
            .all(|o| o.failed_stage == Some(Stage::EngineUnavailable)));
        assert!(report.batch_failure.is_some());
    }
}
