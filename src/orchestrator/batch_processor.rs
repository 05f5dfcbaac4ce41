//! 批量文档处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量文档的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：写日志文件头、输出启动信息
//! 2. **批量加载**：扫描并加载所有待处理的文档（`Vec<Document>`）
//! 3. **模式选择**：隔离模式每个文档一个 runner 子进程；池化模式共享引擎
//! 4. **取消**：文档之间检查取消令牌
//! 5. **全局统计**：汇总所有文档的处理结果
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单页的细节
//! - **向下委托**：委托 `document_processor` / `isolation_batch` 处理单个文档

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{DirectoryPageSource, Document, DocumentReport, PageSource};
use crate::orchestrator::document_processor;
use crate::orchestrator::isolation_batch::IsolationBatch;
use crate::services::OutcomeWriter;
use crate::utils::logging::{
    init_log_file, log_document_complete, log_document_start, log_documents_loaded, log_startup,
    print_final_stats,
};
use crate::utils::CancelToken;
use crate::workflow::PageFlow;

/// 应用主结构
pub struct App {
    config: Config,
    cancel: CancelToken,
}

/// 处理统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessingStats {
    pub documents: usize,
    pub total_pages: usize,
    pub done_pages: usize,
    pub failed_pages: usize,
    pub saved: usize,
}

impl ProcessingStats {
    fn add(&mut self, total_pages: usize, report: &DocumentReport) {
        self.documents += 1;
        self.total_pages += total_pages;
        self.done_pages += report.done_pages();
        self.failed_pages += report.failed_pages();
        self.saved += report.saved();
    }
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config, cancel: CancelToken) -> Result<Self> {
        // 初始化日志文件
        init_log_file(&config.output_log_file)
            .with_context(|| format!("无法写入日志文件: {}", config.output_log_file))?;

        let mode = if config.isolation {
            "隔离模式（每个文档一个 runner 子进程）"
        } else {
            "池化模式（共享引擎）"
        };
        log_startup(mode, config.worker_count());

        Ok(Self { config, cancel })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<ProcessingStats> {
        // 加载所有待处理的文档
        let documents = self.load_documents().await?;

        if documents.is_empty() {
            warn!("⚠️ 没有找到待处理的页面图片，程序结束");
            return Ok(ProcessingStats::default());
        }
        log_documents_loaded(&documents);

        // 处理所有文档
        let stats = self.process_all_documents(&documents).await?;

        // 输出最终统计
        print_final_stats(
            stats.saved,
            stats.failed_pages,
            stats.total_pages,
            &self.config.output_log_file,
        );

        Ok(stats)
    }

    /// 加载文档
    async fn load_documents(&self) -> Result<Vec<Document>> {
        info!("\n📁 正在扫描待处理的文档...");
        DirectoryPageSource::new(&self.config.input_root)
            .load_documents()
            .await
    }

    /// 逐个处理文档
    async fn process_all_documents(&self, documents: &[Document]) -> Result<ProcessingStats> {
        let mut stats = ProcessingStats::default();
        let total = documents.len();

        for (idx, document) in documents.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("⚠️ 已取消，跳过剩余 {} 个文档", total - idx);
                break;
            }
            log_document_start(idx + 1, total, document);

            let report = self.process_document(document).await?;
            log_document_complete(
                &document.name,
                report.saved(),
                report.failed_pages(),
                report.done_pages(),
                document.tasks.len(),
            );
            if let Some(reason) = &report.batch_failure {
                warn!("[{}] ⚠️ 批次失败: {}", document.name, reason);
            }
            stats.add(document.tasks.len(), &report);
        }

        Ok(stats)
    }

    /// 按配置的模式处理单个文档
    async fn process_document(&self, document: &Document) -> Result<DocumentReport> {
        if !self.config.isolation {
            return document_processor::process_document(&self.config, document, &self.cancel)
                .await;
        }

        let flow = PageFlow::new(
            &self.config,
            OutcomeWriter::new(&self.config.output_root, &document.name),
        );
        let batch = IsolationBatch::new(
            self.config.runner(),
            self.config.profile,
            self.config.warmup,
            self.config.batch_deadline(),
        );
        Ok(batch.process_document(document, &flow, &self.cancel).await)
    }
}
