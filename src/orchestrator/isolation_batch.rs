//! 隔离批处理 - 编排层
//!
//! ## 职责
//!
//! 每个文档启动一个 `page-runner` 子进程，逐行消费它的 stdout。
//!
//! ## 要点
//!
//! - stdout / stderr 各由独立任务读取，避免管道写满互相卡死
//! - 单调时钟截止时间到了就杀子进程，记为与具体页面无关的批次失败
//! - 每行通过 `page_file` 找回对应的页任务；未知文件名只记日志
//! - 不带 `page_file` 的失败行是批次级失败：杀子进程，剩余页全部记失败
//! - 同一时刻只处理一页（按 runner 的输出顺序）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RunnerError, Stage};
use crate::infrastructure::{EngineClient, Profile, RegionOverride, RunnerCommand};
use crate::models::{Document, DocumentReport, PageTask, RunnerLine};
use crate::utils::logging::truncate_text;
use crate::utils::CancelToken;
use crate::workflow::{PageCtx, PageFlow};

/// 隔离批处理器
pub struct IsolationBatch {
    runner: RunnerCommand,
    profile: Profile,
    warmup: bool,
    deadline: Duration,
}

/// 读循环为什么结束
enum Stop {
    /// stdout 关闭
    Eof,
    Deadline,
    Cancelled,
    /// runner 报告了批次级失败
    Fatal(String),
}

impl IsolationBatch {
    pub fn new(runner: RunnerCommand, profile: Profile, warmup: bool, deadline: Duration) -> Self {
        Self {
            runner,
            profile,
            warmup,
            deadline,
        }
    }

    /// 处理一个文档，永不返回错误：所有失败都记在报告里
    pub async fn process_document(
        &self,
        document: &Document,
        flow: &PageFlow,
        cancel: &CancelToken,
    ) -> DocumentReport {
        let mut report = DocumentReport::default();

        let mut child = match self.runner.spawn_batch(
            &document.pages_dir,
            self.profile,
            self.warmup,
            RegionOverride::Auto,
        ) {
            Ok(child) => child,
            Err(e) => {
                error!("[{}] ❌ {}", document.name, e);
                report.batch_failure = Some(e.to_string());
                report.fail_remaining(&document.tasks, Stage::EngineUnavailable);
                return report;
            }
        };
        info!(
            "[{}] 🚀 runner 已启动 (pid {:?})，时限 {}s",
            document.name,
            child.id(),
            self.deadline.as_secs()
        );

        let (mut lines, pumps) = pump_streams(&mut child, &document.name);
        let retry_client = EngineClient::isolated(self.runner.clone(), self.profile);
        let by_file: HashMap<String, &PageTask> = document
            .tasks
            .iter()
            .map(|t| (t.file_name(), t))
            .collect();

        let deadline_at = Instant::now() + self.deadline;
        let deadline = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline);

        let stop = loop {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = &mut deadline => break Stop::Deadline,
                next = lines.recv() => match next {
                    Some(text) => text,
                    None => break Stop::Eof,
                },
            };

            let line: RunnerLine = match serde_json::from_str(text.trim()) {
                Ok(line) => line,
                Err(_) => {
                    debug!("[{}] 忽略非协议行: {}", document.name, truncate_text(&text, 120));
                    continue;
                }
            };

            if line.is_batch_fatal() {
                let message = format!(
                    "{}: {}",
                    line.stage(),
                    line.err.clone().unwrap_or_default()
                );
                break Stop::Fatal(message);
            }

            let Some(task) = by_file.get(line.page_file.as_str()) else {
                warn!(
                    "[{}] ⚠️ 未知的 page_file，忽略: {}",
                    document.name, line.page_file
                );
                continue;
            };
            if report.outcomes.contains_key(&task.page_number) {
                warn!(
                    "[{}] ⚠️ 重复的 page_file，忽略: {}",
                    document.name, line.page_file
                );
                continue;
            }

            let ctx = PageCtx::new(document.name.clone(), (*task).clone());
            let outcome = flow
                .process(&ctx, line.into_detect_result(), &retry_client)
                .await;
            report.record(outcome);
        };

        match stop {
            Stop::Eof => {
                match tokio::time::timeout_at(deadline_at, child.wait()).await {
                    Ok(status) => debug!("[{}] runner 退出: {:?}", document.name, status),
                    Err(_) => {
                        warn!("[{}] ⚠️ runner 关闭了 stdout 但未退出，终止子进程", document.name);
                        kill(&mut child).await;
                    }
                }
                let missing = report.fail_remaining(&document.tasks, Stage::BatchFatal);
                if missing > 0 {
                    warn!(
                        "[{}] ⚠️ runner 退出时还有 {} 页没有输出",
                        document.name, missing
                    );
                    report.batch_failure = Some(format!("runner 退出，{} 页无输出", missing));
                }
            }
            Stop::Deadline => {
                let message = RunnerError::DeadlineExceeded {
                    secs: self.deadline.as_secs(),
                }
                .to_string();
                error!("[{}] ❌ {}，终止子进程", document.name, message);
                kill(&mut child).await;
                report.batch_failure = Some(message);
                report.fail_remaining(&document.tasks, Stage::BatchFatal);
            }
            Stop::Cancelled => {
                warn!("[{}] ⚠️ 已取消，终止子进程", document.name);
                kill(&mut child).await;
                report.batch_failure = Some("cancelled".to_string());
                report.fail_remaining(&document.tasks, Stage::BatchFatal);
            }
            Stop::Fatal(message) => {
                let err = RunnerError::Fatal {
                    stage: Stage::BatchFatal.to_string(),
                    message,
                };
                error!("[{}] ❌ {}", document.name, err);
                kill(&mut child).await;
                report.batch_failure = Some(err.to_string());
                report.fail_remaining(&document.tasks, Stage::BatchFatal);
            }
        }

        for pump in pumps {
            pump.abort();
        }
        report
    }
}

/// stdout 逐行送进通道；stderr 逐行写日志
fn pump_streams(child: &mut Child, doc_name: &str) -> (mpsc::Receiver<String>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(64);
    let mut pumps = Vec::with_capacity(2);

    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        }));
    }

    if let Some(stderr) = child.stderr.take() {
        let name: Arc<str> = Arc::from(doc_name);
        pumps.push(tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                info!("[IsolationRunner {}] {}", name, line);
            }
        }));
    }

    (rx, pumps)
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("⚠️ 终止 runner 失败: {}", e);
    }
}
