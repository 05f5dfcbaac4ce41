//! 页任务与页结果

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Stage;

/// 单页任务，每个文档在检测前一次性创建，之后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    /// 页码（从 1 开始）
    pub page_number: u32,
    pub total_pages: u32,
    pub image_path: PathBuf,
}

impl PageTask {
    pub fn new(page_number: u32, total_pages: u32, image_path: impl Into<PathBuf>) -> Self {
        Self {
            page_number,
            total_pages,
            image_path: image_path.into(),
        }
    }

    /// runner 协议里用于回溯任务的文件名
    pub fn file_name(&self) -> String {
        self.image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// 日志标签，如 `P003`
    pub fn label(&self) -> String {
        format!("P{:03}", self.page_number)
    }
}

/// 一个文档：一组已渲染的页面图片
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub pages_dir: PathBuf,
    pub tasks: Vec<PageTask>,
}

impl Document {
    pub fn pages_dir(&self) -> &Path {
        &self.pages_dir
    }
}

/// 单页处理结果，产出后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageOutcome {
    pub page_number: u32,
    pub saved: usize,
    pub dropped: usize,
    pub errors: usize,
    /// 失败时的终止阶段
    pub failed_stage: Option<Stage>,
    pub overlay_path: Option<PathBuf>,
}

impl PageOutcome {
    pub fn success(page_number: u32, saved: usize, dropped: usize, errors: usize) -> Self {
        Self {
            page_number,
            saved,
            dropped,
            errors,
            failed_stage: None,
            overlay_path: None,
        }
    }

    pub fn failed(page_number: u32, stage: Stage) -> Self {
        Self {
            page_number,
            saved: 0,
            dropped: 0,
            errors: 1,
            failed_stage: Some(stage),
            overlay_path: None,
        }
    }

    pub fn with_overlay(mut self, path: Option<PathBuf>) -> Self {
        self.overlay_path = path;
        self
    }

    pub fn is_error(&self) -> bool {
        self.failed_stage.is_some()
    }
}

/// 一个文档的全部页结果，以页码为键
#[derive(Debug, Default)]
pub struct DocumentReport {
    pub outcomes: BTreeMap<u32, PageOutcome>,
    /// 与具体页面无关的批次级失败
    pub batch_failure: Option<String>,
}

impl DocumentReport {
    pub fn record(&mut self, outcome: PageOutcome) {
        self.outcomes.insert(outcome.page_number, outcome);
    }

    pub fn saved(&self) -> usize {
        self.outcomes.values().map(|o| o.saved).sum()
    }

    pub fn failed_pages(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_error()).count()
    }

    pub fn done_pages(&self) -> usize {
        self.outcomes.len()
    }

    /// 把所有尚未出结果的页标记为失败
    pub fn fail_remaining(&mut self, tasks: &[PageTask], stage: Stage) -> usize {
        let mut marked = 0;
        for task in tasks {
            if !self.outcomes.contains_key(&task.page_number) {
                self.record(PageOutcome::failed(task.page_number, stage));
                marked += 1;
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_remaining_only_touches_missing_pages() {
        let tasks: Vec<PageTask> = (1..=3)
            .map(|n| PageTask::new(n, 3, format!("P{:03}.png", n)))
            .collect();
        let mut report = DocumentReport::default();
        report.record(PageOutcome::success(2, 4, 0, 0));

        let marked = report.fail_remaining(&tasks, Stage::BatchFatal);

        assert_eq!(marked, 2);
        assert_eq!(report.saved(), 4);
        assert_eq!(report.failed_pages(), 2);
        assert_eq!(report.outcomes[&1].failed_stage, Some(Stage::BatchFatal));
        assert!(!report.outcomes[&2].is_error());
    }

    #[test]
    fn test_task_labels() {
        let task = PageTask::new(7, 9, "/tmp/doc/P007.png");
        assert_eq!(task.file_name(), "P007.png");
        assert_eq!(task.label(), "P007");
    }
}
