//! 单页处理上下文
//!
//! 封装"我正在处理哪个文档的第几页"这一信息

use std::fmt::Display;
use std::path::Path;

use crate::models::PageTask;

/// 单页处理上下文
#[derive(Debug, Clone)]
pub struct PageCtx {
    /// 文档名（仅用于日志显示）
    pub doc_name: String,

    pub task: PageTask,
}

impl PageCtx {
    /// 创建新的单页上下文
    pub fn new(doc_name: impl Into<String>, task: PageTask) -> Self {
        Self {
            doc_name: doc_name.into(),
            task,
        }
    }

    pub fn page_number(&self) -> u32 {
        self.task.page_number
    }

    pub fn image_path(&self) -> &Path {
        &self.task.image_path
    }
}

impl Display for PageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} P{:03}/{:03}]",
            self.doc_name, self.task.page_number, self.task.total_pages
        )
    }
}
