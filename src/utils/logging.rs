use anyhow::Result;
/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::{Document, PageOutcome};

/// 初始化 tracing 订阅者
///
/// # 参数
/// - `verbose`: 未设置 `RUST_LOG` 时使用 `debug` 级别，否则 `info`
/// - `to_stderr`: runner 子进程必须写 stderr，stdout 只留给协议行
pub fn init_tracing(verbose: bool, to_stderr: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = if to_stderr {
        builder.with_writer(std::io::stderr).with_ansi(false).try_init()
    } else {
        builder.try_init()
    };
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
///
/// # 返回
/// 返回是否成功初始化
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n页面切题日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
///
/// # 参数
/// - `mode`: 运行模式描述
/// - `workers`: worker 数量
pub fn log_startup(mode: &str, workers: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - {}", mode);
    info!("📊 worker 数: {}", workers);
    info!("{}", "=".repeat(60));
}

/// 记录文档加载信息
pub fn log_documents_loaded(documents: &[Document]) {
    let pages: usize = documents.iter().map(|d| d.tasks.len()).sum();
    info!("✓ 找到 {} 个待处理的文档，共 {} 页\n", documents.len(), pages);
}

/// 记录文档开始信息
///
/// # 参数
/// - `index`: 文档编号（从 1 开始）
/// - `total`: 文档总数
/// - `document`: 文档
pub fn log_document_start(index: usize, total: usize, document: &Document) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 个文档: {}", index, total, document.name);
    info!("📄 页数: {}", document.tasks.len());
    info!("{}", "=".repeat(60));
}

/// 记录文档完成信息
pub fn log_document_complete(name: &str, saved: usize, errors: usize, done: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ 文档 {} 完成: 页 {}/{}，保存 {} 个裁剪，错误 {}",
        name, done, total, saved, errors
    );
    info!("{}", "─".repeat(60));
}

/// 单页汇总行：`[AnchorSlice] P### anchors=N saved=S dropped=D errors=E`
pub fn log_page_outcome(anchors: usize, outcome: &PageOutcome) {
    info!(
        "[AnchorSlice] P{:03} anchors={} saved={} dropped={} errors={}",
        outcome.page_number, anchors, outcome.saved, outcome.dropped, outcome.errors
    );
}

/// 打印最终统计信息
///
/// # 参数
/// - `saved`: 保存的裁剪总数
/// - `failed_pages`: 失败页数
/// - `total_pages`: 总页数
/// - `log_file_path`: 日志文件路径
pub fn print_final_stats(saved: usize, failed_pages: usize, total_pages: usize, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功页: {}/{}", total_pages - failed_pages.min(total_pages), total_pages);
    info!("❌ 失败页: {}", failed_pages);
    info!("✂️ 裁剪总数: {}", saved);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("题号一二三", 2), "题号...");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn test_init_log_file_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        init_log_file(path.to_str().unwrap()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(&"=".repeat(60)));
        assert!(text.contains("页面切题日志"));
    }
}
