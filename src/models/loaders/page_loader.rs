use crate::models::page::{Document, PageTask};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;

fn page_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^P(\d+)\.png$").expect("page name regex"))
}

/// 从 `P003.png` 这样的文件名解析页码
pub fn page_number_of(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    page_name_re().captures(name)?.get(1)?.as_str().parse().ok()
}

fn is_page_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('P') && n.ends_with(".png"))
        .unwrap_or(false)
}

/// 按页码数值排序；不符合命名规则的 `P*.png` 排在最后，按文件名排序
pub fn sort_page_files(mut files: Vec<PathBuf>) -> Vec<PathBuf> {
    files.sort_by_key(|p| {
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match page_number_of(p) {
            Some(n) => (0u8, n, name),
            None => (1u8, 0, name),
        }
    });
    files
}

/// 同步扫描页面目录（runner 子进程使用）
pub fn scan_page_files(pages_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(pages_dir)? {
        let path = entry?.path();
        if path.is_file() && is_page_file(&path) {
            files.push(path);
        }
    }
    Ok(sort_page_files(files))
}

/// 为一个页面目录构建不可变的页任务列表
///
/// 无法解析页码的文件（以及页码重复的文件）依次编在最大页码之后，页码互不相同。
pub fn build_tasks(files: &[PathBuf]) -> Vec<PageTask> {
    let total = files.len() as u32;
    let mut next = files.iter().filter_map(|p| page_number_of(p)).max().unwrap_or(0);
    let mut used = HashSet::new();
    files
        .iter()
        .map(|path| {
            let page_number = match page_number_of(path) {
                Some(n) if used.insert(n) => n,
                _ => {
                    next += 1;
                    used.insert(next);
                    next
                }
            };
            PageTask::new(page_number, total, path.clone())
        })
        .collect()
}

async fn collect_page_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("无法读取文件夹: {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_page_file(&path) {
            files.push(path);
        }
    }
    Ok(sort_page_files(files))
}

fn document_from(dir: &Path, files: Vec<PathBuf>) -> Document {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    Document {
        name,
        pages_dir: dir.to_path_buf(),
        tasks: build_tasks(&files),
    }
}

/// 已渲染页面的来源
pub trait PageSource {
    fn load_documents(&self) -> impl Future<Output = Result<Vec<Document>>> + Send;
}

/// 目录页面源
///
/// 根目录本身有 `P*.png` 时视为单个文档；否则每个含页面的子目录是一个文档。
pub struct DirectoryPageSource {
    root: PathBuf,
}

impl DirectoryPageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn scan(&self) -> Result<Vec<Document>> {
        if !self.root.is_dir() {
            anyhow::bail!("文件夹不存在: {}", self.root.display());
        }

        let own_pages = collect_page_files(&self.root).await?;
        if !own_pages.is_empty() {
            tracing::info!(
                "正在加载: {} ({} 页)",
                self.root.display(),
                own_pages.len()
            );
            return Ok(vec![document_from(&self.root, own_pages)]);
        }

        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("无法读取文件夹: {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        let mut documents = Vec::new();
        for dir in dirs {
            match collect_page_files(&dir).await {
                Ok(files) if !files.is_empty() => {
                    tracing::info!(
                        "正在加载: {} ({} 页)",
                        dir.file_name().unwrap_or_default().to_string_lossy(),
                        files.len()
                    );
                    documents.push(document_from(&dir, files));
                }
                Ok(_) => {
                    tracing::debug!("跳过没有页面的目录: {}", dir.display());
                }
                Err(e) => {
                    tracing::warn!("加载目录失败 {}: {}", dir.display(), e);
                }
            }
        }

        Ok(documents)
    }
}

impl PageSource for DirectoryPageSource {
    fn load_documents(&self) -> impl Future<Output = Result<Vec<Document>>> + Send {
        self.scan()
    }
}
