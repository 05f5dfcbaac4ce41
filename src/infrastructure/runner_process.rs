//! 启动 `page-runner` 子进程
//!
//! 两种用法：
//! - 批处理：每个文档一个子进程，逐行读取 stdout（见 `orchestrator::isolation_batch`）
//! - 一次性：单张图片，进程退出后取最后一行 JSON

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::{RunnerError, Stage};
use crate::infrastructure::engine::{EngineSpec, Profile, RegionOverride};
use crate::models::{DetectFailure, DetectResult, RunnerLine};

/// 零锚点重试的一次性子进程超时
pub const ONE_SHOT_RETRY_TIMEOUT: Duration = Duration::from_secs(240);
/// 运行时不兼容回退的一次性子进程超时
pub const ONE_SHOT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(180);

/// runner 的启动方式
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: PathBuf,
    /// 每次都附带的参数（引擎选择等）
    pub base_args: Vec<String>,
}

impl RunnerCommand {
    pub fn new(program: impl Into<PathBuf>, engine: &EngineSpec) -> Self {
        Self {
            program: program.into(),
            base_args: engine.to_args(),
        }
    }

    /// 当前可执行文件旁边的 `page-runner`
    pub fn sibling_program() -> PathBuf {
        let name = format!("page-runner{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args).kill_on_drop(true);
        cmd
    }

    /// 为一个文档启动批处理子进程，stdout/stderr 都是管道
    pub fn spawn_batch(
        &self,
        pages_dir: &Path,
        profile: Profile,
        warmup: bool,
        region: RegionOverride,
    ) -> Result<Child, RunnerError> {
        let mut cmd = self.command();
        cmd.arg("--pages-dir")
            .arg(pages_dir)
            .arg("--profile")
            .arg(profile.as_str())
            .arg("--warmup")
            .arg(if warmup { "1" } else { "0" })
            .arg("--force-region-detection")
            .arg(region.as_flag().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd.spawn().map_err(|source| RunnerError::SpawnFailed {
            program: self.program.clone(),
            source,
        })
    }

    /// 单张图片的一次性调用，不预热
    pub async fn one_shot(
        &self,
        image: &Path,
        profile: Profile,
        region: RegionOverride,
        timeout: Duration,
    ) -> DetectResult {
        let mut cmd = self.command();
        cmd.arg(image)
            .arg("--profile")
            .arg(profile.as_str())
            .arg("--warmup")
            .arg("0")
            .arg("--force-region-detection")
            .arg(region.as_flag().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|source| {
            DetectFailure::new(
                Stage::EngineUnavailable,
                RunnerError::SpawnFailed {
                    program: self.program.clone(),
                    source,
                }
                .to_string(),
            )
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DetectFailure::new(
                    Stage::PredictFailed,
                    format!("一次性 runner 执行失败: {}", e),
                ))
            }
            Err(_) => {
                return Err(DetectFailure::new(
                    Stage::PredictFailed,
                    RunnerError::DeadlineExceeded {
                        secs: timeout.as_secs(),
                    }
                    .to_string(),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match last_json_line(&stdout) {
            Some(line) => line.into_detect_result(),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
                Err(DetectFailure::new(
                    Stage::PredictFailed,
                    format!("{} ({})", RunnerError::EmptyOutput, tail),
                ))
            }
        }
    }
}

/// 从后往前找第一条能解析的协议行
pub fn last_json_line(stdout: &str) -> Option<RunnerLine> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str::<RunnerLine>(l).ok())
}
