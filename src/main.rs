use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use page_cutter::utils::logging::init_tracing;
use page_cutter::{App, CancelToken, Config, Profile};
use tracing::warn;

/// 把页面图片切成一题一张
#[derive(Parser, Debug)]
#[command(name = "page-cutter", version)]
struct Cli {
    /// TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 页面图片根目录
    #[arg(long)]
    input: Option<PathBuf>,

    /// 输出根目录
    #[arg(long)]
    output: Option<PathBuf>,

    /// 池化模式的 worker 数（1-8）
    #[arg(long)]
    workers: Option<usize>,

    /// 进程内共享引擎，不启动 runner 子进程
    #[arg(long)]
    in_process: bool,

    #[arg(long)]
    profile: Option<Profile>,

    /// 不预热引擎
    #[arg(long)]
    no_warmup: bool,

    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let mut config = Config::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(input) = cli.input {
        config.input_root = input;
    }
    if let Some(output) = cli.output {
        config.output_root = output;
    }
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if cli.in_process {
        config.isolation = false;
    }
    if let Some(profile) = cli.profile {
        config.profile = profile;
    }
    if cli.no_warmup {
        config.warmup = false;
    }
    config.verbose_logging |= cli.verbose;

    // 初始化日志
    init_tracing(config.verbose_logging, false);

    // Ctrl-C 触发取消
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⚠️ 收到 Ctrl-C，正在停止...");
                cancel.cancel();
            }
        });
    }

    // 初始化并运行应用
    let stats = App::initialize(config, cancel).await?.run().await?;
    if stats.failed_pages > 0 {
        warn!("⚠️ {} 页处理失败，详见 errors/ 目录", stats.failed_pages);
    }

    Ok(())
}
