//! `page-runner`：隔离子进程
//!
//! 批处理：`page-runner --pages-dir <dir> [--profile fast|full] [--warmup 0|1] [--force-region-detection -1|0|1]`
//! 单张：  `page-runner <image-path> [...]`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use page_cutter::infrastructure::{EngineKind, EngineSpec, Profile, RegionOverride};
use page_cutter::runner::{self, RunnerInput, RunnerOptions};
use page_cutter::utils::logging::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "page-runner", about = "逐页调用结构识别引擎，每页输出一行 JSON")]
struct Cli {
    /// 页面图片目录（P###.png）
    #[arg(long, conflicts_with = "image")]
    pages_dir: Option<PathBuf>,

    /// 单张页面图片
    #[arg(required_unless_present = "pages_dir")]
    image: Option<PathBuf>,

    #[arg(long, default_value = "fast")]
    profile: Profile,

    /// 先用空白页预热引擎
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    warmup: u8,

    /// 区域检测覆盖：-1 跟随 profile，0 关，1 开
    #[arg(long, default_value_t = -1, allow_negative_numbers = true,
          value_parser = clap::value_parser!(i32).range(-1..=1))]
    force_region_detection: i32,

    #[arg(long, default_value = "command")]
    engine: EngineKind,

    /// 外部引擎命令行
    #[arg(long)]
    engine_cmd: Option<String>,

    /// 预存结果目录（fixture 引擎）
    #[arg(long)]
    fixture_dir: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, true);

    let input = match (cli.pages_dir, cli.image) {
        (Some(dir), _) => RunnerInput::PagesDir(dir),
        (None, Some(image)) => RunnerInput::Image(image),
        (None, None) => return ExitCode::from(2),
    };
    let opts = RunnerOptions {
        profile: cli.profile,
        warmup: cli.warmup == 1,
        region: RegionOverride::from_flag(cli.force_region_detection),
        engine: EngineSpec {
            kind: cli.engine,
            command: cli.engine_cmd,
            fixture_dir: cli.fixture_dir,
        },
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match runner::run(&input, &opts, &mut out) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[fatal] 写 stdout 失败: {}", e);
            ExitCode::FAILURE
        }
    }
}
