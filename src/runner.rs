//! 隔离 runner - 子进程侧
//!
//! 引擎只构建一次，可选预热，然后逐页检测，每页向 stdout 写恰好一行紧凑 JSON。
//! 叙述性输出全部走 stderr（`[stage] message`），stdout 只承载协议行。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::error::Stage;
use crate::infrastructure::{run_detection, EngineSpec, PredictFlags, Profile, RegionOverride};
use crate::models::loaders::scan_page_files;
use crate::models::RunnerLine;
use crate::utils::logging::truncate_text;

/// runner 的输入：整个目录或单张图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerInput {
    PagesDir(PathBuf),
    Image(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub profile: Profile,
    pub warmup: bool,
    pub region: RegionOverride,
    pub engine: EngineSpec,
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn emit<W: Write>(out: &mut W, line: &RunnerLine) -> std::io::Result<()> {
    let text = serde_json::to_string(line).map_err(std::io::Error::other)?;
    writeln!(out, "{}", text)?;
    out.flush()
}

/// 运行一次 runner，返回写出的协议行数
///
/// 引擎构建失败时只写一行不带 `page_file` 的失败行（批次级失败）。
pub fn run<W: Write>(input: &RunnerInput, opts: &RunnerOptions, out: &mut W) -> std::io::Result<usize> {
    let started = Instant::now();

    let pages = match input {
        RunnerInput::Image(path) => vec![path.clone()],
        RunnerInput::PagesDir(dir) => match scan_page_files(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("[scan] 无法读取页面目录 {}: {}", dir.display(), e);
                let line = RunnerLine::failure("", Stage::ImageLoadFailed, format!("scan failed: {}", e));
                emit(out, &line)?;
                return Ok(1);
            }
        },
    };
    info!("[scan] {} 页", pages.len());
    if pages.is_empty() {
        return Ok(0);
    }

    info!("[init] 构建引擎 ({})", opts.engine.kind.as_str());
    let engine = match opts.engine.build() {
        Ok(engine) => engine,
        Err(fault) => {
            warn!("[init] 引擎不可用: {}", fault);
            emit(out, &RunnerLine::failure("", fault.stage(), fault.message()))?;
            return Ok(1);
        }
    };
    let t_init_ms = elapsed_ms(started);
    info!("[init] 引擎 {} 就绪，用时 {:.0}ms", engine.name(), t_init_ms);

    let flags = PredictFlags::for_profile(opts.profile, opts.region);
    if opts.warmup {
        let warm = Instant::now();
        match engine.warm_up(&flags) {
            Ok(()) => info!("[warmup] 完成，用时 {:.0}ms", elapsed_ms(warm)),
            Err(fault) => warn!("[warmup] 失败，继续处理: {}", fault),
        }
    }

    let mut written = 0;
    for (idx, page) in pages.iter().enumerate() {
        let page_started = Instant::now();
        let page_file = file_name_of(page);
        info!("[page] {}/{} {}", idx + 1, pages.len(), page_file);

        let mut line = match run_detection(engine.as_ref(), page, &flags, opts.profile) {
            Ok(detection) => {
                let t_predict_ms = detection.meta.get("t_predict_ms").and_then(|v| v.as_f64());
                let mut line = RunnerLine::success(page_file.clone(), detection);
                line.t_predict_ms = t_predict_ms;
                line
            }
            Err(fault) => {
                warn!(
                    "[{}] {}: {}",
                    fault.stage(),
                    page_file,
                    truncate_text(fault.message(), 200)
                );
                RunnerLine::failure(page_file.clone(), fault.stage(), fault.message())
            }
        };
        line.profile = Some(opts.profile.as_str().to_string());
        line.t_init_ms = Some(t_init_ms);
        line.t_page_total_ms = Some(elapsed_ms(page_started));

        emit(out, &line)?;
        written += 1;
    }

    info!("[done] {} 行，总用时 {:.0}ms", written, elapsed_ms(started));
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::EngineKind;
    use serde_json::json;

    fn fixture_pages(dir: &Path, count: u32, payload: serde_json::Value) {
        for n in 1..=count {
            image::RgbImage::new(32, 32)
                .save(dir.join(format!("P{:03}.png", n)))
                .unwrap();
            std::fs::write(dir.join(format!("P{:03}.json", n)), payload.to_string()).unwrap();
        }
    }

    fn fixture_options() -> RunnerOptions {
        RunnerOptions {
            warmup: true,
            engine: EngineSpec {
                kind: EngineKind::Fixture,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn parse_lines(out: &[u8]) -> Vec<RunnerLine> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_one_line_per_page_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        fixture_pages(dir.path(), 3, json!({"res": {"parsing_res_list": []}}));

        let mut out = Vec::new();
        let n = run(
            &RunnerInput::PagesDir(dir.path().to_path_buf()),
            &fixture_options(),
            &mut out,
        )
        .unwrap();
        assert_eq!(n, 3);

        let lines = parse_lines(&out);
        let files: Vec<&str> = lines.iter().map(|l| l.page_file.as_str()).collect();
        assert_eq!(files, vec!["P001.png", "P002.png", "P003.png"]);
        assert!(lines.iter().all(|l| l.ok));
        assert_eq!(lines[0].profile.as_deref(), Some("fast"));
        assert!(lines[0].t_init_ms.is_some());
        assert!(lines[0].t_page_total_ms.is_some());
    }

    #[test]
    fn test_page_failures_keep_page_file() {
        let dir = tempfile::tempdir().unwrap();
        fixture_pages(dir.path(), 1, json!({"res": {}}));
        // 第二页图片损坏
        std::fs::write(dir.path().join("P002.png"), b"not a png").unwrap();

        let mut out = Vec::new();
        run(
            &RunnerInput::PagesDir(dir.path().to_path_buf()),
            &fixture_options(),
            &mut out,
        )
        .unwrap();

        let lines = parse_lines(&out);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ok);
        assert!(!lines[1].ok);
        assert_eq!(lines[1].page_file, "P002.png");
        assert_eq!(lines[1].stage(), Stage::ImageLoadFailed);
        assert!(!lines[1].is_batch_fatal());
    }

    #[test]
    fn test_engine_build_failure_is_batch_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fixture_pages(dir.path(), 2, json!({}));
        let opts = RunnerOptions {
            engine: EngineSpec::default(),
            ..Default::default()
        };

        let mut out = Vec::new();
        let n = run(&RunnerInput::PagesDir(dir.path().to_path_buf()), &opts, &mut out).unwrap();
        assert_eq!(n, 1);
        let lines = parse_lines(&out);
        assert!(lines[0].is_batch_fatal());
        assert_eq!(lines[0].stage(), Stage::EngineUnavailable);
    }

    #[test]
    fn test_single_image_mode() {
        let dir = tempfile::tempdir().unwrap();
        fixture_pages(dir.path(), 2, json!({"res": {}}));

        let mut out = Vec::new();
        run(
            &RunnerInput::Image(dir.path().join("P002.png")),
            &fixture_options(),
            &mut out,
        )
        .unwrap();
        let lines = parse_lines(&out);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].page_file, "P002.png");
    }
}
