use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use page_cutter::infrastructure::{EngineKind, EngineSpec, RunnerCommand};
use page_cutter::models::RunnerLine;
use page_cutter::orchestrator::IsolationBatch;
use page_cutter::services::OutcomeWriter;
use page_cutter::{App, CancelToken, Config, PageFlow, Profile, Stage};
use serde_json::{json, Value as JsonValue};

const RUNNER: &str = env!("CARGO_BIN_EXE_page-runner");

/// 两个锚点的预存结果（页面 1000×1500）
fn two_anchor_payload() -> JsonValue {
    json!({
        "pp_json": {"res": {"parsing_res_list": []}},
        "pp_obj": {
            "overall_ocr_res": {
                "rec_texts": ["0001", "0002", "说明文字"],
                "rec_boxes": [[50, 100, 110, 120], [50, 800, 110, 820], [200, 300, 600, 340]],
            }
        }
    })
}

fn write_pages(dir: &Path, count: u32, payload: &JsonValue) {
    std::fs::create_dir_all(dir).unwrap();
    for n in 1..=count {
        image::RgbImage::from_pixel(1000, 1500, image::Rgb([255, 255, 255]))
            .save(dir.join(format!("P{:03}.png", n)))
            .unwrap();
        std::fs::write(dir.join(format!("P{:03}.json", n)), payload.to_string()).unwrap();
    }
}

fn run_runner(args: &[&str]) -> Vec<RunnerLine> {
    let output = Command::new(RUNNER).args(args).output().unwrap();
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("stdout carries only protocol lines"))
        .collect()
}

fn fixture_spec() -> EngineSpec {
    EngineSpec {
        kind: EngineKind::Fixture,
        ..Default::default()
    }
}

#[test]
fn test_runner_emits_one_line_per_page() {
    let dir = tempfile::tempdir().unwrap();
    write_pages(dir.path(), 4, &two_anchor_payload());

    let lines = run_runner(&[
        "--pages-dir",
        dir.path().to_str().unwrap(),
        "--engine",
        "fixture",
        "--warmup",
        "0",
    ]);

    let files: Vec<&str> = lines.iter().map(|l| l.page_file.as_str()).collect();
    assert_eq!(files, vec!["P001.png", "P002.png", "P003.png", "P004.png"]);
    for line in &lines {
        assert!(line.ok);
        let meta = line.pp_meta.as_ref().unwrap();
        assert_eq!(meta["profile"], "fast");
        assert_eq!(meta["flags"]["use_region_detection"], false);
        assert!(line.pp_obj.as_ref().unwrap().get("overall_ocr_res").is_some());
    }
}

#[test]
fn test_runner_single_image_with_region_override() {
    let dir = tempfile::tempdir().unwrap();
    write_pages(dir.path(), 2, &two_anchor_payload());
    let image = dir.path().join("P002.png");

    let lines = run_runner(&[
        image.to_str().unwrap(),
        "--engine",
        "fixture",
        "--force-region-detection",
        "1",
        "--profile",
        "fast",
    ]);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].page_file, "P002.png");
    assert_eq!(
        lines[0].pp_meta.as_ref().unwrap()["flags"]["use_region_detection"],
        true
    );
}

#[test]
fn test_runner_without_engine_reports_batch_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_pages(dir.path(), 2, &two_anchor_payload());

    let lines = run_runner(&["--pages-dir", dir.path().to_str().unwrap()]);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].is_batch_fatal());
    assert_eq!(lines[0].stage(), Stage::EngineUnavailable);
}

#[tokio::test]
async fn test_isolated_document_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let pages = dir.path().join("pages");
    write_pages(&pages, 3, &two_anchor_payload());
    let out = dir.path().join("out");

    let config = Config {
        debug_overlay: false,
        ..Config::default()
    };
    let flow = PageFlow::new(&config, OutcomeWriter::new(&out, "pages"));
    let batch = IsolationBatch::new(
        RunnerCommand::new(RUNNER, &fixture_spec()),
        Profile::Fast,
        true,
        Duration::from_secs(120),
    );
    let document = page_cutter::Document {
        name: "pages".to_string(),
        pages_dir: pages.clone(),
        tasks: page_cutter::models::loaders::build_tasks(
            &page_cutter::models::loaders::scan_page_files(&pages).unwrap(),
        ),
    };

    let report = batch
        .process_document(&document, &flow, &CancelToken::new())
        .await;
    assert_eq!(report.done_pages(), 3);
    assert_eq!(report.failed_pages(), 0);
    assert_eq!(report.saved(), 6);
    assert!(out
        .join("out_crops")
        .join("pages")
        .join("P003_Q002_N0002.png")
        .exists());
}

#[tokio::test]
async fn test_app_runs_both_modes() {
    for isolation in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        write_pages(&input.join("exam_a"), 2, &two_anchor_payload());
        write_pages(&input.join("exam_b"), 1, &json!({"res": {}}));

        let config = Config {
            input_root: input,
            output_root: dir.path().join("out"),
            isolation,
            max_workers: 3,
            engine: EngineKind::Fixture,
            runner_program: PathBuf::from(RUNNER),
            output_log_file: dir.path().join("run.log").to_string_lossy().to_string(),
            ..Config::default()
        };
        let stats = App::initialize(config, CancelToken::new())
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(stats.documents, 2);
        assert_eq!(stats.total_pages, 3);
        assert_eq!(stats.saved, 4);
        // exam_b 的空结果：零锚点，重试后仍失败
        assert_eq!(stats.failed_pages, 1);
        let sidecar = dir.path().join("out/errors/exam_b/P001.json");
        let body: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(body["stage"], "zero-anchors");
        assert!(dir.path().join("out/out_crops/exam_a/debug_P002.jpg").exists());
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_silent_runner_past_deadline_is_batch_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let pages = dir.path().join("pages");
    write_pages(&pages, 2, &two_anchor_payload());

    let runner = RunnerCommand {
        program: PathBuf::from("sh"),
        base_args: vec!["-c".into(), "exec sleep 60".into(), "runner".into()],
    };
    let batch = IsolationBatch::new(runner, Profile::Fast, false, Duration::from_millis(500));
    let flow = PageFlow::new(&Config::default(), OutcomeWriter::new(&dir.path().join("out"), "pages"));
    let document = page_cutter::Document {
        name: "pages".to_string(),
        pages_dir: pages.clone(),
        tasks: page_cutter::models::loaders::build_tasks(
            &page_cutter::models::loaders::scan_page_files(&pages).unwrap(),
        ),
    };

    let report = tokio::time::timeout(
        Duration::from_secs(15),
        batch.process_document(&document, &flow, &CancelToken::new()),
    )
    .await
    .expect("batch must not hang past its deadline");

    assert!(report.batch_failure.is_some());
    assert!(report
        .outcomes
        .values()
        .all(|o| o.failed_stage == Some(Stage::BatchFatal)));
}

/// 真实引擎：需要设置 ENGINE_COMMAND 和 PAGES_DIR
///
/// ```bash
/// ENGINE_COMMAND="python engine_bridge.py" PAGES_DIR=input_pages/exam \
///     cargo test --test runner_protocol -- --ignored --nocapture
/// ```
#[test]
#[ignore]
fn test_real_engine_pages_dir() {
    let _ = tracing_subscriber::fmt::try_init();
    let (Ok(command), Ok(pages)) = (std::env::var("ENGINE_COMMAND"), std::env::var("PAGES_DIR"))
    else {
        println!("未设置 ENGINE_COMMAND / PAGES_DIR，跳过");
        return;
    };

    let expected = page_cutter::models::loaders::scan_page_files(Path::new(&pages))
        .unwrap()
        .len();
    let lines = run_runner(&["--pages-dir", &pages, "--engine-cmd", &command]);
    println!("\n========== 真实引擎 ==========");
    for line in &lines {
        println!(
            "{} ok={} stage={:?} t_predict_ms={:?}",
            line.page_file, line.ok, line.stage, line.t_predict_ms
        );
    }
    assert_eq!(lines.len(), expected);
}
