use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};

use crate::error::EngineFault;
use crate::infrastructure::engine::{
    classify_predict_error, EngineOutput, PredictFlags, StructureEngine,
};

/// 外部引擎进程的一条应答
#[derive(Debug, Deserialize)]
struct EngineReply {
    ok: bool,
    #[serde(default)]
    result: JsonValue,
    #[serde(default)]
    fields: JsonValue,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// 通过 stdin/stdout 逐行交换 JSON 的外部引擎
///
/// 进程只启动一次，之后所有预测串行复用同一个会话。
/// 子进程句柄单独加锁，阻塞在读应答上的调用不妨碍 `abort` 杀进程。
pub struct CommandEngine {
    program: String,
    child: Mutex<Child>,
    pipes: Mutex<Pipes>,
    aborted: AtomicBool,
}

impl CommandEngine {
    pub fn spawn(command_line: &str) -> Result<Self, EngineFault> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| EngineFault::Unavailable("引擎命令为空".to_string()))?
            .to_string();

        let mut command = Command::new(&program);
        command
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // 独立进程组，终止时连同引擎派生的子进程一起结束
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command
            .spawn()
            .map_err(|e| EngineFault::Unavailable(format!("无法启动引擎 {}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineFault::Unavailable("引擎 stdin 不可用".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineFault::Unavailable("引擎 stdout 不可用".to_string()))?;

        Ok(Self {
            program,
            child: Mutex::new(child),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            aborted: AtomicBool::new(false),
        })
    }

    fn aborted_fault(&self) -> EngineFault {
        EngineFault::Unavailable(format!("引擎进程 {} 已因超时被终止", self.program))
    }

    fn exchange(&self, request: &JsonValue) -> Result<EngineReply, EngineFault> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(self.aborted_fault());
        }
        let mut pipes = self
            .pipes
            .lock()
            .map_err(|_| EngineFault::Unavailable("引擎会话已损坏".to_string()))?;
        if self.aborted.load(Ordering::SeqCst) {
            return Err(self.aborted_fault());
        }

        writeln!(pipes.stdin, "{}", request)
            .and_then(|_| pipes.stdin.flush())
            .map_err(|e| EngineFault::Unavailable(format!("写入引擎失败: {}", e)))?;

        let mut line = String::new();
        let read = pipes
            .stdout
            .read_line(&mut line)
            .map_err(|e| EngineFault::Predict(format!("读取引擎输出失败: {}", e)))?;
        if self.aborted.load(Ordering::SeqCst) {
            return Err(self.aborted_fault());
        }
        if read == 0 {
            return Err(EngineFault::Unavailable(format!(
                "引擎进程 {} 已退出",
                self.program
            )));
        }

        serde_json::from_str(line.trim())
            .map_err(|e| EngineFault::PayloadShape(format!("引擎应答不是 JSON: {}", e)))
    }
}

impl StructureEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn predict(&self, image: &Path, flags: &PredictFlags) -> Result<EngineOutput, EngineFault> {
        let request = json!({
            "image": image.to_string_lossy(),
            "flags": flags.to_json(),
        });
        let reply = self.exchange(&request)?;

        if !reply.ok {
            let message = reply.err.unwrap_or_else(|| "engine error".to_string());
            return Err(match reply.stage.as_deref() {
                Some("image-load-failed") => EngineFault::ImageLoad(message),
                _ => classify_predict_error(&message),
            });
        }

        let fields = match reply.fields {
            JsonValue::Null => JsonValue::Object(Map::new()),
            other => other,
        };
        Ok(EngineOutput {
            result: reply.result,
            fields,
        })
    }

    fn warm_up(&self, flags: &PredictFlags) -> Result<(), EngineFault> {
        let dummy = tempfile::Builder::new()
            .prefix("warmup_")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EngineFault::Predict(format!("无法创建预热图片: {}", e)))?;
        write_blank_page(dummy.path())?;
        self.predict(dummy.path(), flags).map(|_| ())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Ok(mut child) = self.child.lock() {
            #[cfg(unix)]
            unsafe {
                libc::kill(-(child.id() as i32), libc::SIGKILL);
            }
            let _ = child.kill();
        }
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        if let Ok(child) = self.child.get_mut() {
            #[cfg(unix)]
            unsafe {
                libc::kill(-(child.id() as i32), libc::SIGKILL);
            }
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// 64×64 的白色图片，用于预热
pub fn write_blank_page(path: &Path) -> Result<(), EngineFault> {
    image::RgbImage::from_pixel(64, 64, image::Rgb([255, 255, 255]))
        .save(path)
        .map_err(|e| EngineFault::Predict(format!("写入预热图片失败: {}", e)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// 用 shell 模拟一个应答固定内容的引擎
    fn scripted_engine(reply: &str) -> (CommandEngine, tempfile::TempDir) {
        let script = format!("while read line; do echo '{}'; done\n", reply);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        std::fs::write(&path, script).unwrap();
        let engine = CommandEngine::spawn(&format!("sh {}", path.display())).unwrap();
        (engine, dir)
    }

    #[test]
    fn test_successful_exchange() {
        let (engine, _dir) = scripted_engine(r#"{"ok":true,"result":{"res":[]},"fields":{"overall_ocr_res":{}}}"#);
        let out = engine
            .predict(Path::new("/tmp/P001.png"), &PredictFlags::default())
            .unwrap();
        assert_eq!(out.result["res"], serde_json::json!([]));
        assert!(out.fields.get("overall_ocr_res").is_some());
    }

    #[test]
    fn test_runtime_error_is_classified() {
        let (engine, _dir) = scripted_engine(r#"{"ok":false,"err":"onednn_instruction failed"}"#);
        let err = engine
            .predict(Path::new("/tmp/P001.png"), &PredictFlags::default())
            .unwrap_err();
        assert!(matches!(err, EngineFault::RuntimeIncompatible(_)));
    }

    #[test]
    fn test_abort_unblocks_reader_and_fails_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        // 收到请求后不再应答，睡眠的子进程也握着 stdout
        std::fs::write(&path, "while read l; do sleep 99999; done\n").unwrap();
        let engine = std::sync::Arc::new(
            CommandEngine::spawn(&format!("sh {}", path.display())).unwrap(),
        );

        let blocked = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.predict(Path::new("/tmp/P001.png"), &PredictFlags::default())
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(200));
        engine.abort();

        let err = blocked.join().unwrap().unwrap_err();
        assert!(matches!(err, EngineFault::Unavailable(_)));
        let again = engine
            .predict(Path::new("/tmp/P002.png"), &PredictFlags::default())
            .unwrap_err();
        assert!(matches!(again, EngineFault::Unavailable(_)));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let result = CommandEngine::spawn("/definitely/not/an/engine");
        assert!(matches!(result, Err(EngineFault::Unavailable(_))));
    }
}
