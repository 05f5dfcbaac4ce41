use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult, ConfigError, FileError};
use crate::infrastructure::{EngineKind, EngineSpec, Profile, RunnerCommand};
use crate::services::{AnchorTuning, FilterTuning, SliceTuning};

/// worker 数量上限
pub const MAX_WORKERS_LIMIT: usize = 8;

/// 算法阈值，只能从 TOML 的 `[tuning]` 表设置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub anchor: AnchorTuning,
    pub slice: SliceTuning,
    pub filter: FilterTuning,
}

/// 程序配置文件
#[derive(Clone, Debug)]
pub struct Config {
    /// 页面图片根目录
    pub input_root: PathBuf,
    /// 输出根目录（`out_crops/`、`errors/`）
    pub output_root: PathBuf,
    /// 池化模式的 worker 数量
    pub max_workers: usize,
    /// 每个文档一个 runner 子进程
    pub isolation: bool,
    pub profile: Profile,
    /// runner 启动后先跑一次空白页
    pub warmup: bool,
    /// 隔离模式下每个文档的总时限（秒）
    pub batch_deadline_secs: u64,
    /// 池化模式下单页引擎调用的时限（秒）
    pub page_timeout_secs: u64,
    pub runner_program: PathBuf,
    // --- 引擎配置 ---
    pub engine: EngineKind,
    pub engine_command: Option<String>,
    pub fixture_dir: Option<PathBuf>,
    /// 是否输出 `debug_P###.jpg`
    pub debug_overlay: bool,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    pub tuning: Tuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("input_pages"),
            output_root: PathBuf::from("pdf_cutter_output"),
            max_workers: 6,
            isolation: true,
            profile: Profile::Fast,
            warmup: true,
            batch_deadline_secs: 1800,
            page_timeout_secs: 240,
            runner_program: RunnerCommand::sibling_program(),
            engine: EngineKind::Command,
            engine_command: None,
            fixture_dir: None,
            debug_overlay: true,
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            tuning: Tuning::default(),
        }
    }
}

/// TOML 配置文件的形状，所有字段可省略
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    input_root: Option<PathBuf>,
    output_root: Option<PathBuf>,
    max_workers: Option<usize>,
    isolation: Option<bool>,
    profile: Option<Profile>,
    warmup: Option<bool>,
    batch_deadline_secs: Option<u64>,
    page_timeout_secs: Option<u64>,
    runner_program: Option<PathBuf>,
    engine: Option<EngineKind>,
    engine_command: Option<String>,
    fixture_dir: Option<PathBuf>,
    debug_overlay: Option<bool>,
    verbose_logging: Option<bool>,
    output_log_file: Option<String>,
    tuning: Option<Tuning>,
}

impl Config {
    /// 默认值 → TOML 文件（如果给了）→ 环境变量
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| AppError::file_read_failed(path, e))?;
            config.apply_toml(&text).map_err(|source| {
                AppError::File(FileError::TomlParseFailed {
                    path: path.to_path_buf(),
                    source,
                })
            })?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> AppResult<Self> {
        Self::load(None)
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        take!(
            input_root,
            output_root,
            max_workers,
            isolation,
            profile,
            warmup,
            batch_deadline_secs,
            page_timeout_secs,
            runner_program,
            engine,
            debug_overlay,
            verbose_logging,
            output_log_file,
            tuning,
        );
        if file.engine_command.is_some() {
            self.engine_command = file.engine_command;
        }
        if file.fixture_dir.is_some() {
            self.fixture_dir = file.fixture_dir;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_var("INPUT_ROOT") {
            self.input_root = PathBuf::from(v);
        }
        if let Some(v) = env_var("OUTPUT_ROOT") {
            self.output_root = PathBuf::from(v);
        }
        if let Some(v) = env_parse("MAX_WORKERS", "usize")? {
            self.max_workers = v;
        }
        if let Some(v) = env_bool("ENGINE_ISOLATION")? {
            self.isolation = v;
        }
        if let Some(v) = env_parse("RUNNER_PROFILE", "fast|full")? {
            self.profile = v;
        }
        if let Some(v) = env_bool("RUNNER_WARMUP")? {
            self.warmup = v;
        }
        if let Some(v) = env_parse("BATCH_DEADLINE_SECS", "u64")? {
            self.batch_deadline_secs = v;
        }
        if let Some(v) = env_parse("PAGE_TIMEOUT_SECS", "u64")? {
            self.page_timeout_secs = v;
        }
        if let Some(v) = env_var("RUNNER_PROGRAM") {
            self.runner_program = PathBuf::from(v);
        }
        if let Some(v) = env_parse("ENGINE_KIND", "fixture|command")? {
            self.engine = v;
        }
        if let Some(v) = env_var("ENGINE_COMMAND") {
            self.engine_command = Some(v);
        }
        if let Some(v) = env_var("FIXTURE_DIR") {
            self.fixture_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_bool("DEBUG_OVERLAY")? {
            self.debug_overlay = v;
        }
        if let Some(v) = env_bool("VERBOSE_LOGGING")? {
            self.verbose_logging = v;
        }
        if let Some(v) = env_var("OUTPUT_LOG_FILE") {
            self.output_log_file = v;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.max_workers = self.max_workers.clamp(1, MAX_WORKERS_LIMIT);
        if self.batch_deadline_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_deadline_secs".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.page_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "page_timeout_secs".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.engine == EngineKind::Command
            && self.engine_command.as_deref().map_or(true, |c| c.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                key: "engine_command".to_string(),
                reason: "engine = command 时必须配置引擎命令".to_string(),
            });
        }
        Ok(())
    }

    /// 实际并发数：隔离模式固定为 1
    pub fn worker_count(&self) -> usize {
        if self.isolation {
            1
        } else {
            self.max_workers.clamp(1, MAX_WORKERS_LIMIT)
        }
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_secs(self.batch_deadline_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn engine_spec(&self) -> EngineSpec {
        EngineSpec {
            kind: self.engine,
            command: self.engine_command.clone(),
            fixture_dir: self.fixture_dir.clone(),
        }
    }

    pub fn runner(&self) -> RunnerCommand {
        RunnerCommand::new(&self.runner_program, &self.engine_spec())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, expected: &str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: name.to_string(),
                value,
                expected_type: expected.to_string(),
            }),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env_var(name) {
        None => Ok(None),
        Some(value) => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| ConfigError::EnvVarParseFailed {
                var_name: name.to_string(),
                value,
                expected_type: "bool".to_string(),
            }),
    }
}

/// `1/0`、`true/false`、`yes/no`、`on/off`
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
