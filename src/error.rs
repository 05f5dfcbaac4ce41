use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 失败阶段标识，贯穿 runner 协议、日志与错误旁路文件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// 引擎不可用（未安装、初始化失败）
    EngineUnavailable,
    /// 页面图片解码失败
    ImageLoadFailed,
    /// 引擎调用抛错
    PredictFailed,
    /// 引擎结果不含预期字段
    PayloadShapeInvalid,
    /// 所有几何层级都没有锚点
    ZeroAnchors,
    /// 栏内区域重叠无法消解
    SliceConflict,
    /// 子进程在产出可用结果前失败
    BatchFatal,
    /// 单页处理中的兜底错误
    ProcessPage,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::EngineUnavailable => "engine-unavailable",
            Stage::ImageLoadFailed => "image-load-failed",
            Stage::PredictFailed => "predict-failed",
            Stage::PayloadShapeInvalid => "payload-shape-invalid",
            Stage::ZeroAnchors => "zero-anchors",
            Stage::SliceConflict => "slice-conflict",
            Stage::BatchFatal => "batch-fatal",
            Stage::ProcessPage => "process-page",
        }
    }

    /// 解析 runner 输出里的阶段字符串，未知值归为 `ProcessPage`
    pub fn from_wire(s: &str) -> Self {
        match s {
            "engine-unavailable" => Stage::EngineUnavailable,
            "image-load-failed" => Stage::ImageLoadFailed,
            "predict-failed" => Stage::PredictFailed,
            "payload-shape-invalid" => Stage::PayloadShapeInvalid,
            "zero-anchors" => Stage::ZeroAnchors,
            "slice-conflict" => Stage::SliceConflict,
            "batch-fatal" => Stage::BatchFatal,
            _ => Stage::ProcessPage,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 引擎适配层返回的封闭错误类别
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineFault {
    #[error("引擎不可用: {0}")]
    Unavailable(String),
    #[error("图片解码失败: {0}")]
    ImageLoad(String),
    #[error("引擎预测失败: {0}")]
    Predict(String),
    #[error("引擎结果结构无效: {0}")]
    PayloadShape(String),
    /// 原生运行时不兼容，可以换一次性子进程重试
    #[error("原生运行时不兼容: {0}")]
    RuntimeIncompatible(String),
}

impl EngineFault {
    pub fn stage(&self) -> Stage {
        match self {
            EngineFault::Unavailable(_) => Stage::EngineUnavailable,
            EngineFault::ImageLoad(_) => Stage::ImageLoadFailed,
            EngineFault::Predict(_) | EngineFault::RuntimeIncompatible(_) => Stage::PredictFailed,
            EngineFault::PayloadShape(_) => Stage::PayloadShapeInvalid,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EngineFault::Unavailable(m)
            | EngineFault::ImageLoad(m)
            | EngineFault::Predict(m)
            | EngineFault::PayloadShape(m)
            | EngineFault::RuntimeIncompatible(m) => m,
        }
    }
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("引擎错误: {0}")]
    Engine(#[from] EngineFault),

    #[error("runner 错误: {0}")]
    Runner(#[from] RunnerError),

    #[error("文件错误: {0}")]
    File(#[from] FileError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("图片处理失败: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("错误: {0}")]
    Other(String),
}

/// 隔离子进程相关错误
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("无法启动 runner ({program}): {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("runner 在 {secs} 秒内没有输出")]
    DeadlineExceeded { secs: u64 },
    #[error("runner 致命错误 stage={stage}: {message}")]
    Fatal { stage: String, message: String },
    #[error("runner 没有输出任何可解析的 JSON 行")]
    EmptyOutput,
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    #[error("目录不存在: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    #[error("无效的配置项 {key}: {reason}")]
    Invalid { key: String, reason: String },
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件读取错误
    pub fn file_read_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建 runner 启动失败错误
    pub fn runner_spawn_failed(program: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Runner(RunnerError::SpawnFailed {
            program: program.into(),
            source,
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
