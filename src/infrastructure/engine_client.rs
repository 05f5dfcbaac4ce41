//! 引擎客户端 - 基础设施层
//!
//! 对上只暴露一个能力：`detect(page) -> 检测结果 | (阶段, 消息)`。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{EngineFault, Stage};
use crate::infrastructure::engine::{
    run_detection, PredictFlags, Profile, RegionOverride, StructureEngine,
};
use crate::infrastructure::runner_process::{
    RunnerCommand, ONE_SHOT_FALLBACK_TIMEOUT, ONE_SHOT_RETRY_TIMEOUT,
};
use crate::models::{DetectFailure, DetectResult};

/// 池化模式下单页引擎调用的默认时限
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(240);

/// 引擎客户端
///
/// - `InProcess`：持有已预热的引擎，多个 worker 共享；运行时不兼容时回退到一次性子进程。
///   单页超过 `timeout` 即终止引擎，后续页面随之快速失败
/// - `Isolated`：每次调用都是一次性子进程（批处理的主路径不走这里）
#[derive(Clone)]
pub enum EngineClient {
    InProcess {
        engine: Arc<dyn StructureEngine>,
        profile: Profile,
        fallback: Option<RunnerCommand>,
        timeout: Duration,
    },
    Isolated {
        runner: RunnerCommand,
        profile: Profile,
    },
}

impl EngineClient {
    pub fn in_process(
        engine: Arc<dyn StructureEngine>,
        profile: Profile,
        fallback: Option<RunnerCommand>,
    ) -> Self {
        EngineClient::InProcess {
            engine,
            profile,
            fallback,
            timeout: DEFAULT_PAGE_TIMEOUT,
        }
    }

    /// 设置单页时限（仅对 `InProcess` 生效）
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        if let EngineClient::InProcess { timeout, .. } = &mut self {
            *timeout = limit;
        }
        self
    }

    pub fn isolated(runner: RunnerCommand, profile: Profile) -> Self {
        EngineClient::Isolated { runner, profile }
    }

    pub fn profile(&self) -> Profile {
        match self {
            EngineClient::InProcess { profile, .. } | EngineClient::Isolated { profile, .. } => {
                *profile
            }
        }
    }

    /// 预热共享引擎
    pub async fn warm_up(&self) -> Result<(), EngineFault> {
        match self {
            EngineClient::InProcess {
                engine, profile, ..
            } => {
                let engine = engine.clone();
                let flags = PredictFlags::for_profile(*profile, RegionOverride::Auto);
                tokio::task::spawn_blocking(move || engine.warm_up(&flags))
                    .await
                    .map_err(|e| EngineFault::Unavailable(format!("预热任务异常: {}", e)))?
            }
            EngineClient::Isolated { .. } => Ok(()),
        }
    }

    /// 检测一页
    pub async fn detect(&self, image: &Path, region: RegionOverride) -> DetectResult {
        match self {
            EngineClient::InProcess {
                engine,
                profile,
                fallback,
                timeout,
            } => {
                let worker = engine.clone();
                let profile = *profile;
                let path = image.to_path_buf();
                let flags = PredictFlags::for_profile(profile, region);

                let task = tokio::task::spawn_blocking(move || {
                    run_detection(worker.as_ref(), &path, &flags, profile)
                });
                let outcome = match tokio::time::timeout(*timeout, task).await {
                    Ok(joined) => joined.map_err(|e| {
                        DetectFailure::new(Stage::PredictFailed, format!("检测任务异常: {}", e))
                    })?,
                    Err(_) => {
                        warn!(
                            "⏱️ 引擎 {} 超过 {}s 未返回，终止引擎: {}",
                            engine.name(),
                            timeout.as_secs(),
                            image.display()
                        );
                        engine.abort();
                        return Err(DetectFailure::new(
                            Stage::PredictFailed,
                            format!("引擎调用超时（{}s）", timeout.as_secs()),
                        ));
                    }
                };

                match (outcome, fallback) {
                    (Ok(detection), _) => Ok(detection),
                    (Err(EngineFault::RuntimeIncompatible(msg)), Some(runner)) => {
                        warn!(
                            "⚠️ 运行时不兼容，改用一次性子进程重试: {}",
                            crate::utils::logging::truncate_text(&msg, 120)
                        );
                        runner
                            .one_shot(image, profile, region, ONE_SHOT_FALLBACK_TIMEOUT)
                            .await
                    }
                    (Err(fault), _) => Err(fault.into()),
                }
            }
            EngineClient::Isolated { runner, profile } => {
                runner
                    .one_shot(image, *profile, region, ONE_SHOT_RETRY_TIMEOUT)
                    .await
            }
        }
    }
}
