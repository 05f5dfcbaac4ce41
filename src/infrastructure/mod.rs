//! 基础设施层（Infrastructure Layer）
//!
//! 持有稀缺资源（引擎会话、子进程），只暴露"检测一页"的能力。

pub mod command_engine;
pub mod engine;
pub mod engine_client;
pub mod fixture_engine;
pub mod runner_process;

pub use engine::{
    run_detection, EngineKind, EngineOutput, EngineSpec, PredictFlags, Profile, RegionOverride,
    StructureEngine,
};
pub use engine_client::EngineClient;
pub use runner_process::RunnerCommand;
