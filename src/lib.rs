//! # Page Cutter
//!
//! 把渲染好的双栏试卷页面图切成一题一张的小图
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（引擎会话、子进程），只暴露检测能力
//! - `EngineClient` - `detect(page) -> 检测结果 | (阶段, 消息)`
//! - `RunnerCommand` - 启动 `page-runner` 隔离子进程
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能对一页做什么"
//! - `AnchorExtractor` - 引擎结果 → 题号锚点 + 版面对象
//! - `RegionSlicer` - 锚点 → 按栏切出的区域
//! - `PostFilter` - 去重、截断、垃圾过滤
//! - `OutcomeWriter` - 写裁剪图与失败旁路文件
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一页"的完整处理流程
//! - `PageCtx` - 上下文封装（文档名 + 页任务）
//! - `PageFlow` - 流程编排（extract → retry → slice → filter → write）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批量文档处理器
//! - `orchestrator/document_processor` - 池化模式，共享引擎
//! - `orchestrator/isolation_batch` - 隔离模式，每个文档一个子进程
//!
//! `runner` 模块是 `page-runner` 子进程一侧的逻辑。
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod runner;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, Stage};
pub use infrastructure::{EngineClient, Profile};
pub use models::{Document, PageOutcome, PageTask};
pub use orchestrator::{App, ProcessingStats};
pub use utils::CancelToken;
pub use workflow::{PageCtx, PageFlow};
