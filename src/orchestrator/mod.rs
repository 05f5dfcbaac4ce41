//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量文档处理器
//! - 管理应用生命周期（初始化、运行）
//! - 批量加载文档（Vec<Document>）
//! - 按配置选择隔离模式或池化模式
//! - 输出全局统计信息
//!
//! ### `document_processor` - 单个文档处理器（池化模式）
//! - 构建并预热一个共享引擎
//! - Semaphore 控制在途页数
//!
//! ### `isolation_batch` - 单个文档处理器（隔离模式）
//! - 每个文档一个 `page-runner` 子进程
//! - 独立读取 stdout / stderr，截止时间到了就杀子进程
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<Document>)
//!     ↓
//! document_processor / isolation_batch (处理 Vec<PageTask>)
//!     ↓
//! workflow::PageFlow (处理单页)
//!     ↓
//! services (能力层：extract / slice / filter / write)
//!     ↓
//! infrastructure (基础设施：EngineClient / runner 子进程)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：batch_processor 管批量，document_processor / isolation_batch 管单个文档
//! 2. **资源隔离**：只有编排层创建引擎和子进程
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **无业务逻辑**：只做调度和统计，不做具体几何判断

pub mod batch_processor;
pub mod document_processor;
pub mod isolation_batch;

// 重新导出主要类型
pub use batch_processor::{App, ProcessingStats};
pub use isolation_batch::IsolationBatch;
