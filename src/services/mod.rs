//! 业务能力层（Services Layer）
//!
//! 每个服务只描述"我能对一页做什么"，不持有引擎，也不关心流程顺序。

pub mod anchor_extractor;
pub mod debug_overlay;
pub mod outcome_writer;
pub mod payload_walker;
pub mod post_filter;
pub mod region_slicer;

pub use anchor_extractor::{AnchorExtractor, AnchorTuning, Extraction, ExtractionTrace};
pub use outcome_writer::OutcomeWriter;
pub use post_filter::{number_crops, FilterTuning, PostFilter};
pub use region_slicer::{RegionSlicer, SliceOutcome, SliceTuning};
