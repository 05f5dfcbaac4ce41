pub mod anchor;
pub mod detection;
pub mod geometry;
pub mod loaders;
pub mod page;
pub mod region;

pub use anchor::{Anchor, Column, LayoutKind, LayoutObject, Strictness};
pub use detection::{DetectFailure, DetectResult, Detection, RunnerLine};
pub use geometry::BBox;
pub use loaders::{DirectoryPageSource, PageSource};
pub use page::{Document, DocumentReport, PageOutcome, PageTask};
pub use region::{Crop, ItemKind, RegionCandidate};
