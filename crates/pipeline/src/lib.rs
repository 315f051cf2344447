pub mod album;
pub mod catalog;
pub mod config;
pub mod converter;
pub mod dedup;
pub mod error;
pub mod ffprobe;
pub mod fsutil;
pub mod identity;
pub mod observer;
pub mod orchestrator;
pub mod quality;
pub mod scan;
pub mod session;
pub mod workdir;

pub use album::{Album, MusicFile, NonMusicFile};
pub use catalog::{Catalog, CatalogRecord, HistoryEntry, HistoryStatus, JsonCatalog, Operation};
pub use config::{ConversionMode, PipelineConfig};
pub use converter::{ConversionOutcome, Converter, FfmpegConverter};
pub use dedup::DeduplicationManager;
pub use error::{PipelineError, Result};
pub use identity::{ContentHasher, SidecarRecord};
pub use observer::{LogObserver, PipelineObserver};
pub use orchestrator::{AlbumOutcome, PipelineOrchestrator, PlanEntry, RunOptions, RunSummary};
pub use quality::{HigherQualityBehavior, PcmFormat};
pub use scan::AlbumScanner;
pub use session::{
    AlbumConversionState, AlbumStatus, ConversionSession, FileStatus, ProcessingStage, SessionStateStore,
};
pub use workdir::{DiskSpace, SystemDiskSpace, WorkingDirectoryManager};
