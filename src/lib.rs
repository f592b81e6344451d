pub mod chunker;
pub mod config;
pub mod core;
pub mod engine;
pub mod progress;
pub mod queue;
pub mod transport;
pub mod utils;
pub mod validator;

// 重新导出核心类型
pub use core::{
    ChunkDescriptor,
    ChunkStatus,
    FileRef,
    QueueError,
    QueueStats,
    Result,
    TransferError,
    TransferErrorKind,
    Transport,
    UploadError,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadStatus,
    ValidationError,
    ValidationErrorKind,
};

pub use config::UploadConfig;
pub use engine::{EngineOutcome, EngineReport, TransferEngine};
pub use progress::{BatchProgress, ProgressSnapshot, ProgressTracker};
pub use queue::{UploadQueue, UploadQueueHandle};
pub use transport::HttpTransport;
pub use validator::{ValidationResult, Validator};
