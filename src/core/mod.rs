mod errors;
mod file;
mod traits;
mod types;

pub use errors::{
    QueueError,
    Result,
    TransferError,
    TransferErrorKind,
    UploadError,
    ValidationError,
    ValidationErrorKind,
};
pub use file::{DiskSource, FileRef, FileSource, MemorySource};
pub use traits::{ByteProgress, ChunkEtag, Transport};
pub use types::{
    ChunkDescriptor,
    ChunkStatus,
    ItemProgress,
    QueueStats,
    TransferStrategy,
    UploadEvent,
    UploadId,
    UploadItem,
    UploadStatus,
    DEFAULT_PRIORITY,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_status_transition() {
        use UploadStatus::*;

        // valid
        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Pending));
        assert!(Error.can_transition_to(Pending));
        assert!(Uploading.can_transition_to(Cancelled));

        // invalid
        assert!(!Completed.can_transition_to(Uploading));
        assert!(!Paused.can_transition_to(Uploading));
        assert!(!Error.can_transition_to(Uploading));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_upload_id_generation() {
        let id1 = UploadId::new();
        let id2 = UploadId::new();

        assert_ne!(id1, id2);
        assert_eq!(id1, id1);
        assert!(!id1.to_string().is_empty());
    }

    #[test]
    fn test_progress_completeness() {
        let mut progress = ItemProgress::new(100, 2);
        assert!(!progress.is_complete());

        progress.bytes_transferred = 100;
        progress.chunks_completed = 2;
        assert!(progress.is_complete());
        assert_eq!(progress.percentage(), 100.0);
    }
}
