use tokio::sync::oneshot;
use crate::core::{FileRef, QueueError, QueueStats, UploadId, UploadItem};

type Reply<T> = oneshot::Sender<T>;

/// 发送给调度任务的命令
pub(crate) enum QueueCommand {
    Add {
        file: FileRef,
        priority: i32,
        reply: Reply<Result<UploadId, QueueError>>,
    },
    Remove {
        upload_id: UploadId,
        reply: Reply<Result<(), QueueError>>,
    },
    Cancel {
        upload_id: UploadId,
        reply: Reply<Result<(), QueueError>>,
    },
    Pause {
        upload_id: UploadId,
        reply: Reply<Result<(), QueueError>>,
    },
    Resume {
        upload_id: UploadId,
        reply: Reply<Result<(), QueueError>>,
    },
    ChangePriority {
        upload_id: UploadId,
        priority: i32,
        reply: Reply<Result<(), QueueError>>,
    },
    Retry {
        upload_id: UploadId,
        reply: Reply<Result<(), QueueError>>,
    },
    RetryFailed {
        reply: Reply<Vec<UploadId>>,
    },
    PauseAll {
        reply: Reply<usize>,
    },
    ResumeAll {
        reply: Reply<usize>,
    },
    ClearFinished {
        reply: Reply<usize>,
    },
    Process {
        reply: Reply<usize>,
    },
    Get {
        upload_id: UploadId,
        reply: Reply<Option<UploadItem>>,
    },
    Items {
        reply: Reply<Vec<UploadItem>>,
    },
    Stats {
        reply: Reply<QueueStats>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}
