use std::fmt;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use super::errors::TransferError;
use super::file::FileRef;

/// 默认优先级
pub const DEFAULT_PRIORITY: i32 = 5;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中（在队列中）
    Pending,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    pub const ALL: [UploadStatus; 6] = [
        UploadStatus::Pending,
        UploadStatus::Uploading,
        UploadStatus::Paused,
        UploadStatus::Completed,
        UploadStatus::Error,
        UploadStatus::Cancelled,
    ];

    /// 状态机允许的迁移
    ///
    /// `Paused -> Pending` 与 `Error -> Pending` 是仅有的回退路径，
    /// 恢复后重新进入调度器而不是直接进入 `Uploading`。
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Uploading, Completed)
                | (Uploading, Error)
                | (Uploading, Cancelled)
                | (Uploading, Paused)
                | (Paused, Pending)
                | (Paused, Cancelled)
                | (Error, Pending)
        )
    }

    /// 终态：不再占用调度资源
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

/// 文件中一段连续的字节区间 `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChunkDescriptor {
    /// 分片序号，服务端按此重组
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub retry_count: u32,
    /// 服务端返回的分片标识，合并时需要
    pub etag: Option<String>,
}

impl ChunkDescriptor {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            status: ChunkStatus::Pending,
            retry_count: 0,
            etag: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChunkStatus::Completed
    }
}

/// 上传策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStrategy {
    /// 单次请求上传整个文件
    Whole,
    /// 分片上传后合并
    Chunked,
}

/// 任务进度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemProgress {
    /// 已上传字节数
    pub bytes_transferred: u64,
    /// 总字节数
    pub total_bytes: u64,
    /// 已完成分片数
    pub chunks_completed: usize,
    /// 总分片数
    pub total_chunks: usize,
    /// 开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 完成时间
    pub completed_at: Option<DateTime<Utc>>,
}

impl ItemProgress {
    pub fn new(total_bytes: u64, total_chunks: usize) -> Self {
        Self {
            bytes_transferred: 0,
            total_bytes,
            chunks_completed: 0,
            total_chunks,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.chunks_completed == self.total_chunks { 100.0 } else { 0.0 };
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.total_bytes && self.chunks_completed == self.total_chunks
    }
}

/// 一个文件的完整上传生命周期
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub id: UploadId,
    pub file: FileRef,
    /// 数值越大越先上传
    pub priority: i32,
    pub status: UploadStatus,
    pub strategy: TransferStrategy,
    pub progress: ItemProgress,
    /// 仅分片策略下存在
    pub chunks: Option<Vec<ChunkDescriptor>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 仅在 `Error` 状态下存在
    pub last_error: Option<TransferError>,
    /// 入队时间，同优先级下按先进先出
    pub queued_at: DateTime<Utc>,
    /// 上传完成后的地址
    pub url: Option<String>,
}

impl UploadItem {
    pub fn file_name(&self) -> &str {
        &self.file.name
    }

    pub fn can_retry(&self) -> bool {
        self.status == UploadStatus::Error && self.retry_count < self.max_retries
    }
}

/// 队列计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub uploading: usize,
    pub paused: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.uploading + self.paused + self.completed + self.error + self.cancelled
    }

    pub fn count(&self, status: UploadStatus) -> usize {
        match status {
            UploadStatus::Pending => self.pending,
            UploadStatus::Uploading => self.uploading,
            UploadStatus::Paused => self.paused,
            UploadStatus::Completed => self.completed,
            UploadStatus::Error => self.error,
            UploadStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn slot_mut(&mut self, status: UploadStatus) -> &mut usize {
        match status {
            UploadStatus::Pending => &mut self.pending,
            UploadStatus::Uploading => &mut self.uploading,
            UploadStatus::Paused => &mut self.paused,
            UploadStatus::Completed => &mut self.completed,
            UploadStatus::Error => &mut self.error,
            UploadStatus::Cancelled => &mut self.cancelled,
        }
    }
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务已加入队列
    Added {
        upload_id: UploadId,
        file_name: String,
    },
    /// 状态变更
    StateChanged {
        upload_id: UploadId,
        old_state: UploadStatus,
        new_state: UploadStatus,
    },
    /// 进度更新
    Progress {
        upload_id: UploadId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// 任务完成
    Completed {
        upload_id: UploadId,
        url: String,
    },
    /// 任务失败
    Failed {
        upload_id: UploadId,
        error: TransferError,
    },
    /// 任务已从队列移除
    Removed {
        upload_id: UploadId,
    },
    /// 队列中没有等待或上传中的任务
    Drained {
        completed: usize,
        failed: usize,
        elapsed: Duration,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> Option<UploadId> {
        match self {
            UploadEvent::Added { upload_id, .. }
            | UploadEvent::StateChanged { upload_id, .. }
            | UploadEvent::Progress { upload_id, .. }
            | UploadEvent::Completed { upload_id, .. }
            | UploadEvent::Failed { upload_id, .. }
            | UploadEvent::Removed { upload_id } => Some(*upload_id),
            UploadEvent::Drained { .. } => None,
        }
    }
}

// 静态断言确保类型是 Send 的
const _: () = {
    fn assert_send<T: Send + Sync>() {}
    fn assert_types() {
        assert_send::<UploadItem>();
        assert_send::<UploadEvent>();
        assert_send::<ChunkDescriptor>();
    }
};
