use std::fmt;
use serde::Serialize;
use thiserror::Error;
use crate::validator::Diagnostic;
use super::types::{UploadId, UploadStatus};

/// 校验失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationErrorKind {
    TooLarge,
    InvalidType,
    InvalidFilename,
    ContentMismatch,
    SecurityFlagged,
    /// 调用方提供的自定义校验器给出的拒绝
    Custom,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationErrorKind::TooLarge => "too-large",
            ValidationErrorKind::InvalidType => "invalid-type",
            ValidationErrorKind::InvalidFilename => "invalid-filename",
            ValidationErrorKind::ContentMismatch => "content-mismatch",
            ValidationErrorKind::SecurityFlagged => "security-flagged",
            ValidationErrorKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// 准入阶段被拒绝，任务不会被创建
#[derive(Error, Debug, Clone)]
#[error("{filename} rejected ({kind}): {message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
    pub filename: String,
    /// 全部阻断性诊断
    pub diagnostics: Vec<Diagnostic>,
}

/// 传输失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferErrorKind {
    Network,
    Server,
    Cancelled,
    Timeout,
    /// 读取本地文件失败
    Io,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferErrorKind::Network => "network",
            TransferErrorKind::Server => "server",
            TransferErrorKind::Cancelled => "cancelled",
            TransferErrorKind::Timeout => "timeout",
            TransferErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
    /// HTTP 状态码（如果有）
    pub status_code: Option<u16>,
    pub filename: Option<String>,
    pub chunk_index: Option<usize>,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (status {code})")?;
        }
        if let Some(index) = self.chunk_index {
            write!(f, " [chunk {index}]")?;
        }
        if let Some(name) = &self.filename {
            write!(f, " [{name}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransferError {}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            filename: None,
            chunk_index: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Network, message)
    }

    pub fn server(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            ..Self::new(TransferErrorKind::Server, message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(TransferErrorKind::Cancelled, "transfer was cancelled")
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Io, message)
    }

    pub fn with_chunk(mut self, index: usize) -> Self {
        self.chunk_index = Some(index);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TransferErrorKind::Cancelled
    }

    /// 网络、服务端与超时错误走分片重试路径
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransferErrorKind::Network | TransferErrorKind::Server | TransferErrorKind::Timeout
        )
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::io(err.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            TransferError::server(status.as_u16(), err.to_string())
        } else {
            TransferError::network(err.to_string())
        }
    }
}

/// 队列操作错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Upload {0} not found")]
    NotFound(UploadId),

    #[error("Cannot {operation} upload {upload_id} in state {state}")]
    InvalidOperation {
        upload_id: UploadId,
        operation: &'static str,
        state: UploadStatus,
    },

    #[error("Queue is full ({max_files} files)")]
    Full { max_files: usize },

    #[error("Retry limit reached for upload {upload_id} ({max_retries} retries)")]
    RetryLimit { upload_id: UploadId, max_retries: u32 },

    #[error("Queue shut down")]
    Shutdown,
}

impl QueueError {
    pub fn invalid(upload_id: UploadId, operation: &'static str, state: UploadStatus) -> Self {
        Self::InvalidOperation { upload_id, operation, state }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for UploadError {
    fn from(err: toml::de::Error) -> Self {
        UploadError::Config(err.to_string())
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
