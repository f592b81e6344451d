use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use super::errors::TransferError;
use super::file::FileRef;
use super::types::UploadId;

/// 字节进度回调，参数为累计已发送字节数
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// 已完成分片的标识，按 `index` 排序后交给合并接口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEtag {
    pub index: usize,
    pub etag: String,
}

/// 传输层 - 所有上传实现都必须实现此接口
///
/// 传输层对引擎来说是黑盒：只返回成功或失败。所有调用都带有取消令牌，
/// 实现应尽量在令牌触发时尽快返回 [`TransferError::cancelled`]。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 单次请求上传整个文件，返回文件地址
    async fn upload_whole(
        &self,
        upload_id: UploadId,
        file: &FileRef,
        progress: ByteProgress,
        cancel: CancellationToken,
    ) -> Result<String, TransferError>;

    /// 上传单个分片，返回服务端的 etag
    async fn upload_chunk(
        &self,
        upload_id: UploadId,
        chunk_index: usize,
        bytes: Bytes,
        cancel: CancellationToken,
    ) -> Result<String, TransferError>;

    /// 合并分片，`etags` 已按序号排好
    async fn finalize_chunks(
        &self,
        upload_id: UploadId,
        file: &FileRef,
        etags: Vec<ChunkEtag>,
        cancel: CancellationToken,
    ) -> Result<String, TransferError>;

    /// `upload_whole` 是否会调用进度回调；否则引擎使用模拟进度
    fn reports_progress(&self) -> bool {
        false
    }
}
