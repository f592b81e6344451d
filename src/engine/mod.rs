//! 单个文件的传输：选择策略、并发分片、重试与合并

mod chunked;
mod whole;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use crate::chunker;
use crate::config::UploadConfig;
use crate::core::{ChunkDescriptor, ChunkEtag, FileRef, TransferError, TransferStrategy, Transport, UploadId};
use crate::utils::RetryStrategy;

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chunk_size: u64,
    pub chunk_threshold: u64,
    pub max_concurrent_chunks: usize,
    pub max_chunk_retries: u32,
    pub chunk_timeout: Option<Duration>,
    pub item_timeout: Option<Duration>,
    pub retry_strategy: RetryStrategy,
}

impl From<&UploadConfig> for EngineSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            chunk_threshold: config.chunk_threshold,
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
            max_chunk_retries: config.max_chunk_retries,
            chunk_timeout: config.chunk_timeout,
            item_timeout: config.item_timeout,
            retry_strategy: config.retry_strategy.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

/// 引擎发出的进度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub upload_id: UploadId,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 已完成的分片数，整文件上传时为 0
    pub chunks_completed: usize,
    /// 刚完成的分片
    pub chunk: Option<ChunkEtag>,
}

/// 一次传输的输入
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub upload_id: UploadId,
    pub file: FileRef,
    /// 上次失败或暂停时保留的分片，已完成的分片不会重传
    pub chunks: Option<Vec<ChunkDescriptor>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    Completed { url: String },
    Failed(TransferError),
    Cancelled,
}

/// 一次传输的结果
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub outcome: EngineOutcome,
    pub strategy: TransferStrategy,
    /// 仅分片策略下存在
    pub chunks: Option<Vec<ChunkDescriptor>>,
    pub bytes_transferred: u64,
}

impl EngineReport {
    pub fn chunks_completed(&self) -> usize {
        match &self.chunks {
            Some(chunks) => chunks.iter().filter(|chunk| chunk.is_completed()).count(),
            None => usize::from(matches!(self.outcome, EngineOutcome::Completed { .. })),
        }
    }
}

/// 传输引擎
#[derive(Clone)]
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    settings: EngineSettings,
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn Transport>, settings: EngineSettings) -> Self {
        Self { transport, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 超过阈值使用分片上传
    pub fn strategy_for(&self, total_bytes: u64) -> TransferStrategy {
        if total_bytes > self.settings.chunk_threshold {
            TransferStrategy::Chunked
        } else {
            TransferStrategy::Whole
        }
    }

    /// 分片数，整文件上传视为 1 片
    pub fn chunk_count(&self, total_bytes: u64) -> usize {
        match self.strategy_for(total_bytes) {
            TransferStrategy::Whole => 1,
            TransferStrategy::Chunked => chunker::chunk_count(total_bytes, self.settings.chunk_size),
        }
    }

    /// 执行传输，直到完成、失败或被取消
    ///
    /// 进度通过 `progress_tx` 非阻塞发送，通道满时直接丢弃。
    /// 取消后不会再发送任何进度。
    pub async fn run(
        &self,
        job: TransferJob,
        progress_tx: mpsc::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> EngineReport {
        let upload_id = job.upload_id;
        let file_name = job.file.name.clone();

        let report = match self.settings.item_timeout {
            None => self.execute(job, progress_tx, cancel.clone()).await,
            Some(limit) => {
                let attempt = cancel.child_token();
                let execution = self.execute(job, progress_tx, attempt.clone());
                tokio::pin!(execution);

                tokio::select! {
                    report = &mut execution => report,
                    _ = sleep(limit) => {
                        attempt.cancel();
                        let mut report = execution.await;
                        if report.outcome == EngineOutcome::Cancelled && !cancel.is_cancelled() {
                            warn!(%upload_id, file = %file_name, ?limit, "upload timed out");
                            report.outcome = EngineOutcome::Failed(
                                TransferError::timeout(format!("upload did not finish within {limit:?}"))
                                    .with_filename(file_name.clone()),
                            );
                        }
                        report
                    }
                }
            }
        };

        match &report.outcome {
            EngineOutcome::Completed { url } => info!(%upload_id, file = %file_name, %url, "upload completed"),
            EngineOutcome::Failed(err) => warn!(%upload_id, file = %file_name, error = %err, "upload failed"),
            EngineOutcome::Cancelled => info!(%upload_id, file = %file_name, "upload cancelled"),
        }

        report
    }

    async fn execute(
        &self,
        job: TransferJob,
        progress_tx: mpsc::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> EngineReport {
        match self.strategy_for(job.file.size) {
            TransferStrategy::Whole => whole::run(self, job, progress_tx, cancel).await,
            TransferStrategy::Chunked => chunked::run(self, job, progress_tx, cancel).await,
        }
    }
}

/// 为一次调用加上超时
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, future: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    match limit {
        None => future.await,
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::timeout(format!("no response within {limit:?}"))),
        },
    }
}

/// 非阻塞发送进度，通道满时丢弃
pub(crate) fn emit(progress_tx: &mpsc::Sender<ProgressUpdate>, update: ProgressUpdate) {
    let _ = progress_tx.try_send(update);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use crate::core::{ByteProgress, ChunkEtag, ChunkStatus};

    /// 按调用序号决定分片成败的传输层
    #[derive(Default)]
    struct ScriptedTransport {
        /// (分片序号, 失败次数)
        failures: Mutex<Vec<(usize, u32)>>,
        chunk_calls: AtomicUsize,
        finalized: Mutex<Option<Vec<ChunkEtag>>>,
        whole_calls: AtomicUsize,
        fail_whole: bool,
        hang: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn upload_whole(
            &self,
            _upload_id: UploadId,
            file: &FileRef,
            _progress: ByteProgress,
            cancel: CancellationToken,
        ) -> Result<String, TransferError> {
            self.whole_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                cancel.cancelled().await;
                return Err(TransferError::cancelled());
            }
            if self.fail_whole {
                return Err(TransferError::server(500, "boom"));
            }
            Ok(format!("mem://{}", file.name))
        }

        async fn upload_chunk(
            &self,
            _upload_id: UploadId,
            chunk_index: usize,
            _bytes: Bytes,
            cancel: CancellationToken,
        ) -> Result<String, TransferError> {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                cancel.cancelled().await;
                return Err(TransferError::cancelled());
            }
            let mut failures = self.failures.lock();
            if let Some((_, remaining)) = failures.iter_mut().find(|(index, n)| *index == chunk_index && *n > 0) {
                *remaining -= 1;
                return Err(TransferError::network("connection reset"));
            }
            Ok(format!("etag-{chunk_index}"))
        }

        async fn finalize_chunks(
            &self,
            _upload_id: UploadId,
            file: &FileRef,
            etags: Vec<ChunkEtag>,
            _cancel: CancellationToken,
        ) -> Result<String, TransferError> {
            *self.finalized.lock() = Some(etags);
            Ok(format!("mem://{}", file.name))
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            chunk_size: 100,
            chunk_threshold: 100,
            max_concurrent_chunks: 2,
            max_chunk_retries: 3,
            chunk_timeout: None,
            item_timeout: None,
            retry_strategy: RetryStrategy::immediate(),
        }
    }

    fn job(size: usize) -> TransferJob {
        TransferJob {
            upload_id: UploadId::new(),
            file: FileRef::from_bytes("data.bin", vec![7u8; size]),
            chunks: None,
        }
    }

    #[test]
    fn test_strategy_threshold() {
        let engine = TransferEngine::new(Arc::new(ScriptedTransport::default()), settings());
        assert_eq!(engine.strategy_for(100), TransferStrategy::Whole);
        assert_eq!(engine.strategy_for(101), TransferStrategy::Chunked);
        assert_eq!(engine.chunk_count(50), 1);
        assert_eq!(engine.chunk_count(250), 3);
    }

    #[tokio::test]
    async fn test_whole_file_snaps_to_total() {
        let transport = Arc::new(ScriptedTransport::default());
        let engine = TransferEngine::new(transport.clone(), settings());
        let (progress_tx, mut progress_rx) = mpsc::channel(64);

        let report = engine.run(job(60), progress_tx, CancellationToken::new()).await;

        assert_eq!(report.outcome, EngineOutcome::Completed { url: "mem://data.bin".into() });
        assert_eq!(report.strategy, TransferStrategy::Whole);
        assert!(report.chunks.is_none());
        assert_eq!(report.bytes_transferred, 60);

        let mut last = None;
        while let Ok(update) = progress_rx.try_recv() {
            last = Some(update.bytes_transferred);
        }
        assert_eq!(last, Some(60));
    }

    #[tokio::test]
    async fn test_whole_file_retries_then_fails() {
        let transport = Arc::new(ScriptedTransport {
            fail_whole: true,
            ..Default::default()
        });
        let engine = TransferEngine::new(transport.clone(), settings());
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let report = engine.run(job(10), progress_tx, CancellationToken::new()).await;

        assert!(matches!(report.outcome, EngineOutcome::Failed(ref err) if err.status_code == Some(500)));
        assert_eq!(transport.whole_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_chunk_updates_carry_running_count() {
        let transport = Arc::new(ScriptedTransport::default());
        let engine = TransferEngine::new(transport, settings());
        let (progress_tx, mut progress_rx) = mpsc::channel(64);

        engine.run(job(450), progress_tx, CancellationToken::new()).await;

        let mut updates = Vec::new();
        while let Ok(update) = progress_rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(updates.len(), 5);
        for (i, update) in updates.iter().enumerate() {
            assert_eq!(update.chunks_completed, i + 1);
            let chunk = update.chunk.as_ref().unwrap();
            assert_eq!(chunk.etag, format!("etag-{}", chunk.index));
        }
        assert_eq!(updates[4].bytes_transferred, 450);
    }

    #[tokio::test]
    async fn test_chunked_finalizes_in_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let engine = TransferEngine::new(transport.clone(), settings());
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let report = engine.run(job(450), progress_tx, CancellationToken::new()).await;

        assert!(matches!(report.outcome, EngineOutcome::Completed { .. }));
        assert_eq!(report.bytes_transferred, 450);
        assert_eq!(report.chunks_completed(), 5);

        let etags = transport.finalized.lock().clone().unwrap();
        let indices: Vec<usize> = etags.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(etags[3].etag, "etag-3");
    }

    #[tokio::test]
    async fn test_chunk_retry_count_recorded() {
        let transport = Arc::new(ScriptedTransport {
            failures: Mutex::new(vec![(1, 2)]),
            ..Default::default()
        });
        let engine = TransferEngine::new(transport.clone(), settings());
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let report = engine.run(job(300), progress_tx, CancellationToken::new()).await;

        assert!(matches!(report.outcome, EngineOutcome::Completed { .. }));
        let chunks = report.chunks.unwrap();
        assert_eq!(chunks[1].retry_count, 2);
        assert_eq!(chunks[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_chunk_keeps_completed_chunks() {
        let transport = Arc::new(ScriptedTransport {
            failures: Mutex::new(vec![(2, 10)]),
            ..Default::default()
        });
        let engine = TransferEngine::new(transport.clone(), EngineSettings {
            max_concurrent_chunks: 1,
            ..settings()
        });
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let report = engine.run(job(400), progress_tx, CancellationToken::new()).await;

        match &report.outcome {
            EngineOutcome::Failed(err) => assert_eq!(err.chunk_index, Some(2)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(transport.finalized.lock().is_none());

        let chunks = report.chunks.unwrap();
        assert_eq!(chunks[2].retry_count, 4);
        assert!(chunks[0].is_completed());
        assert!(chunks[1].is_completed());
        assert!(chunks.iter().all(|c| c.status != ChunkStatus::Uploading));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_chunks() {
        let transport = Arc::new(ScriptedTransport::default());
        let engine = TransferEngine::new(transport.clone(), settings());
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let mut job = job(300);
        let mut chunks = chunker::split(300, 100);
        chunks[0].status = ChunkStatus::Completed;
        chunks[0].etag = Some("etag-0".into());
        chunks[1].status = ChunkStatus::Error;
        job.chunks = Some(chunks);

        let report = engine.run(job, progress_tx, CancellationToken::new()).await;

        assert!(matches!(report.outcome, EngineOutcome::Completed { .. }));
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.finalized.lock().as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_skips_finalize() {
        let transport = Arc::new(ScriptedTransport {
            hang: true,
            ..Default::default()
        });
        let engine = TransferEngine::new(transport.clone(), settings());
        let (progress_tx, _progress_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(job(500), progress_tx, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let report = run.await.unwrap();

        assert_eq!(report.outcome, EngineOutcome::Cancelled);
        assert!(transport.finalized.lock().is_none());
        assert!(transport.chunk_calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_item_timeout_fails() {
        let transport = Arc::new(ScriptedTransport {
            hang: true,
            ..Default::default()
        });
        let engine = TransferEngine::new(transport, EngineSettings {
            item_timeout: Some(Duration::from_millis(30)),
            ..settings()
        });
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let report = engine.run(job(50), progress_tx, CancellationToken::new()).await;
        assert!(matches!(report.outcome, EngineOutcome::Failed(ref err) if err.kind == crate::core::TransferErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_chunk_timeout_takes_retry_path() {
        let transport = Arc::new(ScriptedTransport {
            hang: true,
            ..Default::default()
        });
        let engine = TransferEngine::new(transport.clone(), EngineSettings {
            chunk_timeout: Some(Duration::from_millis(10)),
            max_chunk_retries: 1,
            max_concurrent_chunks: 1,
            ..settings()
        });
        let (progress_tx, _progress_rx) = mpsc::channel(64);

        let report = engine.run(job(200), progress_tx, CancellationToken::new()).await;

        assert!(matches!(report.outcome, EngineOutcome::Failed(ref err) if err.kind == crate::core::TransferErrorKind::Timeout));
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 2);
    }
}
