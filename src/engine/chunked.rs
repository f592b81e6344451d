use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::chunker;
use crate::core::{ChunkDescriptor, ChunkEtag, ChunkStatus, FileRef, TransferError, TransferStrategy, Transport, UploadId};
use crate::utils::{backoff, retry_with_strategy};
use super::{emit, with_timeout, EngineOutcome, EngineReport, EngineSettings, ProgressUpdate, TransferEngine, TransferJob};

/// 工作队列中的一项：分片序号与开始前的等待时间
type WorkItem = (usize, Duration);

enum ChunkMessage {
    Started(usize),
    Finished {
        index: usize,
        result: Result<String, TransferError>,
    },
}

struct ChunkWorker {
    upload_id: UploadId,
    file: FileRef,
    /// 各分片的字节范围
    ranges: Arc<Vec<(u64, u64)>>,
    transport: Arc<dyn Transport>,
    chunk_timeout: Option<Duration>,
    work_rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    result_tx: mpsc::UnboundedSender<ChunkMessage>,
    cancellation_token: CancellationToken,
}

impl ChunkWorker {
    async fn run(self) {
        loop {
            let next = {
                let mut work_rx = self.work_rx.lock().await;
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => None,
                    item = work_rx.recv() => item,
                }
            };
            let Some((index, delay)) = next else { break };

            if !backoff(delay, &self.cancellation_token).await {
                break;
            }

            let _ = self.result_tx.send(ChunkMessage::Started(index));
            let result = self.upload(index).await;
            if self.result_tx.send(ChunkMessage::Finished { index, result }).is_err() {
                break;
            }
        }
    }

    async fn upload(&self, index: usize) -> Result<String, TransferError> {
        let (start, end) = self.ranges[index];
        let bytes: Bytes = self.file.read_range(start, end).await?;

        let call = self
            .transport
            .upload_chunk(self.upload_id, index, bytes, self.cancellation_token.clone());

        tokio::select! {
            _ = self.cancellation_token.cancelled() => Err(TransferError::cancelled()),
            result = with_timeout(self.chunk_timeout, call) => result,
        }
    }
}

/// 沿用上次保留的分片；范围与当前设置不一致时重新切分
fn prepare_chunks(previous: Option<Vec<ChunkDescriptor>>, total_bytes: u64, settings: &EngineSettings) -> Vec<ChunkDescriptor> {
    let fresh = chunker::split(total_bytes, settings.chunk_size);

    let mut chunks = match previous {
        Some(previous) if same_layout(&previous, &fresh) => previous,
        _ => fresh,
    };

    for chunk in chunks.iter_mut().filter(|chunk| !chunk.is_completed()) {
        chunk.status = ChunkStatus::Pending;
        chunk.retry_count = 0;
        chunk.etag = None;
    }
    chunks
}

fn same_layout(a: &[ChunkDescriptor], b: &[ChunkDescriptor]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.index == y.index && x.start == y.start && x.end == y.end)
}

fn completed_bytes(chunks: &[ChunkDescriptor]) -> u64 {
    chunks.iter().filter(|chunk| chunk.is_completed()).map(ChunkDescriptor::len).sum()
}

pub(super) async fn run(
    engine: &TransferEngine,
    job: TransferJob,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    cancel: CancellationToken,
) -> EngineReport {
    let TransferJob { upload_id, file, chunks } = job;
    let settings = &engine.settings;
    let total_bytes = file.size;

    let mut chunks = prepare_chunks(chunks, total_bytes, settings);
    let pending: Vec<usize> = chunks.iter().filter(|c| !c.is_completed()).map(|c| c.index).collect();
    let mut bytes_transferred = completed_bytes(&chunks);

    debug!(
        %upload_id,
        file = %file.name,
        total_chunks = chunks.len(),
        pending = pending.len(),
        "uploading in chunks"
    );

    let mut chunks_completed = chunks.len() - pending.len();
    if bytes_transferred > 0 && !cancel.is_cancelled() {
        emit(&progress_tx, ProgressUpdate {
            upload_id,
            bytes_transferred,
            total_bytes,
            chunks_completed,
            chunk: None,
        });
    }

    let mut failure: Option<TransferError> = None;

    if !pending.is_empty() {
        // 出错时只停止本文件的分片
        let workers_token = cancel.child_token();
        let (work_tx, work_rx) = mpsc::unbounded_channel::<WorkItem>();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let ranges: Arc<Vec<(u64, u64)>> = Arc::new(chunks.iter().map(|c| (c.start, c.end)).collect());

        for &index in &pending {
            let _ = work_tx.send((index, Duration::ZERO));
        }

        let worker_count = settings.max_concurrent_chunks.min(pending.len());
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|_| {
                let worker = ChunkWorker {
                    upload_id,
                    file: file.clone(),
                    ranges: ranges.clone(),
                    transport: engine.transport.clone(),
                    chunk_timeout: settings.chunk_timeout,
                    work_rx: work_rx.clone(),
                    result_tx: result_tx.clone(),
                    cancellation_token: workers_token.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(result_tx);

        let mut remaining = pending.len();
        while remaining > 0 {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = result_rx.recv() => message,
            };

            let Some(message) = message else {
                failure = Some(TransferError::io("chunk workers stopped unexpectedly"));
                break;
            };

            match message {
                ChunkMessage::Started(index) => {
                    chunks[index].status = ChunkStatus::Uploading;
                }
                ChunkMessage::Finished { index, result: Ok(etag) } => {
                    let chunk = &mut chunks[index];
                    chunk.status = ChunkStatus::Completed;
                    chunk.etag = Some(etag.clone());
                    bytes_transferred += chunk.len();
                    chunks_completed += 1;
                    remaining -= 1;

                    debug!(%upload_id, chunk = index, remaining, "chunk uploaded");
                    if !cancel.is_cancelled() {
                        emit(&progress_tx, ProgressUpdate {
                            upload_id,
                            bytes_transferred,
                            total_bytes,
                            chunks_completed,
                            chunk: Some(ChunkEtag { index, etag }),
                        });
                    }
                }
                ChunkMessage::Finished { index, result: Err(err) } => {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let chunk = &mut chunks[index];
                    chunk.status = ChunkStatus::Error;
                    chunk.retry_count += 1;

                    if err.is_retryable() && chunk.retry_count <= settings.max_chunk_retries {
                        let delay = settings.retry_strategy.get_delay(chunk.retry_count);
                        warn!(
                            %upload_id,
                            chunk = index,
                            attempt = chunk.retry_count,
                            ?delay,
                            error = %err,
                            "chunk upload failed, retrying"
                        );
                        chunk.status = ChunkStatus::Pending;
                        let _ = work_tx.send((index, delay));
                    } else {
                        failure = Some(err.with_chunk(index).with_filename(file.name.clone()));
                        break;
                    }
                }
            }
        }

        if remaining > 0 {
            workers_token.cancel();
        }
        drop(work_tx);
        join_all(handles).await;

        // 关停期间完成的分片仍然保留，但不再发送进度
        while let Ok(message) = result_rx.try_recv() {
            if let ChunkMessage::Finished { index, result: Ok(etag) } = message {
                let chunk = &mut chunks[index];
                if !chunk.is_completed() {
                    chunk.status = ChunkStatus::Completed;
                    chunk.etag = Some(etag);
                    bytes_transferred += chunk.len();
                }
            }
        }
        for chunk in chunks.iter_mut().filter(|c| c.status == ChunkStatus::Uploading) {
            chunk.status = ChunkStatus::Pending;
        }
    }

    let outcome = if cancel.is_cancelled() {
        EngineOutcome::Cancelled
    } else if let Some(err) = failure {
        EngineOutcome::Failed(err)
    } else {
        finalize(engine, upload_id, &file, &chunks, &cancel).await
    };

    EngineReport {
        outcome,
        strategy: TransferStrategy::Chunked,
        chunks: Some(chunks),
        bytes_transferred,
    }
}

async fn finalize(
    engine: &TransferEngine,
    upload_id: UploadId,
    file: &FileRef,
    chunks: &[ChunkDescriptor],
    cancel: &CancellationToken,
) -> EngineOutcome {
    let mut etags = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match &chunk.etag {
            Some(etag) => etags.push(ChunkEtag { index: chunk.index, etag: etag.clone() }),
            None => {
                return EngineOutcome::Failed(
                    TransferError::io("completed chunk has no etag")
                        .with_chunk(chunk.index)
                        .with_filename(file.name.clone()),
                );
            }
        }
    }
    etags.sort_by_key(|etag| etag.index);

    debug!(%upload_id, chunks = etags.len(), "finalizing chunks");

    let settings = &engine.settings;
    let transport = engine.transport.clone();
    let result = retry_with_strategy(
        &settings.retry_strategy,
        settings.max_chunk_retries,
        cancel,
        |attempt, err| warn!(%upload_id, attempt, error = %err, "finalize failed, retrying"),
        || {
            let transport = transport.clone();
            let etags = etags.clone();
            let cancel = cancel.clone();
            async move {
                with_timeout(settings.chunk_timeout, transport.finalize_chunks(upload_id, file, etags, cancel)).await
            }
        },
    )
    .await;

    match result {
        Ok(url) => EngineOutcome::Completed { url },
        Err(err) if err.is_cancelled() || cancel.is_cancelled() => EngineOutcome::Cancelled,
        Err(err) => EngineOutcome::Failed(err.with_filename(file.name.clone())),
    }
}
