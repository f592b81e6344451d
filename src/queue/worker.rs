use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::chunker;
use crate::config::UploadConfig;
use crate::core::{
    ChunkStatus, FileRef, ItemProgress, QueueError, QueueStats, TransferError, TransferStrategy, UploadEvent, UploadId, UploadItem, UploadStatus,
};
use crate::engine::{EngineOutcome, EngineReport, ProgressUpdate, TransferEngine, TransferJob};
use crate::progress::ProgressTracker;
use super::command::QueueCommand;
use super::heap::PendingHeap;

/// 合并成功之前展示的字节数始终低于总量，`Completed` 时才补齐
fn visible_bytes(bytes_transferred: u64, total_bytes: u64) -> u64 {
    bytes_transferred.min(total_bytes.saturating_sub(1))
}

struct TaskHandle {
    item: UploadItem,
    /// 入队序号，同优先级先进先出
    seq: u64,
    cancellation_token: Option<CancellationToken>,
    /// 上传结束后移除
    pending_removal: bool,
}

/// 一轮排空的统计
#[derive(Default)]
struct DrainState {
    started_at: Option<Instant>,
    completed: usize,
    failed: usize,
}

pub(crate) struct QueueWorker {
    engine: TransferEngine,
    config: UploadConfig,
    tasks: HashMap<UploadId, TaskHandle>,
    heap: PendingHeap,
    /// 占用并发槽位的任务，直到引擎返回结果才释放
    running: HashMap<UploadId, CancellationToken>,
    stats: QueueStats,
    /// 暂停调度（`pause_all` 或 `pause_on_error`）
    scheduling_paused: bool,
    next_seq: u64,
    drain: DrainState,

    tracker: Arc<ProgressTracker>,
    event_tx: broadcast::Sender<UploadEvent>,
    report_tx: mpsc::UnboundedSender<(UploadId, EngineReport)>,
    report_rx: mpsc::UnboundedReceiver<(UploadId, EngineReport)>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    progress_rx: mpsc::Receiver<ProgressUpdate>,
    clear_tx: mpsc::UnboundedSender<UploadId>,
    clear_rx: mpsc::UnboundedReceiver<UploadId>,
}

impl QueueWorker {
    pub(crate) async fn run(
        engine: TransferEngine,
        config: UploadConfig,
        tracker: Arc<ProgressTracker>,
        mut command_rx: mpsc::Receiver<QueueCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::channel(config.progress_buffer.max(1));
        let (clear_tx, clear_rx) = mpsc::unbounded_channel();

        let mut worker = Self {
            engine,
            config,
            tasks: HashMap::new(),
            heap: PendingHeap::default(),
            running: HashMap::new(),
            stats: QueueStats::default(),
            scheduling_paused: false,
            next_seq: 0,
            drain: DrainState::default(),
            tracker,
            event_tx,
            report_tx,
            report_rx,
            progress_tx,
            progress_rx,
            clear_tx,
            clear_rx,
        };

        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(QueueCommand::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => worker.handle_command(command),
                    None => break,
                },
                Some((upload_id, report)) = worker.report_rx.recv() => {
                    worker.handle_report(upload_id, report);
                }
                Some(update) = worker.progress_rx.recv() => {
                    worker.handle_progress(update);
                }
                Some(upload_id) = worker.clear_rx.recv() => {
                    worker.handle_auto_clear(upload_id);
                }
            }

            worker.process();
            worker.check_drained();
        }

        worker.stop();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Add { file, priority, reply } => {
                let _ = reply.send(self.add(file, priority));
            }
            QueueCommand::Remove { upload_id, reply } => {
                let _ = reply.send(self.remove(upload_id));
            }
            QueueCommand::Cancel { upload_id, reply } => {
                let _ = reply.send(self.cancel(upload_id));
            }
            QueueCommand::Pause { upload_id, reply } => {
                let _ = reply.send(self.pause(upload_id));
            }
            QueueCommand::Resume { upload_id, reply } => {
                let _ = reply.send(self.resume(upload_id));
            }
            QueueCommand::ChangePriority { upload_id, priority, reply } => {
                let _ = reply.send(self.change_priority(upload_id, priority));
            }
            QueueCommand::Retry { upload_id, reply } => {
                let _ = reply.send(self.retry(upload_id));
            }
            QueueCommand::RetryFailed { reply } => {
                let _ = reply.send(self.retry_failed());
            }
            QueueCommand::PauseAll { reply } => {
                let _ = reply.send(self.pause_all());
            }
            QueueCommand::ResumeAll { reply } => {
                let _ = reply.send(self.resume_all());
            }
            QueueCommand::ClearFinished { reply } => {
                let _ = reply.send(self.clear_finished());
            }
            QueueCommand::Process { reply } => {
                let _ = reply.send(self.process());
            }
            QueueCommand::Get { upload_id, reply } => {
                let item = self.tasks.get(&upload_id).map(|handle| handle.item.clone());
                let _ = reply.send(item);
            }
            QueueCommand::Items { reply } => {
                let mut items: Vec<(u64, UploadItem)> = self
                    .tasks
                    .values()
                    .map(|handle| (handle.seq, handle.item.clone()))
                    .collect();
                items.sort_by_key(|(seq, _)| *seq);
                let _ = reply.send(items.into_iter().map(|(_, item)| item).collect());
            }
            QueueCommand::Stats { reply } => {
                let _ = reply.send(self.stats);
            }
            QueueCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn add(&mut self, file: FileRef, priority: i32) -> Result<UploadId, QueueError> {
        if let Some(max_files) = self.config.max_files {
            let active = self.tasks.values().filter(|h| !h.item.status.is_terminal()).count();
            if active >= max_files {
                warn!(file = %file.name, max_files, "queue is full");
                return Err(QueueError::Full { max_files });
            }
        }

        let upload_id = UploadId::new();
        let strategy = self.engine.strategy_for(file.size);
        let total_chunks = self.engine.chunk_count(file.size);
        let item = UploadItem {
            id: upload_id,
            progress: ItemProgress::new(file.size, total_chunks),
            file,
            priority,
            status: UploadStatus::Pending,
            strategy,
            chunks: None,
            retry_count: 0,
            max_retries: self.config.max_retries,
            last_error: None,
            queued_at: Utc::now(),
            url: None,
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        debug!(%upload_id, file = %item.file.name, priority, ?strategy, "upload queued");
        let _ = self.event_tx.send(UploadEvent::Added {
            upload_id,
            file_name: item.file.name.clone(),
        });

        self.tasks.insert(upload_id, TaskHandle {
            item,
            seq,
            cancellation_token: None,
            pending_removal: false,
        });
        *self.stats.slot_mut(UploadStatus::Pending) += 1;
        self.heap.push(upload_id, priority, seq);

        Ok(upload_id)
    }

    fn remove(&mut self, upload_id: UploadId) -> Result<(), QueueError> {
        let handle = self.tasks.get_mut(&upload_id).ok_or(QueueError::NotFound(upload_id))?;

        if self.running.contains_key(&upload_id) {
            // 先取消，结束后再移除
            handle.pending_removal = true;
            if let Some(token) = &handle.cancellation_token {
                token.cancel();
            }
            if handle.item.status != UploadStatus::Cancelled {
                self.set_status(upload_id, UploadStatus::Cancelled);
            }
            return Ok(());
        }

        self.evict(upload_id);
        Ok(())
    }

    fn cancel(&mut self, upload_id: UploadId) -> Result<(), QueueError> {
        let handle = self.tasks.get(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        let status = handle.item.status;
        if !status.can_transition_to(UploadStatus::Cancelled) {
            return Err(QueueError::invalid(upload_id, "cancel", status));
        }

        if let Some(token) = &handle.cancellation_token {
            token.cancel();
        }
        self.heap.remove(upload_id);
        self.set_status(upload_id, UploadStatus::Cancelled);
        self.tracker.unregister(upload_id);
        info!(%upload_id, "upload cancelled");
        Ok(())
    }

    fn pause(&mut self, upload_id: UploadId) -> Result<(), QueueError> {
        let handle = self.tasks.get(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        let status = handle.item.status;
        if !status.can_transition_to(UploadStatus::Paused) {
            return Err(QueueError::invalid(upload_id, "pause", status));
        }

        if let Some(token) = &handle.cancellation_token {
            token.cancel();
        }
        self.heap.remove(upload_id);
        self.set_status(upload_id, UploadStatus::Paused);
        debug!(%upload_id, "upload paused");
        Ok(())
    }

    fn resume(&mut self, upload_id: UploadId) -> Result<(), QueueError> {
        let handle = self.tasks.get(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        let status = handle.item.status;
        if status != UploadStatus::Paused {
            return Err(QueueError::invalid(upload_id, "resume", status));
        }

        self.enqueue(upload_id);
        debug!(%upload_id, "upload resumed");
        Ok(())
    }

    fn change_priority(&mut self, upload_id: UploadId, priority: i32) -> Result<(), QueueError> {
        let handle = self.tasks.get_mut(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        let status = handle.item.status;
        if !matches!(status, UploadStatus::Pending | UploadStatus::Paused | UploadStatus::Error) {
            return Err(QueueError::invalid(upload_id, "change priority of", status));
        }

        handle.item.priority = priority;
        self.heap.reprioritize(upload_id, priority);
        debug!(%upload_id, priority, "priority changed");
        Ok(())
    }

    fn retry(&mut self, upload_id: UploadId) -> Result<(), QueueError> {
        let handle = self.tasks.get_mut(&upload_id).ok_or(QueueError::NotFound(upload_id))?;
        let status = handle.item.status;
        if status != UploadStatus::Error {
            return Err(QueueError::invalid(upload_id, "retry", status));
        }
        if !handle.item.can_retry() {
            return Err(QueueError::RetryLimit {
                upload_id,
                max_retries: handle.item.max_retries,
            });
        }

        handle.item.retry_count += 1;
        handle.item.last_error = None;
        info!(%upload_id, attempt = handle.item.retry_count, "retrying upload");
        self.enqueue(upload_id);
        Ok(())
    }

    fn retry_failed(&mut self) -> Vec<UploadId> {
        let mut candidates: Vec<(u64, UploadId)> = self
            .tasks
            .values()
            .filter(|handle| handle.item.can_retry())
            .map(|handle| (handle.seq, handle.item.id))
            .collect();
        candidates.sort_by_key(|(seq, _)| *seq);

        candidates
            .into_iter()
            .filter_map(|(_, upload_id)| self.retry(upload_id).ok().map(|_| upload_id))
            .collect()
    }

    fn pause_all(&mut self) -> usize {
        self.scheduling_paused = true;
        let ids: Vec<UploadId> = self
            .tasks
            .values()
            .filter(|h| matches!(h.item.status, UploadStatus::Pending | UploadStatus::Uploading))
            .map(|h| h.item.id)
            .collect();
        ids.into_iter().filter(|id| self.pause(*id).is_ok()).count()
    }

    fn resume_all(&mut self) -> usize {
        self.scheduling_paused = false;
        let mut ids: Vec<(u64, UploadId)> = self
            .tasks
            .values()
            .filter(|h| h.item.status == UploadStatus::Paused)
            .map(|h| (h.seq, h.item.id))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().filter(|(_, id)| self.resume(*id).is_ok()).count()
    }

    fn clear_finished(&mut self) -> usize {
        let ids: Vec<UploadId> = self
            .tasks
            .values()
            .filter(|h| h.item.status.is_terminal() && !self.running.contains_key(&h.item.id))
            .map(|h| h.item.id)
            .collect();
        let count = ids.len();
        for upload_id in ids {
            self.evict(upload_id);
        }
        count
    }

    /// 在有空闲槽位时按优先级提升等待中的任务，返回提升的数量
    fn process(&mut self) -> usize {
        if self.scheduling_paused {
            return 0;
        }

        let mut promoted = 0;
        let mut deferred = Vec::new();

        while self.running.len() < self.config.max_concurrent {
            let Some(entry) = self.heap.pop() else { break };

            // 暂停后立即恢复的任务，上一轮传输可能还没结束
            if self.running.contains_key(&entry.upload_id) {
                deferred.push(entry);
                continue;
            }

            let pending = self
                .tasks
                .get(&entry.upload_id)
                .is_some_and(|h| h.item.status == UploadStatus::Pending);
            if pending {
                self.start_upload(entry.upload_id);
                promoted += 1;
            }
        }

        for entry in deferred {
            self.heap.push(entry.upload_id, entry.priority, entry.seq);
        }

        promoted
    }

    fn start_upload(&mut self, upload_id: UploadId) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else { return };

        let cancellation_token = CancellationToken::new();
        handle.cancellation_token = Some(cancellation_token.clone());
        if handle.item.strategy == TransferStrategy::Chunked && handle.item.chunks.is_none() {
            handle.item.chunks = Some(chunker::split(handle.item.file.size, self.engine.settings().chunk_size));
        }
        handle.item.progress.started_at = Some(Utc::now());
        handle.item.progress.completed_at = None;

        let job = TransferJob {
            upload_id,
            file: handle.item.file.clone(),
            chunks: handle.item.chunks.clone(),
        };
        let total_bytes = handle.item.file.size;
        let resumed_bytes = handle.item.progress.bytes_transferred;

        debug!(
            %upload_id,
            file = %job.file.name,
            priority = handle.item.priority,
            resumed_bytes,
            "promoting upload"
        );

        self.tracker.register(upload_id, total_bytes);
        if resumed_bytes > 0 {
            self.tracker.update(upload_id, resumed_bytes);
        }
        self.running.insert(upload_id, cancellation_token.clone());
        self.set_status(upload_id, UploadStatus::Uploading);
        self.drain.started_at.get_or_insert_with(Instant::now);

        let engine = self.engine.clone();
        let progress_tx = self.progress_tx.clone();
        let report_tx = self.report_tx.clone();
        let strategy = engine.strategy_for(total_bytes);

        tokio::spawn(async move {
            let transfer = tokio::spawn(async move { engine.run(job, progress_tx, cancellation_token).await });
            let report = match transfer.await {
                Ok(report) => report,
                Err(err) => EngineReport {
                    outcome: EngineOutcome::Failed(TransferError::io(format!("upload task panicked: {err}"))),
                    strategy,
                    chunks: None,
                    bytes_transferred: 0,
                },
            };
            let _ = report_tx.send((upload_id, report));
        });
    }

    fn handle_report(&mut self, upload_id: UploadId, report: EngineReport) {
        self.running.remove(&upload_id);

        let Some(handle) = self.tasks.get_mut(&upload_id) else { return };
        handle.cancellation_token = None;

        let chunks_completed = report.chunks_completed();
        if report.chunks.is_some() {
            handle.item.chunks = report.chunks;
        }
        // 整文件上传无法续传，未完成时从零开始
        handle.item.progress.bytes_transferred = match report.strategy {
            TransferStrategy::Chunked => visible_bytes(report.bytes_transferred, handle.item.progress.total_bytes),
            TransferStrategy::Whole => 0,
        };
        handle.item.progress.chunks_completed = chunks_completed;

        if handle.pending_removal {
            self.evict(upload_id);
            return;
        }

        let status = handle.item.status;
        match report.outcome {
            EngineOutcome::Completed { url } if status != UploadStatus::Cancelled => {
                // 暂停指令晚于传输完成时，以完成为准
                self.heap.remove(upload_id);
                self.complete(upload_id, url);
            }
            EngineOutcome::Failed(err) if status == UploadStatus::Uploading => {
                self.fail(upload_id, err);
            }
            EngineOutcome::Cancelled if status == UploadStatus::Uploading => {
                self.set_status(upload_id, UploadStatus::Cancelled);
                self.tracker.unregister(upload_id);
            }
            _ => {
                debug!(%upload_id, %status, "transfer ended after state change");
            }
        }
    }

    fn complete(&mut self, upload_id: UploadId, url: String) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else { return };

        let progress = &mut handle.item.progress;
        progress.bytes_transferred = progress.total_bytes;
        progress.chunks_completed = progress.total_chunks;
        progress.completed_at = Some(Utc::now());
        let total_bytes = progress.total_bytes;
        handle.item.url = Some(url.clone());
        handle.item.last_error = None;

        // 最后一次进度可能晚于结果到达并被丢弃，这里补发 100%
        let _ = self.event_tx.send(UploadEvent::Progress {
            upload_id,
            bytes_transferred: total_bytes,
            total_bytes,
        });
        self.tracker.complete(upload_id);
        self.set_status(upload_id, UploadStatus::Completed);
        self.drain.completed += 1;
        let _ = self.event_tx.send(UploadEvent::Completed { upload_id, url });

        if let Some(delay) = self.config.auto_clear_after {
            let clear_tx = self.clear_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = clear_tx.send(upload_id);
            });
        }
    }

    fn fail(&mut self, upload_id: UploadId, error: TransferError) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else { return };
        handle.item.last_error = Some(error.clone());
        let can_retry = handle.item.retry_count < handle.item.max_retries;

        self.set_status(upload_id, UploadStatus::Error);
        // 重试时 start_upload 会重新注册
        self.tracker.unregister(upload_id);
        self.drain.failed += 1;
        let _ = self.event_tx.send(UploadEvent::Failed { upload_id, error });

        if self.config.auto_retry && can_retry {
            let _ = self.retry(upload_id);
        } else if self.config.pause_on_error {
            warn!(%upload_id, "pausing queue after failure");
            self.scheduling_paused = true;
        }
    }

    fn handle_progress(&mut self, update: ProgressUpdate) {
        let Some(handle) = self.tasks.get_mut(&update.upload_id) else { return };
        // 暂停或取消后到达的进度直接丢弃
        if handle.item.status != UploadStatus::Uploading {
            return;
        }

        let progress = &mut handle.item.progress;
        let bytes = visible_bytes(update.bytes_transferred, progress.total_bytes);
        progress.bytes_transferred = bytes;
        if handle.item.strategy == TransferStrategy::Chunked {
            progress.chunks_completed = update.chunks_completed.min(progress.total_chunks);
        }
        if let (Some(done), Some(chunks)) = (update.chunk, handle.item.chunks.as_mut()) {
            if let Some(chunk) = chunks.get_mut(done.index) {
                chunk.status = ChunkStatus::Completed;
                chunk.etag = Some(done.etag);
            }
        }
        self.tracker.update(update.upload_id, bytes);
        let _ = self.event_tx.send(UploadEvent::Progress {
            upload_id: update.upload_id,
            bytes_transferred: bytes,
            total_bytes: update.total_bytes,
        });
    }

    fn handle_auto_clear(&mut self, upload_id: UploadId) {
        let completed = self
            .tasks
            .get(&upload_id)
            .is_some_and(|h| h.item.status == UploadStatus::Completed);
        if completed {
            debug!(%upload_id, "auto clearing completed upload");
            self.evict(upload_id);
        }
    }

    fn check_drained(&mut self) {
        let Some(started_at) = self.drain.started_at else { return };
        if self.stats.pending > 0 || !self.running.is_empty() {
            return;
        }

        let drain = std::mem::take(&mut self.drain);
        let elapsed = started_at.elapsed();
        info!(completed = drain.completed, failed = drain.failed, ?elapsed, "queue drained");
        let _ = self.event_tx.send(UploadEvent::Drained {
            completed: drain.completed,
            failed: drain.failed,
            elapsed,
        });
    }

    /// 回到等待状态并加入堆
    fn enqueue(&mut self, upload_id: UploadId) {
        let Some(handle) = self.tasks.get(&upload_id) else { return };
        let (priority, seq) = (handle.item.priority, handle.seq);
        self.set_status(upload_id, UploadStatus::Pending);
        self.heap.push(upload_id, priority, seq);
    }

    /// 直接从表中删除
    fn evict(&mut self, upload_id: UploadId) {
        let Some(handle) = self.tasks.remove(&upload_id) else { return };
        self.heap.remove(upload_id);
        *self.stats.slot_mut(handle.item.status) -= 1;
        self.tracker.unregister(upload_id);
        debug!(%upload_id, "upload removed");
        let _ = self.event_tx.send(UploadEvent::Removed { upload_id });
    }

    /// 修改状态并维护计数
    fn set_status(&mut self, upload_id: UploadId, new_state: UploadStatus) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else { return };
        let old_state = handle.item.status;
        if old_state == new_state {
            return;
        }

        handle.item.status = new_state;
        *self.stats.slot_mut(old_state) -= 1;
        *self.stats.slot_mut(new_state) += 1;

        if new_state == UploadStatus::Error || new_state == UploadStatus::Completed || new_state == UploadStatus::Cancelled {
            info!(%upload_id, from = %old_state, to = %new_state, "upload finished");
        }
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            upload_id,
            old_state,
            new_state,
        });
    }

    fn stop(&mut self) {
        for token in self.running.values() {
            token.cancel();
        }
        debug!(running = self.running.len(), "upload queue stopped");
    }
}

