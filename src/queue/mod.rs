//! 上传队列：优先级调度、并发上限、暂停/恢复/取消/重试
//!
//! 队列状态只由一个调度任务持有，句柄通过消息与它通信。

mod command;
mod heap;
mod worker;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use crate::config::UploadConfig;
use crate::core::{FileRef, QueueError, QueueStats, Result, Transport, UploadError, UploadEvent, UploadId, UploadItem};
use crate::engine::{EngineSettings, TransferEngine};
use crate::progress::ProgressTracker;
use crate::validator::{ValidationResult, ValidationRules, Validator};
use command::QueueCommand;
use worker::QueueWorker;

/// 命令通道容量
const COMMAND_BUFFER: usize = 100;
/// 事件缓存
const EVENT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct UploadQueue {
    command_tx: mpsc::Sender<QueueCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    validator: Arc<Validator>,
    tracker: Arc<ProgressTracker>,
    default_priority: i32,
}

/// 队列句柄 - 包含队列和调度任务
pub struct UploadQueueHandle {
    pub queue: UploadQueue,
    pub worker_handle: JoinHandle<()>,
}

impl UploadQueueHandle {
    /// 取消所有上传并等待调度任务退出
    pub async fn shutdown(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.queue.command_tx.send(QueueCommand::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        drop(self.queue);
        self.worker_handle
            .await
            .map_err(|err| UploadError::Config(format!("queue worker panicked: {err}")))
    }
}

impl UploadQueue {
    /// 使用默认校验规则创建队列
    pub fn new(transport: Arc<dyn Transport>, config: UploadConfig) -> Result<UploadQueueHandle> {
        let validator = Validator::new(ValidationRules::from(&config));
        Self::with_validator(transport, config, validator)
    }

    /// 使用自定义校验器创建队列
    pub fn with_validator(
        transport: Arc<dyn Transport>,
        config: UploadConfig,
        validator: Validator,
    ) -> Result<UploadQueueHandle> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let tracker = Arc::new(ProgressTracker::new());
        let engine = TransferEngine::new(transport, EngineSettings::from(&config));
        let default_priority = config.priority;

        let worker_handle = tokio::spawn(QueueWorker::run(
            engine,
            config,
            tracker.clone(),
            command_rx,
            event_tx.clone(),
        ));

        let queue = Self {
            command_tx,
            event_tx,
            validator: Arc::new(validator),
            tracker,
            default_priority,
        };

        Ok(UploadQueueHandle { queue, worker_handle })
    }

    /// 校验后以默认优先级加入队列
    pub async fn add(&self, file: FileRef) -> Result<UploadId> {
        self.add_with_priority(file, self.default_priority).await
    }

    /// 校验后加入队列；被拒绝的文件不会创建任务
    pub async fn add_with_priority(&self, file: FileRef, priority: i32) -> Result<UploadId> {
        if let Err(err) = self.validator.admit(&file).await {
            warn!(file = %file.name, kind = %err.kind, reason = %err.message, "file rejected");
            return Err(err.into());
        }

        let upload_id = self.request(|reply| QueueCommand::Add { file, priority, reply }).await??;
        Ok(upload_id)
    }

    /// 批量加入，每个文件独立返回结果
    pub async fn add_batch(&self, files: Vec<FileRef>) -> Vec<Result<UploadId>> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            results.push(self.add(file).await);
        }
        results
    }

    /// 只做校验，不入队
    pub async fn validate(&self, file: &FileRef) -> ValidationResult {
        self.validator.validate(file).await
    }

    /// 移除任务；上传中的任务会先被取消，结束后移除
    pub async fn remove(&self, upload_id: UploadId) -> Result<()> {
        Ok(self.request(|reply| QueueCommand::Remove { upload_id, reply }).await??)
    }

    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        Ok(self.request(|reply| QueueCommand::Cancel { upload_id, reply }).await??)
    }

    /// 暂停，已完成的分片会保留
    pub async fn pause(&self, upload_id: UploadId) -> Result<()> {
        Ok(self.request(|reply| QueueCommand::Pause { upload_id, reply }).await??)
    }

    pub async fn resume(&self, upload_id: UploadId) -> Result<()> {
        Ok(self.request(|reply| QueueCommand::Resume { upload_id, reply }).await??)
    }

    pub async fn change_priority(&self, upload_id: UploadId, priority: i32) -> Result<()> {
        Ok(self
            .request(|reply| QueueCommand::ChangePriority { upload_id, priority, reply })
            .await??)
    }

    /// 重试单个失败的任务
    pub async fn retry(&self, upload_id: UploadId) -> Result<()> {
        Ok(self.request(|reply| QueueCommand::Retry { upload_id, reply }).await??)
    }

    /// 重试所有未超过重试次数的失败任务，返回被重新排队的任务
    pub async fn retry_failed(&self) -> Result<Vec<UploadId>> {
        self.request(|reply| QueueCommand::RetryFailed { reply }).await
    }

    /// 暂停所有等待与上传中的任务，并停止调度
    pub async fn pause_all(&self) -> Result<usize> {
        self.request(|reply| QueueCommand::PauseAll { reply }).await
    }

    /// 恢复所有暂停的任务并重新开始调度
    pub async fn resume_all(&self) -> Result<usize> {
        self.request(|reply| QueueCommand::ResumeAll { reply }).await
    }

    /// 清理已完成与已取消的任务
    pub async fn clear_finished(&self) -> Result<usize> {
        self.request(|reply| QueueCommand::ClearFinished { reply }).await
    }

    /// 立即调度，返回本次开始上传的任务数
    pub async fn process(&self) -> Result<usize> {
        self.request(|reply| QueueCommand::Process { reply }).await
    }

    pub async fn get(&self, upload_id: UploadId) -> Result<Option<UploadItem>> {
        self.request(|reply| QueueCommand::Get { upload_id, reply }).await
    }

    /// 所有任务，按入队顺序
    pub async fn items(&self) -> Result<Vec<UploadItem>> {
        self.request(|reply| QueueCommand::Items { reply }).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.request(|reply| QueueCommand::Stats { reply }).await
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        self.tracker.clone()
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// 订阅事件
    ///
    /// 接收太慢会丢失事件（lagged）。
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F>
    where
        F: Fn(&UploadEvent) -> bool,
    {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> QueueCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| QueueError::Shutdown)?;

        reply_rx.await.map_err(|_| QueueError::Shutdown.into())
    }
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> std::result::Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
