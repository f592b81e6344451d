//! 跨任务的进度聚合：百分比、吞吐量与剩余时间

mod speed;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::core::UploadId;
use speed::SpeedCalculator;

/// 速度窗口
const SPEED_WINDOW: Duration = Duration::from_secs(5);
const MAX_SAMPLES: usize = 32;

/// 某一时刻的进度快照，只会被替换，不会被修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub percentage: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 平滑后的吞吐量（字节/秒）
    pub speed: f64,
    /// 从开始到现在的平均速度（字节/秒）
    pub average_speed: f64,
    /// 预计剩余时间，`None` 表示未知
    pub eta: Option<Duration>,
    pub is_complete: bool,
}

impl ProgressSnapshot {
    fn build(bytes_transferred: u64, total_bytes: u64, speed: f64, average_speed: f64) -> Self {
        let percentage = if total_bytes > 0 {
            (bytes_transferred as f64 / total_bytes as f64) * 100.0
        } else {
            100.0
        };

        let remaining = total_bytes.saturating_sub(bytes_transferred);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else if average_speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / average_speed))
        } else {
            None
        };

        Self {
            percentage,
            bytes_transferred,
            total_bytes,
            speed,
            average_speed,
            eta,
            is_complete: remaining == 0,
        }
    }
}

/// 单个任务的进度
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub upload_id: UploadId,
    pub snapshot: ProgressSnapshot,
}

/// 聚合统计信息
#[derive(Debug, Clone, Serialize)]
pub struct OverallProgress {
    /// 总任务数
    pub total_tasks: usize,
    /// 未完成的任务数
    pub active_tasks: usize,
    /// 所有任务合并后的快照，速度为各任务之和
    pub snapshot: ProgressSnapshot,
}

/// 批量进度更新
#[derive(Debug, Clone)]
pub struct BatchProgress {
    /// 更新时间戳
    pub timestamp: Instant,
    /// 各个任务进度
    pub tasks: Vec<TaskProgress>,
    /// 聚合统计信息
    pub overall: OverallProgress,
}

struct TaskTracker {
    total_bytes: u64,
    bytes_transferred: u64,
    start_time: Instant,
    speed: SpeedCalculator,
}

impl TaskTracker {
    fn new(total_bytes: u64, now: Instant) -> Self {
        let mut speed = SpeedCalculator::new(SPEED_WINDOW, MAX_SAMPLES);
        speed.add_sample(0, now);

        Self {
            total_bytes,
            bytes_transferred: 0,
            start_time: now,
            speed,
        }
    }

    fn record(&mut self, bytes_transferred: u64, at: Instant) {
        let bytes = bytes_transferred.min(self.total_bytes);
        self.bytes_transferred = bytes;
        self.speed.add_sample(bytes, at);
    }

    fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.start_time).as_secs_f64();
        let average_speed = if elapsed > 0.0 {
            self.bytes_transferred as f64 / elapsed
        } else {
            0.0
        };
        let speed = if self.bytes_transferred >= self.total_bytes {
            0.0
        } else {
            self.speed.speed(now)
        };

        ProgressSnapshot::build(self.bytes_transferred, self.total_bytes, speed, average_speed)
    }
}

/// 进度聚合器
///
/// 每个任务有独立的锁，快照总是在同一把锁下读取字节数与速度，
/// 不会看到更新了一半的任务。
#[derive(Default)]
pub struct ProgressTracker {
    registry: RwLock<HashMap<UploadId, Arc<Mutex<TaskTracker>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新任务，已存在时重置
    pub fn register(&self, upload_id: UploadId, total_bytes: u64) {
        let tracker = TaskTracker::new(total_bytes, Instant::now());
        self.registry.write().insert(upload_id, Arc::new(Mutex::new(tracker)));
    }

    /// 注销任务
    pub fn unregister(&self, upload_id: UploadId) {
        self.registry.write().remove(&upload_id);
    }

    pub fn is_tracking(&self, upload_id: UploadId) -> bool {
        self.registry.read().contains_key(&upload_id)
    }

    /// 更新任务的累计字节数
    pub fn update(&self, upload_id: UploadId, bytes_transferred: u64) {
        self.record(upload_id, bytes_transferred, Instant::now());
    }

    /// 在指定时刻记录累计字节数
    pub fn record(&self, upload_id: UploadId, bytes_transferred: u64, at: Instant) {
        let tracker = self.registry.read().get(&upload_id).cloned();
        if let Some(tracker) = tracker {
            tracker.lock().record(bytes_transferred, at);
        }
    }

    /// 直接置为完成
    pub fn complete(&self, upload_id: UploadId) {
        let tracker = self.registry.read().get(&upload_id).cloned();
        if let Some(tracker) = tracker {
            let mut guard = tracker.lock();
            let total = guard.total_bytes;
            guard.record(total, Instant::now());
        }
    }

    pub fn snapshot(&self, upload_id: UploadId) -> Option<ProgressSnapshot> {
        self.snapshot_at(upload_id, Instant::now())
    }

    pub fn snapshot_at(&self, upload_id: UploadId, now: Instant) -> Option<ProgressSnapshot> {
        let tracker = self.registry.read().get(&upload_id).cloned()?;
        let snapshot = tracker.lock().snapshot(now);
        Some(snapshot)
    }

    pub fn overall(&self) -> OverallProgress {
        self.batch_at(Instant::now()).overall
    }

    pub fn batch(&self) -> BatchProgress {
        self.batch_at(Instant::now())
    }

    pub fn batch_at(&self, now: Instant) -> BatchProgress {
        let trackers: Vec<(UploadId, Arc<Mutex<TaskTracker>>)> = self
            .registry
            .read()
            .iter()
            .map(|(id, tracker)| (*id, tracker.clone()))
            .collect();

        let mut tasks = Vec::with_capacity(trackers.len());
        let mut total_bytes = 0u64;
        let mut total_transferred = 0u64;
        let mut total_speed = 0.0;
        let mut total_average = 0.0;
        let mut active_tasks = 0;

        for (upload_id, tracker) in trackers {
            let snapshot = tracker.lock().snapshot(now);

            total_bytes += snapshot.total_bytes;
            total_transferred += snapshot.bytes_transferred;
            total_speed += snapshot.speed;
            total_average += snapshot.average_speed;
            if !snapshot.is_complete {
                active_tasks += 1;
            }

            tasks.push(TaskProgress { upload_id, snapshot });
        }

        let overall = OverallProgress {
            total_tasks: tasks.len(),
            active_tasks,
            snapshot: ProgressSnapshot::build(total_transferred, total_bytes, total_speed, total_average),
        };

        BatchProgress {
            timestamp: now,
            tasks,
            overall,
        }
    }

    /// 启动定时汇报，只在有未完成任务时发送
    pub fn start(self: Arc<Self>, update_interval: Duration, batch_tx: mpsc::UnboundedSender<BatchProgress>) -> ProgressReporterHandle {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let tracker = self.clone();

        let reporter_handle = tokio::spawn(async move {
            let mut ticker = interval(update_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let batch = tracker.batch();
                        if batch.overall.active_tasks == 0 {
                            continue;
                        }
                        if batch_tx.send(batch).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        ProgressReporterHandle {
            tracker: self,
            cancellation_token,
            reporter_handle,
        }
    }
}

/// 定时汇报句柄
pub struct ProgressReporterHandle {
    pub tracker: Arc<ProgressTracker>,
    cancellation_token: CancellationToken,
    reporter_handle: JoinHandle<()>,
}

impl ProgressReporterHandle {
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.reporter_handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_and_eta() {
        let tracker = ProgressTracker::new();
        let id = UploadId::new();
        tracker.register(id, 1000);

        let start = Instant::now();
        tracker.record(id, 100, start + Duration::from_secs(1));
        tracker.record(id, 300, start + Duration::from_secs(2));

        let snapshot = tracker.snapshot_at(id, start + Duration::from_secs(2)).unwrap();
        assert_eq!(snapshot.bytes_transferred, 300);
        assert_eq!(snapshot.percentage, 30.0);
        assert!(snapshot.speed > 0.0);
        assert!(snapshot.eta.is_some());
        assert!(!snapshot.is_complete);
    }

    #[test]
    fn test_eta_unknown_without_throughput() {
        let tracker = ProgressTracker::new();
        let id = UploadId::new();
        tracker.register(id, 1000);

        let snapshot = tracker.snapshot(id).unwrap();
        assert_eq!(snapshot.bytes_transferred, 0);
        assert_eq!(snapshot.eta, None);
    }

    #[test]
    fn test_bytes_clamped_to_total() {
        let tracker = ProgressTracker::new();
        let id = UploadId::new();
        tracker.register(id, 500);
        tracker.update(id, 9000);

        let snapshot = tracker.snapshot(id).unwrap();
        assert_eq!(snapshot.bytes_transferred, 500);
        assert!(snapshot.is_complete);
        assert_eq!(snapshot.eta, Some(Duration::ZERO));
    }

    #[test]
    fn test_overall_aggregates_tasks() {
        let tracker = ProgressTracker::new();
        let a = UploadId::new();
        let b = UploadId::new();
        tracker.register(a, 1000);
        tracker.register(b, 3000);

        tracker.update(a, 1000);
        tracker.update(b, 1000);

        let overall = tracker.overall();
        assert_eq!(overall.total_tasks, 2);
        assert_eq!(overall.active_tasks, 1);
        assert_eq!(overall.snapshot.total_bytes, 4000);
        assert_eq!(overall.snapshot.bytes_transferred, 2000);
        assert_eq!(overall.snapshot.percentage, 50.0);

        tracker.complete(b);
        assert!(tracker.overall().snapshot.is_complete);

        tracker.unregister(a);
        assert!(!tracker.is_tracking(a));
        assert_eq!(tracker.overall().total_tasks, 1);
    }

    #[tokio::test]
    async fn test_reporter_sends_batches_for_active_tasks() {
        let tracker = Arc::new(ProgressTracker::new());
        let id = UploadId::new();
        tracker.register(id, 100);
        tracker.update(id, 40);

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let handle = tracker.clone().start(Duration::from_millis(10), batch_tx);

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].upload_id, id);
        assert_eq!(batch.overall.snapshot.bytes_transferred, 40);

        handle.shutdown().await;
    }
}
