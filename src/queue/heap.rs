use std::cmp::Ordering;
use std::collections::BinaryHeap;
use crate::core::UploadId;

/// 等待队列中的一项
///
/// 优先级高的在前；同优先级按入队序号先进先出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: i32,
    pub seq: u64,
    pub upload_id: UploadId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 等待调度的任务
#[derive(Debug, Default)]
pub(crate) struct PendingHeap {
    heap: BinaryHeap<QueueEntry>,
}

impl PendingHeap {
    pub fn push(&mut self, upload_id: UploadId, priority: i32, seq: u64) {
        self.heap.push(QueueEntry { priority, seq, upload_id });
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    pub fn remove(&mut self, upload_id: UploadId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.upload_id != upload_id);
        self.heap.len() != before
    }

    /// 修改优先级并重新堆化
    pub fn reprioritize(&mut self, upload_id: UploadId, priority: i32) -> bool {
        let Some(entry) = self.heap.iter().find(|entry| entry.upload_id == upload_id).copied() else {
            return false;
        };
        self.remove(upload_id);
        self.push(upload_id, priority, entry.seq);
        true
    }

    pub fn contains(&self, upload_id: UploadId) -> bool {
        self.heap.iter().any(|entry| entry.upload_id == upload_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
