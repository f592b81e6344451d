use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 样本
#[derive(Clone, Copy, Debug)]
struct SpeedSample {
    bytes_total: u64,
    timestamp: Instant,
}

/// 速度计算器（滑动时间窗口 + 指数平滑）
#[derive(Debug)]
pub(crate) struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    /// 历史窗口大小
    window: Duration,
    /// 最大历史记录数
    max_samples: usize,
    /// 平滑系数，越大越贴近瞬时值
    smoothing: f64,
    smoothed: Option<f64>,
}

impl SpeedCalculator {
    pub(crate) fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            window,
            max_samples: max_samples.max(2),
            smoothing: 0.3,
            smoothed: None,
        }
    }

    pub(crate) fn add_sample(&mut self, bytes_total: u64, timestamp: Instant) {
        // 字节数回退（整文件重传）时丢弃旧样本
        if let Some(last) = self.samples.back() {
            if bytes_total < last.bytes_total {
                self.reset();
            }
        }

        self.samples.push_back(SpeedSample { bytes_total, timestamp });
        self.evict(timestamp);

        if let Some(speed) = self.window_speed() {
            self.smoothed = Some(match self.smoothed {
                Some(previous) => self.smoothing * speed + (1.0 - self.smoothing) * previous,
                None => speed,
            });
        }
    }

    /// 当前平滑后的速度（字节/秒）
    ///
    /// 窗口内没有新样本时说明传输停滞，速度归零。
    pub(crate) fn speed(&self, now: Instant) -> f64 {
        match self.samples.back() {
            Some(newest) if now.saturating_duration_since(newest.timestamp) <= self.window => {
                self.smoothed.unwrap_or(0.0)
            }
            _ => 0.0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.samples.clear();
        self.smoothed = None;
    }

    fn evict(&mut self, now: Instant) {
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(oldest) if now.saturating_duration_since(oldest.timestamp) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    fn window_speed(&self) -> Option<f64> {
        let (oldest, newest) = match (self.samples.front(), self.samples.back()) {
            (Some(oldest), Some(newest)) if self.samples.len() >= 2 => (oldest, newest),
            _ => return None,
        };

        let elapsed = newest.timestamp.saturating_duration_since(oldest.timestamp).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let bytes = newest.bytes_total.saturating_sub(oldest.bytes_total);
        Some(bytes as f64 / elapsed)
    }
}
