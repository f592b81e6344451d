use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::core::{ByteProgress, TransferStrategy, UploadId};
use crate::utils::retry_with_strategy;
use super::{emit, with_timeout, EngineOutcome, EngineReport, ProgressUpdate, TransferEngine, TransferJob};

/// 模拟进度的刷新间隔
const SIMULATED_TICK: Duration = Duration::from_millis(100);
/// 模拟进度在传输层返回前的上限
const SIMULATED_CEILING: f64 = 0.95;

/// 模拟进度曲线：`total * 0.95 * (1 - e^(-t/τ))`，单调且不会到达 100%
///
/// τ 按 2 MiB/s 估算，至少 1 秒。
pub(crate) fn simulated_bytes(total_bytes: u64, elapsed: Duration) -> u64 {
    let tau = 1.0 + total_bytes as f64 / (2.0 * 1024.0 * 1024.0);
    let fraction = SIMULATED_CEILING * (1.0 - (-elapsed.as_secs_f64() / tau).exp());
    let bytes = (total_bytes as f64 * fraction) as u64;
    bytes.min(total_bytes.saturating_sub(1))
}

fn byte_update(upload_id: UploadId, bytes_transferred: u64, total_bytes: u64) -> ProgressUpdate {
    ProgressUpdate {
        upload_id,
        bytes_transferred,
        total_bytes,
        chunks_completed: 0,
        chunk: None,
    }
}

pub(super) async fn run(
    engine: &TransferEngine,
    job: TransferJob,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    cancel: CancellationToken,
) -> EngineReport {
    let TransferJob { upload_id, file, .. } = job;
    let total_bytes = file.size;
    let settings = &engine.settings;

    // 只向前推进，取消后不再发送
    let reported = Arc::new(AtomicU64::new(0));
    let progress: ByteProgress = {
        let reported = reported.clone();
        let progress_tx = progress_tx.clone();
        let cancel = cancel.clone();
        Arc::new(move |bytes: u64| {
            if cancel.is_cancelled() {
                return;
            }
            let bytes = bytes.min(total_bytes);
            if reported.fetch_max(bytes, Ordering::AcqRel) < bytes {
                emit(&progress_tx, byte_update(upload_id, bytes, total_bytes));
            }
        })
    };

    debug!(%upload_id, file = %file.name, total_bytes, "uploading whole file");

    let transport = engine.transport.clone();
    let upload = retry_with_strategy(
        &settings.retry_strategy,
        settings.max_chunk_retries,
        &cancel,
        |attempt, err| warn!(%upload_id, attempt, error = %err, "whole-file upload failed, retrying"),
        || {
            let transport = transport.clone();
            let file = file.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            async move {
                with_timeout(settings.chunk_timeout, transport.upload_whole(upload_id, &file, progress, cancel)).await
            }
        },
    );
    tokio::pin!(upload);

    let result = if engine.transport.reports_progress() {
        upload.await
    } else {
        let started = Instant::now();
        let mut ticker = interval(SIMULATED_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut upload => break result,
                _ = ticker.tick() => progress(simulated_bytes(total_bytes, started.elapsed())),
            }
        }
    };

    let outcome = match result {
        Ok(url) => {
            reported.store(total_bytes, Ordering::Release);
            emit(&progress_tx, byte_update(upload_id, total_bytes, total_bytes));
            EngineOutcome::Completed { url }
        }
        Err(err) if err.is_cancelled() || cancel.is_cancelled() => EngineOutcome::Cancelled,
        Err(err) => EngineOutcome::Failed(err.with_filename(file.name.clone())),
    };

    let bytes_transferred = match outcome {
        EngineOutcome::Completed { .. } => total_bytes,
        _ => reported.load(Ordering::Acquire),
    };

    EngineReport {
        outcome,
        strategy: TransferStrategy::Whole,
        chunks: None,
        bytes_transferred,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_curve_is_monotonic_and_capped() {
        let total = 4 * 1024 * 1024;
        let mut last = 0;
        for ms in (0..120_000).step_by(250) {
            let bytes = simulated_bytes(total, Duration::from_millis(ms));
            assert!(bytes >= last);
            assert!(bytes < total);
            last = bytes;
        }
        assert!(last as f64 > total as f64 * 0.9);
    }

    #[test]
    fn test_simulated_curve_starts_at_zero() {
        assert_eq!(simulated_bytes(1000, Duration::ZERO), 0);
        assert_eq!(simulated_bytes(0, Duration::from_secs(5)), 0);
    }
}
