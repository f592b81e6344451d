use std::sync::Arc;
use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use courier::config::CliConfig;
use courier::utils::{format_bytes, format_eta, format_speed};
use courier::{FileRef, HttpTransport, UploadEvent, UploadQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = CliConfig::load(&path).with_context(|| format!("failed to load {path}"))?;

    let transport = Arc::new(HttpTransport::new(&config.endpoint)?);
    let handle = UploadQueue::new(transport, config.upload.clone())?;
    let queue = handle.queue.clone();
    let mut events = queue.subscribe();

    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let reporter = queue.tracker().start(config.upload.progress_interval, batch_tx);

    let mut queued = 0;
    for path in &config.files {
        let file = match FileRef::from_path(path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping file");
                continue;
            }
        };
        match queue.add(file).await {
            Ok(upload_id) => {
                info!(%upload_id, path = %path.display(), "queued");
                queued += 1;
            }
            Err(err) => warn!(path = %path.display(), error = %err, "not queued"),
        }
    }

    if queued == 0 {
        warn!("nothing to upload");
    } else {
        loop {
            tokio::select! {
                Some(batch) = batch_rx.recv() => {
                    let overall = &batch.overall.snapshot;
                    info!(
                        active = batch.overall.active_tasks,
                        progress = format!("{:.1}%", overall.percentage),
                        sent = %format_bytes(overall.bytes_transferred),
                        speed = %format_speed(overall.speed),
                        eta = %format_eta(overall.eta),
                        "uploading"
                    );
                }
                event = events.recv() => match event {
                    Ok(UploadEvent::Completed { upload_id, url }) => info!(%upload_id, %url, "done"),
                    Ok(UploadEvent::Failed { upload_id, error }) => error!(%upload_id, %error, "failed"),
                    Ok(UploadEvent::Drained { completed, failed, elapsed }) => {
                        // 入队期间可能已经排空过一次
                        let stats = queue.stats().await?;
                        if stats.pending == 0 && stats.uploading == 0 {
                            info!(completed = stats.completed, failed = stats.error, "all uploads finished");
                            break;
                        }
                        info!(completed, failed, ?elapsed, "batch finished");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    reporter.shutdown().await;
    handle.shutdown().await?;
    Ok(())
}
