//! Background loops started by `SyncEngine::start`.
//!
//! Every loop waits on the shutdown channel at its sleep points only, so a
//! call already in flight completes before the loop exits.

use crate::engine::EngineInner;
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use std::time::Duration;
use tidal_protocol::{ChangeStream, SubscribeRequest};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

fn stopped(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleeps for `delay`. Returns false if the engine stopped meanwhile.
async fn sleep_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => !stopped(shutdown),
        _ = shutdown.changed() => false,
    }
}

/// Turns enqueue notifications of one outbox into push wake-ups.
pub(crate) async fn forward_wakeups(
    notifier: Arc<Notify>,
    inner: Arc<EngineInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = notifier.notified() => inner.wake.notify_one(),
            _ = shutdown.changed() => break,
        }
    }
}

/// Drains outboxes whenever something is enqueued, and every push interval.
pub(crate) async fn push_loop(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    debug!("push loop started");
    while !stopped(&shutdown) {
        // errors are reported by run_push; lock contention is retried on
        // the next tick
        if let Ok(report) = inner.run_push().await {
            if report.acked > 0 {
                debug!(acked = report.acked, "background push");
            }
        }
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.push_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("push loop stopped");
}

/// Pulls immediately, then every `interval`.
pub(crate) async fn pull_loop(
    inner: Arc<EngineInner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(interval_ms = interval.as_millis() as u64, "pull loop started");
    while !stopped(&shutdown) {
        // failures are reported by run_pull; the next tick retries
        let _ = inner.run_pull().await;
        if !sleep_or_stop(interval, &mut shutdown).await {
            break;
        }
    }
    debug!("pull loop stopped");
}

/// Keeps a subscription open, reconnecting after errors, closes and idle
/// timeouts.
pub(crate) async fn subscribe_loop(
    inner: Arc<EngineInner>,
    catch_up: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    if catch_up {
        let _ = inner.run_pull().await;
    }
    let reconnect = inner.config.subscribe.reconnect_delay;
    while !stopped(&shutdown) {
        match open(&inner).await {
            Ok(stream) => {
                inner.stats.write().subscriptions += 1;
                info!("subscribed to remote changes");
                if !consume(&inner, stream, &mut shutdown).await {
                    break;
                }
            }
            Err(err) => inner.report_error(&err),
        }
        if !sleep_or_stop(reconnect, &mut shutdown).await {
            break;
        }
        debug!("resubscribing");
    }
    debug!("subscribe loop stopped");
}

async fn open(inner: &EngineInner) -> SyncResult<ChangeStream> {
    let request = SubscribeRequest {
        collections: inner
            .collections()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        cursor: inner.cursor.get()?,
    };
    match tokio::time::timeout(
        inner.config.request_timeout,
        inner.authority.subscribe(request),
    )
    .await
    {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(SyncError::Timeout),
    }
}

/// Applies batches until the stream ends. Returns false on shutdown.
async fn consume(
    inner: &EngineInner,
    mut stream: ChangeStream,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let idle = inner.config.subscribe.idle_timeout;
    loop {
        let next = async {
            match idle {
                Some(limit) => tokio::time::timeout(limit, stream.recv()).await.ok(),
                None => Some(stream.recv().await),
            }
        };
        let received = tokio::select! {
            received = next => received,
            _ = shutdown.changed() => return false,
        };
        match received {
            None => {
                debug!("subscription idle");
                return true;
            }
            Some(None) => {
                info!("subscription closed by the authority");
                return true;
            }
            Some(Some(Err(err))) => {
                inner.report_error(&SyncError::from(err));
                return true;
            }
            Some(Some(Ok(batch))) => match inner.apply_batch(&batch).await {
                Ok(applied) => debug!(applied, cursor = ?batch.cursor, "applied pushed changes"),
                Err(err) => {
                    inner.report_error(&err);
                    return true;
                }
            },
        }
    }
}
