use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::trace;
use tracing::warn;

use super::KvEvent;
use super::KvWatchStream;
use crate::StorageError;

/// Feeds a watch stream from replayed history followed by the live feed.
///
/// `live` must have been subscribed while the history snapshot was taken,
/// so no revision is skipped or delivered twice. Live events at or below
/// `replayed_through` are dropped.
pub(crate) fn spawn_watch_stream(
    history: Vec<KvEvent>,
    mut live: broadcast::Receiver<KvEvent>,
    prefix: String,
    replayed_through: u64,
    buffer: usize,
) -> KvWatchStream {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::spawn(async move {
        for event in history {
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    trace!(%prefix, "kv watch consumer went away");
                    return;
                }
                received = live.recv() => match received {
                    Ok(event) => {
                        if event.revision <= replayed_through || !event.key().starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%prefix, skipped, "kv watch consumer fell behind the live feed");
                        let _ = tx
                            .send(Err(StorageError::Unavailable(format!(
                                "watch on {prefix} fell behind by {skipped} events"
                            ))
                            .into()))
                            .await;
                        return;
                    }
                    Err(RecvError::Closed) => {
                        trace!(%prefix, "kv live feed closed");
                        return;
                    }
                }
            }
        }
    });

    rx
}
