use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use super::watch_channel;
use super::WatchEvent;
use super::WatchHandle;
use super::Watcher;
use crate::Result;

/// Mutates an outgoing object in place, e.g. to fill in a self link.
pub type DecoratorFunc<T> = Arc<dyn Fn(&mut T) -> Result<()> + Send + Sync>;

/// Applies a [`DecoratorFunc`] to every object flowing out of an upstream
/// watch.
///
/// A single pump task moves events from upstream to the output queue. If
/// decoration fails the pump emits one `ERROR` event carrying the failure and
/// finishes. Whichever way the pump ends, it stops the upstream and closes
/// the output.
pub struct DecoratedWatcher<T> {
    output: WatchHandle<T>,
}

impl<T: Send + 'static> DecoratedWatcher<T> {
    pub fn new<W>(
        mut upstream: W,
        decorator: DecoratorFunc<T>,
        buffer: usize,
    ) -> Self
    where
        W: Watcher<T> + 'static,
    {
        let (sender, output) = watch_channel(buffer);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = sender.cancelled() => {
                        debug!("decorated watcher stopped by consumer");
                        break;
                    }
                    event = upstream.recv() => event,
                };

                let Some(event) = event else {
                    debug!("upstream watch closed");
                    break;
                };

                let decorated = event.try_map_object(|mut obj| {
                    decorator(&mut obj)?;
                    Ok(obj)
                });

                match decorated {
                    Ok(event) => {
                        if !sender.send(event).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("failed to decorate watch event: {}", e);
                        sender.send(WatchEvent::Error(e.to_status())).await;
                        break;
                    }
                }
            }

            upstream.stop();
        });

        Self { output }
    }
}

#[async_trait]
impl<T: Send + 'static> Watcher<T> for DecoratedWatcher<T> {
    async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.output.recv().await
    }

    fn stop(&self) {
        self.output.stop();
    }
}
