//! Watch events and the channel that carries them to a consumer.
//!
//! Every watch in the crate is a producer task feeding a bounded queue and a
//! [`WatchHandle`] on the consumer side. Both ends share one
//! [`CancellationToken`]: stopping the handle (or dropping it) cancels the
//! producer, and the producer finishing closes the handle.

mod decorated;
pub use decorated::*;


use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;

use crate::Result;
use crate::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Bookmark => "BOOKMARK",
            EventType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single change notification.
///
/// Serializes to the wire shape `{"type": "ADDED", "object": {...}}`; the
/// object of an `ERROR` event is a [`Status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Carries only a resource version; the rest of the object is empty
    Bookmark(T),
    Error(Status),
}

impl<T> WatchEvent<T> {
    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
            WatchEvent::Bookmark(_) => EventType::Bookmark,
            WatchEvent::Error(_) => EventType::Error,
        }
    }

    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(obj)
            | WatchEvent::Modified(obj)
            | WatchEvent::Deleted(obj)
            | WatchEvent::Bookmark(obj) => Some(obj),
            WatchEvent::Error(_) => None,
        }
    }

    pub fn into_object(self) -> Option<T> {
        match self {
            WatchEvent::Added(obj)
            | WatchEvent::Modified(obj)
            | WatchEvent::Deleted(obj)
            | WatchEvent::Bookmark(obj) => Some(obj),
            WatchEvent::Error(_) => None,
        }
    }

    /// Applies `f` to the carried object, keeping the event type. Error events
    /// pass through untouched.
    pub fn try_map_object<U, F>(
        self,
        f: F,
    ) -> Result<WatchEvent<U>>
    where
        F: FnOnce(T) -> Result<U>,
    {
        Ok(match self {
            WatchEvent::Added(obj) => WatchEvent::Added(f(obj)?),
            WatchEvent::Modified(obj) => WatchEvent::Modified(f(obj)?),
            WatchEvent::Deleted(obj) => WatchEvent::Deleted(f(obj)?),
            WatchEvent::Bookmark(obj) => WatchEvent::Bookmark(f(obj)?),
            WatchEvent::Error(status) => WatchEvent::Error(status),
        })
    }
}

/// Consumer side of a watch.
#[async_trait]
pub trait Watcher<T>: Send {
    /// Next event, or `None` once the watch is closed.
    async fn recv(&mut self) -> Option<WatchEvent<T>>;

    /// Stops the watch. Idempotent.
    fn stop(&self);
}

/// Receiving half returned by every `watch` call.
#[derive(Debug)]
pub struct WatchHandle<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
    token: CancellationToken,
}

impl<T> WatchHandle<T> {
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> Drop for WatchHandle<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
impl<T: Send + 'static> Watcher<T> for WatchHandle<T> {
    async fn recv(&mut self) -> Option<WatchEvent<T>> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    fn stop(&self) {
        self.token.cancel();
    }
}

/// Producing half of a watch channel.
#[derive(Debug)]
pub struct WatchSender<T> {
    tx: mpsc::Sender<WatchEvent<T>>,
    token: CancellationToken,
}

impl<T> WatchSender<T> {
    /// Delivers `event`, waiting for queue space. Returns `false` once the
    /// consumer has stopped or gone away.
    pub async fn send(
        &self,
        event: WatchEvent<T>,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            result = self.tx.send(event) => result.is_ok(),
        }
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Bounded watch channel; dropping the sender closes the handle.
pub fn watch_channel<T>(buffer: usize) -> (WatchSender<T>, WatchHandle<T>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let token = CancellationToken::new();
    (
        WatchSender {
            tx,
            token: token.clone(),
        },
        WatchHandle { rx, token },
    )
}
