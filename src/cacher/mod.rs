//! Read-through cache in front of an [`Interface`](crate::Interface).
//!
//! A [`WatchCache`] holds the current state of one resource plus a window of
//! recent events. The reflector keeps it in sync with storage; the
//! [`Cacher`] serves non-consistent reads and every watch from it, so N
//! watchers cost one storage watch.

mod cacher;
mod dispatcher;
mod reflector;
mod watch_cache;
pub use cacher::*;
pub use watch_cache::*;

#[cfg(test)]
mod watch_cache_test;
