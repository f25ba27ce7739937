//! Persistence core of a control-plane API server.
//!
//! Objects are stored under versioned keys in a revisioned KV backend
//! ([`MemoryBackend`], [`SledBackend`]) through a [`KvStore`], optionally
//! encrypted at rest by a [`Transformer`] chain. A [`Cacher`] in front of
//! the store serves reads and watches from a bounded [`WatchCache`].

mod cacher;
mod config;
pub(crate) mod constants;
mod errors;
mod metrics;
mod object;
mod storage;
mod transformer;
pub(crate) mod utils;
mod watch;

pub use cacher::*;
pub use config::*;
pub use constants::FIELD_METADATA_NAME;
pub use constants::FIELD_METADATA_NAMESPACE;
pub use errors::*;
pub use metrics::*;
pub use object::*;
pub use storage::*;
pub use transformer::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
