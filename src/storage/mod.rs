//! Object storage: the generic [`Interface`], resource versioning, selection
//! predicates and the [`KvStore`] implementation over a revisioned
//! [`KvBackend`].

mod interface;
mod kv;
mod predicate;
mod store;
mod versioner;

pub use interface::*;
pub use kv::*;
pub use predicate::*;
pub use store::*;
pub use versioner::*;

#[cfg(test)]
mod versioner_test;
