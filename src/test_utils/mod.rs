//! Fixtures shared by the unit tests of every module
mod common;

pub use common::*;
