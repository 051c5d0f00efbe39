//! Memoization caches for the taskmill execution engine.
//!
//! These caches can be composed and layered on top of each other. They
//! solve the same problem from two angles: never compute the same thing
//! twice.
//!
//! - [`SingleFlight`] guarantees at most one in-progress computation per
//!   key and shares the outcome, success or failure, with every concurrent
//!   and subsequent requester. The engine instantiates it once per property
//!   domain (execution-scoped and environment-scoped properties).
//! - [`ContentDataCache`] memoizes values derived from file content and
//!   invalidates them automatically when the file's observed content
//!   descriptor changes.

mod content;
mod single_flight;

pub use content::{ContentCacheError, ContentDataCache, FileDataComputer, FileSnapshot};
pub use single_flight::{ComputeError, SingleFlight};
