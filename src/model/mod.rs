//! Core data model.
//!
//! Work items, their lifecycle status, and the argument types of the queue
//! operations that move them between states.

pub mod filter;
pub mod work;

pub use filter::{ReportFilter, WorkFilter, WorkReport};
pub use work::{
    AllocateWork, DEFAULT_RETRIES, FinishWork, MAX_TIMEOUT_MS, MarkOldWork, NewWork, Status,
    Work, WorkId, check_timeout_ms, orphan_error,
};
