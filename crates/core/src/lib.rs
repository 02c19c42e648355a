//! Shared domain types, configuration, and collaborator traits for the
//! data-cleaning task queue core.
//!
//! This crate has no opinion on *how* tasks are queued or processed — that
//! lives in `taskqueue-queue` and `taskqueue-processing`. It only defines
//! the data every other crate agrees on: the task/status/progress records,
//! the error taxonomy, the configuration surface, and the narrow traits
//! that stand in for the out-of-scope collaborators (the row cleaning rule
//! engine, the relational file-record store, and the tabular file reader).

pub mod collaborators;
pub mod config;
pub mod domain;
pub mod errors;

pub use collaborators::{FileProcessor, ProcessingOutcome};
pub use config::AppConfig;
pub use errors::{ErrorKind, QueueError, QueueResult};
