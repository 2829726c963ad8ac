//! # queuelite
//!
//! Single-node work queue persisted as plain files.
//!
//! Producers [`enqueue`](storage::Storage::enqueue) JSON bodies into
//! `pending/`; a [`Consumer`](consumer::Consumer) claims them one at a time by
//! atomic rename, runs a handler, and deletes, retries or aborts each message.
//! Priority and arrival order live in the filename, so a sorted directory
//! listing is the whole index.

pub mod config;
pub mod consumer;
pub mod error;
pub mod hook;
pub mod model;
pub mod signal;
pub mod storage;
pub mod telemetry;

pub use consumer::Consumer;
pub use error::{Error, Result};
pub use model::{Delivery, Disposition, MessageId, Outcome, Priority};
pub use storage::{Storage, StorageOptions};
