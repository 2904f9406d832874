//! Continuous segment recording, annotation and merge reconciliation for a live video feed.
//!
//! Blob-store listings are the only shared state between the recorder, the
//! discovery loop and the merge reconciler.

pub mod annotation;
pub mod api;
pub mod blob_store;
pub mod config;
pub mod discovery;
pub mod error;
pub mod merge;
pub mod notify;
pub mod process;
pub mod recorder;
pub mod relay;
pub mod retention;
pub mod timestamp;

pub use error::{Error, Result};
