//! Tokio reader adapters shared by the upload and download paths.
//!
//! - [`ThrottledReader`] caps throughput at a [`Throttle`] that other tasks
//!   can change while the read is in progress.
//! - [`ProgressReader`] counts bytes into a [`Progress`] handle that can be
//!   observed concurrently.

mod progress;
mod throttle;

pub use crate::progress::{Progress, ProgressReader};
pub use crate::throttle::{Throttle, ThrottledReader};
