//! Transfers against the file broker.
//!
//! [`TransferOrchestrator`] owns what every transfer shares: one HTTP client,
//! a [`SlotPool`] per direction bounding concurrency, and the download
//! bandwidth budget, divided evenly between the downloads holding a slot and
//! pushed to every open stream through one shared [`Throttle`]. [`FileServer`]
//! puts the broker's API on top of it.
//!
//! Progress and coordination are reported on an [`EventBus`].
//!
//! [`Throttle`]: attire_asyncutils::Throttle

mod api;
mod bandwidth;
mod client;
pub mod error;
mod events;
mod slots;

pub use crate::api::{FileServer, RemoteFile, UploadCandidate, UploadTransport, endpoint_url};
pub use crate::bandwidth::budget_per_slot;
pub use crate::client::{RequestBody, ResponseReader, StaticToken, TokenProvider, TransferOrchestrator};
pub use crate::events::{Event, EventBus, ScanGate, ScanHold};
pub use crate::slots::{SlotGuard, SlotPool, TransferKind};
