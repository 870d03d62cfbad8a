//! Keeping the local content cache and the file broker in step.
//!
//! [`DownloadCoordinator`] brings missing files into the cache and
//! [`UploadCoordinator`] pushes cached files the broker asks for. Both run on
//! one shared [`TransferOrchestrator`](attire_transfer::TransferOrchestrator),
//! and [`Session`] wires them together with the state that lives as long as
//! a connection: the [`ForbiddenRegistry`] and the [`VerifiedSet`].

mod download;
pub mod error;
mod forbidden;
mod session;
mod status;
mod store;
mod upload;
mod verified;

pub use crate::download::{DownloadCoordinator, DownloadReport, GroupStatus, RemoteLocator, TransferRequest};
pub use crate::forbidden::ForbiddenRegistry;
pub use crate::session::Session;
pub use crate::status::{TransferStatus, TransferTracker};
pub use crate::upload::{UploadCoordinator, UploadProgress, UploadReport};
pub use crate::verified::VerifiedSet;
