//! zerofetch - a content-addressed implementation store and fetcher.
//!
//! Implementations are immutable directory trees named by the digest of
//! their canonical manifest. This crate provides the pipeline that
//! populates such a store:
//!
//! ```text
//! Fetcher -> DownloadScheduler -> (HTTP) -> Extractor -> DirectoryStore
//!                                                     -> Manifest -> install
//! ```
//!
//! - [`manifest`]: canonical tree serialization and digests
//! - [`digest`]: digest strings and algorithm selection
//! - [`store`]: the content-addressed cache with verify-and-install
//! - [`extract`]: MIME-dispatched archive extraction
//! - [`scheduler`]: priority download queue with pause/resume
//! - [`fetch`]: the orchestrating fetcher
//!
//! Configuration is explicit: construct a [`store::DirectoryStore`] and a
//! [`fetch::Fetcher`] at program start and pass them down. There are no
//! process-wide defaults.

pub mod config;
pub mod digest;
pub mod extract;
pub mod fetch;
pub mod implementation;
pub mod manifest;
pub mod progress;
pub mod scheduler;
pub mod store;

pub use config::FetcherConfig;
pub use digest::ManifestDigest;
pub use fetch::{FetchError, Fetcher};
pub use implementation::{Archive, FetchRequest, Implementation, Recipe};
pub use manifest::{Manifest, ManifestFormat};
pub use progress::{SilentHandler, TaskHandler};
pub use store::{DirectoryStore, StoreError};
