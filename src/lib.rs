//! Snapdelta: changed-block delta tracking for volume snapshots.
//!
//! This crate provides an HTTP API service that tracks named snapshot
//! comparisons (delta records), registers storage driver backends, and
//! enriches records on demand with the changed-block data those backends
//! report.
//!
//! # Example
//!
//! ```no_run
//! use snapdelta::{Config, DeltaServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = DeltaServer::new(Config::default());
//!     server.run().await.unwrap();
//! }
//! ```

pub mod bitmap;
pub mod config;
pub mod enrich;
pub mod error;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod token;

// Re-exports for convenience
pub use config::{Args, Config, DEFAULT_PORT};
pub use error::{DeltaError, DeltaResult, ErrorCode};
pub use server::{DeltaServer, DeltaServerBuilder};
pub use store::{DeltaStore, MemoryDeltaStore};
