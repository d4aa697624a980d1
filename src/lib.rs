//! # Verm - content-addressed, replicating HTTP blob store
//!
//! Clients upload opaque payloads; each unique payload is durably stored
//! exactly once under a path derived from the SHA-256 of its decoded
//! contents, and that path is returned as the canonical location. A fleet of
//! peer instances asynchronously replicates new payloads and periodically
//! reconciles missing files through a batched manifest exchange; reads are
//! transparently served from peers when a file is absent locally.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use verm::config::Config;
//! use verm::server::{serve, VermServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server = VermServer::new(&config)?;
//!     server.start_replication();
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3404").await?;
//!     serve(server, listener, std::future::pending()).await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod encoding;
pub mod error;
pub mod forwarding;
pub mod hash_path;
pub mod httputil;
pub mod logging;
pub mod mime_types;
pub mod missing;
pub mod peer;
pub mod replication;
pub mod resync;
pub mod server;
pub mod statistics;
pub mod store;
pub mod tracker;
pub mod uploader;

// Re-export commonly used types and functions
pub use config::{Config, PeerAddress};
pub use error::VermError;
pub use server::{router, serve, VermServer};
pub use uploader::{upload_file, UploadOutcome};

// vim: ts=4
