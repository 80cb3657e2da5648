//! remotefs: one filesystem contract over pooled FTP and SMB sessions
//!
//! A file-browsing application talks to every remote protocol through the
//! same [`backend::Backend`] trait. Sessions are established lazily, cached
//! by their connection parameters and closed when the cache evicts them.
//!
//! # Architecture
//!
//! - **Connection Cache**: size-bounded key to resource cache with idle
//!   expiry and an eviction callback (`cache`).
//! - **Backend Contract**: the `Backend`/`BackendFactory` traits, connection
//!   parameters, login form schema and the injected `BackendRegistry`
//!   (`backend`).
//! - **Adapters**: `backend::ftp` and `backend::samba` translate contract
//!   calls into protocol operations and normalize paths and errors.
//! - **Protocol seams**: blocking traits over the wire libraries
//!   (`protocol`).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use remotefs::backend::ftp::{FtpFactory, FtpSettings};
//! use remotefs::backend::{BackendRegistry, ConnectionParams};
//!
//! # async fn example() -> remotefs::Result<()> {
//! let mut registry = BackendRegistry::new();
//! registry.register(Arc::new(FtpFactory::new(FtpSettings::default())));
//!
//! let params = ConnectionParams::new().with("hostname", "ftp.example.com");
//! let backend = registry.init("ftp", params).await?;
//! for entry in backend.list("/").await? {
//!     println!("{}", entry.name);
//! }
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod env;
pub mod error;
pub mod protocol;

pub use error::{RemoteFsError, Result};
