//! Uniform backend contract and the protocol adapters implementing it

pub mod form;
pub mod ftp;
pub mod params;
pub mod pipe;
pub mod pool;
pub mod registry;
pub mod samba;

use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;

pub use form::{Form, FormElement, InputType};
pub use params::ConnectionParams;
pub use registry::BackendRegistry;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

/// Metadata for one entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    /// Modification time, when the protocol reports one
    pub mtime: Option<SystemTime>,
}

impl FileInfo {
    pub fn file(name: impl Into<String>, size: u64, mtime: Option<SystemTime>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::File,
            size,
            mtime,
        }
    }

    pub fn directory(name: impl Into<String>, mtime: Option<SystemTime>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::Directory,
            size: 0,
            mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

/// Stream type for file contents, in both directions
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Whether a contract path denotes a directory
///
/// The contract carries no type flag for deletions; a trailing slash marks
/// directories.
pub fn is_directory_path(path: &str) -> bool {
    path.ends_with('/')
}

/// Operations every protocol adapter exposes to the host application
///
/// Paths use forward slashes; each adapter translates them into its
/// protocol's native form. Instances are shared through the connection cache
/// and may serve concurrent calls.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Default browse location for a fresh session
    async fn home(&self) -> Result<String> {
        Ok("/".to_string())
    }

    /// List a directory
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// Open a file for streaming
    ///
    /// Returns as soon as the transfer is scheduled; transfer failures are
    /// delivered as items of the returned stream.
    ///
    /// The transfer occupies a protocol connection until it finishes. The FTP
    /// adapter only has `conn` of them, so with `conn=1` a caller must drain
    /// or drop the stream before issuing further calls on the same backend.
    async fn read(&self, path: &str) -> Result<ByteStream>;

    /// Create or overwrite a file, consuming `content` fully
    async fn write(&self, path: &str, content: ByteStream) -> Result<()>;

    /// Create a directory
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Remove a file, or a directory tree when `path` ends with `/`
    async fn remove(&self, path: &str) -> Result<()>;

    /// Rename/move within one connection
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Create an empty file
    async fn touch(&self, path: &str) -> Result<()>;

    /// Release the owned session
    ///
    /// Called by cache eviction only.
    async fn close(&self) -> Result<()>;
}

/// Builds adapters for one protocol
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Short identifier the registry dispatches on (e.g. "ftp")
    fn name(&self) -> &'static str;

    /// Parameters to prompt the user for
    fn login_form(&self) -> Form;

    /// Return the cached adapter for `params`, connecting on a cache miss
    async fn init(&self, params: ConnectionParams) -> Result<Arc<dyn Backend>>;

    /// Close every cached session
    async fn shutdown(&self) {}
}
