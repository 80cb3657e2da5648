//! SMB/CIFS wire-protocol seam
//!
//! A session enumerates and mounts shares; each mounted share answers
//! share-relative paths using `\` separators. With the `libsmbclient`
//! feature, [`native::PavaoDialer`] implements these traits over `pavao`.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::FileInfo;

/// Coarse classification of an SMB failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmbErrorKind {
    PermissionDenied,
    NotFound,
    Other,
}

/// Failure reported by an SMB session or share
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SmbError {
    kind: SmbErrorKind,
    message: String,
}

impl SmbError {
    pub fn new(kind: SmbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(SmbErrorKind::Other, message)
    }

    pub fn kind(&self) -> SmbErrorKind {
        self.kind
    }
}

impl From<io::Error> for SmbError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => SmbErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => SmbErrorKind::NotFound,
            _ => SmbErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub timeout: Duration,
}

/// Opens authenticated sessions
pub trait SmbDialer: Send + Sync {
    fn dial(&self, endpoint: &SmbEndpoint) -> Result<Box<dyn SmbSession>, SmbError>;
}

/// One authenticated session
pub trait SmbSession: Send + Sync {
    fn share_names(&self) -> Result<Vec<String>, SmbError>;

    fn mount(&self, name: &str) -> Result<Arc<dyn SmbShare>, SmbError>;

    fn logoff(&self) -> Result<(), SmbError>;
}

/// A mounted share; paths are share-relative with `\` separators
pub trait SmbShare: Send + Sync {
    fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SmbError>;

    /// Copy the file at `path` into `out`, returning the byte count
    fn read_file(&self, path: &str, out: &mut dyn Write) -> Result<u64, SmbError>;

    /// Create or truncate `path` and fill it from `input` until EOF
    fn write_file(&self, path: &str, input: &mut dyn Read) -> Result<u64, SmbError>;

    fn mkdir(&self, path: &str) -> Result<(), SmbError>;

    /// Remove a file or a directory tree
    fn remove_all(&self, path: &str) -> Result<(), SmbError>;

    fn rename(&self, from: &str, to: &str) -> Result<(), SmbError>;

    fn umount(&self) -> Result<(), SmbError>;
}

/// Fail fast when nothing accepts TCP connections at `host:port`
///
/// libsmbclient has no per-call connect timeout, so the dial is bounded here.
#[cfg_attr(not(feature = "libsmbclient"), allow(dead_code))]
fn check_reachable(host: &str, port: u16, timeout: Duration) -> Result<(), SmbError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SmbError::other(format!("cannot resolve {}: {}", host, e)))?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => SmbError::other(format!("{}:{} unreachable: {}", host, port, e)),
        None => SmbError::other(format!("{} has no addresses", host)),
    })
}

// =============================================================================
// Recursive delete
// =============================================================================

/// Calls a depth-first delete needs, over `/`-separated paths
#[cfg_attr(not(feature = "libsmbclient"), allow(dead_code))]
trait TreeOps {
    type Error;

    fn is_dir(&self, path: &str) -> Result<bool, Self::Error>;

    /// Entries of a directory as `(name, is_dir)`
    fn children(&self, path: &str) -> Result<Vec<(String, bool)>, Self::Error>;

    fn unlink(&self, path: &str) -> Result<(), Self::Error>;

    fn rmdir(&self, path: &str) -> Result<(), Self::Error>;
}

#[cfg_attr(not(feature = "libsmbclient"), allow(dead_code))]
fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => ("/", trimmed),
    }
}

/// Remove a file, or a directory and everything below it
#[cfg_attr(not(feature = "libsmbclient"), allow(dead_code))]
fn remove_tree<T: TreeOps + ?Sized>(ops: &T, path: &str) -> Result<(), T::Error> {
    if ops.is_dir(path)? {
        remove_dir(ops, path)
    } else {
        ops.unlink(path)
    }
}

#[cfg_attr(not(feature = "libsmbclient"), allow(dead_code))]
fn remove_dir<T: TreeOps + ?Sized>(ops: &T, path: &str) -> Result<(), T::Error> {
    for (name, is_dir) in ops.children(path)? {
        if name == "." || name == ".." {
            continue;
        }
        let child = format!("{}/{}", path.trim_end_matches('/'), name);
        if is_dir {
            remove_dir(ops, &child)?;
        } else {
            ops.unlink(&child)?;
        }
    }
    ops.rmdir(path)
}

#[cfg(feature = "libsmbclient")]
pub mod native {
    //! libsmbclient-backed implementation

    use std::io::{Read, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pavao::{SmbClient, SmbCredentials, SmbDirentType, SmbMode, SmbOpenOptions, SmbOptions};
    use tracing::debug;

    use super::*;

    /// libsmbclient reports failures as text; classify the common ones
    fn from_pavao(err: pavao::SmbError) -> SmbError {
        let message = err.to_string();
        let lower = message.to_lowercase();
        let kind = if lower.contains("permission denied") || lower.contains("access denied") {
            SmbErrorKind::PermissionDenied
        } else if lower.contains("no such file") || lower.contains("not found") {
            SmbErrorKind::NotFound
        } else {
            SmbErrorKind::Other
        };
        SmbError::new(kind, message)
    }

    fn to_uri_path(path: &str) -> String {
        format!("/{}", path.replace('\\', "/"))
    }

    fn connect(endpoint: &SmbEndpoint, share: &str) -> Result<SmbClient, SmbError> {
        SmbClient::new(
            SmbCredentials::default()
                .server(format!("smb://{}:{}", endpoint.host, endpoint.port))
                .share(share)
                .username(endpoint.username.as_str())
                .password(endpoint.password.as_str())
                .workgroup(endpoint.domain.as_str()),
            SmbOptions::default().one_share_per_server(true),
        )
        .map_err(from_pavao)
    }

    /// Dialer backed by libsmbclient through `pavao`
    #[derive(Debug, Default, Clone)]
    pub struct PavaoDialer;

    impl SmbDialer for PavaoDialer {
        fn dial(&self, endpoint: &SmbEndpoint) -> Result<Box<dyn SmbSession>, SmbError> {
            debug!("samba: connecting to {}:{}", endpoint.host, endpoint.port);
            check_reachable(&endpoint.host, endpoint.port, endpoint.timeout)?;
            let root = connect(endpoint, "")?;
            Ok(Box::new(PavaoSession {
                endpoint: endpoint.clone(),
                root: Mutex::new(Some(root)),
            }))
        }
    }

    struct PavaoSession {
        endpoint: SmbEndpoint,
        root: Mutex<Option<SmbClient>>,
    }

    impl SmbSession for PavaoSession {
        fn share_names(&self) -> Result<Vec<String>, SmbError> {
            let guard = self.root.lock();
            let root = guard
                .as_ref()
                .ok_or_else(|| SmbError::other("session logged off"))?;
            let entries = root.list_dir("/").map_err(from_pavao)?;
            Ok(entries
                .into_iter()
                .filter(|e| matches!(e.get_type(), SmbDirentType::FileShare))
                .map(|e| e.name().to_string())
                .collect())
        }

        fn mount(&self, name: &str) -> Result<Arc<dyn SmbShare>, SmbError> {
            let client = connect(&self.endpoint, &format!("/{}", name))?;
            client.list_dir("/").map_err(from_pavao)?;
            Ok(Arc::new(PavaoShare {
                client: Mutex::new(Some(client)),
            }))
        }

        fn logoff(&self) -> Result<(), SmbError> {
            self.root.lock().take();
            Ok(())
        }
    }

    struct PavaoShare {
        client: Mutex<Option<SmbClient>>,
    }

    impl PavaoShare {
        fn with<T>(
            &self,
            f: impl FnOnce(&SmbClient) -> Result<T, SmbError>,
        ) -> Result<T, SmbError> {
            let guard = self.client.lock();
            let client = guard
                .as_ref()
                .ok_or_else(|| SmbError::other("share unmounted"))?;
            f(client)
        }
    }

    impl SmbShare for PavaoShare {
        fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SmbError> {
            let dir = to_uri_path(path);
            self.with(|c| {
                let mut out = Vec::new();
                for entry in c.list_dir(&dir).map_err(from_pavao)? {
                    let name = entry.name().to_string();
                    if name == "." || name == ".." {
                        continue;
                    }
                    let child = format!("{}/{}", dir.trim_end_matches('/'), name);
                    let stat = c.stat(&child).map_err(from_pavao)?;
                    out.push(match entry.get_type() {
                        SmbDirentType::Dir => FileInfo::directory(name, Some(stat.modified)),
                        _ => FileInfo::file(name, stat.size, Some(stat.modified)),
                    });
                }
                Ok(out)
            })
        }

        fn read_file(&self, path: &str, out: &mut dyn Write) -> Result<u64, SmbError> {
            let target = to_uri_path(path);
            self.with(|c| {
                let mut file = c
                    .open_with(&target, SmbOpenOptions::default().read(true))
                    .map_err(from_pavao)?;
                Ok(io::copy(&mut file, out)?)
            })
        }

        fn write_file(&self, path: &str, input: &mut dyn Read) -> Result<u64, SmbError> {
            let target = to_uri_path(path);
            self.with(|c| {
                let mut file = c
                    .open_with(
                        &target,
                        SmbOpenOptions::default().create(true).write(true).truncate(true),
                    )
                    .map_err(from_pavao)?;
                let written = io::copy(input, &mut file)?;
                file.flush()?;
                Ok(written)
            })
        }

        fn mkdir(&self, path: &str) -> Result<(), SmbError> {
            let target = to_uri_path(path);
            self.with(|c| c.mkdir(&target, SmbMode::from(0o755)).map_err(from_pavao))
        }

        fn remove_all(&self, path: &str) -> Result<(), SmbError> {
            let target = to_uri_path(path);
            self.with(|c| remove_tree(c, &target).map_err(from_pavao))
        }

        fn rename(&self, from: &str, to: &str) -> Result<(), SmbError> {
            let (from, to) = (to_uri_path(from), to_uri_path(to));
            self.with(|c| c.rename(&from, &to).map_err(from_pavao))
        }

        fn umount(&self) -> Result<(), SmbError> {
            self.client.lock().take();
            Ok(())
        }
    }

    impl TreeOps for SmbClient {
        type Error = pavao::SmbError;

        fn is_dir(&self, path: &str) -> Result<bool, Self::Error> {
            let (dir, name) = split_parent(path);
            let entry = self.list_dir(dir)?.into_iter().find(|e| e.name() == name);
            match entry {
                Some(entry) => Ok(matches!(entry.get_type(), SmbDirentType::Dir)),
                // let the server report why the entry is missing
                None => self.stat(path).map(|_| false),
            }
        }

        fn children(&self, path: &str) -> Result<Vec<(String, bool)>, Self::Error> {
            Ok(self
                .list_dir(path)?
                .into_iter()
                .map(|e| (e.name().to_string(), matches!(e.get_type(), SmbDirentType::Dir)))
                .collect())
        }

        fn unlink(&self, path: &str) -> Result<(), Self::Error> {
            SmbClient::unlink(self, path)
        }

        fn rmdir(&self, path: &str) -> Result<(), Self::Error> {
            SmbClient::rmdir(self, path)
        }
    }
}

// =============================================================================
// In-memory server for tests
// =============================================================================
