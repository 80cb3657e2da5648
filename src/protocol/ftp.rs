//! FTP wire-protocol seam
//!
//! The adapter drives FTP through these blocking traits. [`SuppaFtpDialer`]
//! implements them on top of the `suppaftp` client; tests substitute an
//! in-memory server.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType as TransferType;
use suppaftp::{FtpError as SuppaError, FtpStream};
use thiserror::Error;
use tracing::{debug, trace};

use crate::backend::FileInfo;

/// Failure reported by an FTP session
///
/// Server replies keep their numeric status so callers can classify them
/// without inspecting message text.
#[derive(Error, Debug)]
pub enum FtpError {
    #[error("{code} {message}")]
    Reply { code: u32, message: String },

    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FtpError {
    pub fn reply(code: u32, message: impl Into<String>) -> Self {
        FtpError::Reply {
            code,
            message: message.into(),
        }
    }

    /// Server status code, when the failure carries one
    pub fn code(&self) -> Option<u32> {
        match self {
            FtpError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            FtpError::Reply { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the control connection can no longer be trusted
    pub fn is_connection_error(&self) -> bool {
        matches!(self, FtpError::Connection(_))
    }
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Opens authenticated control connections
pub trait FtpDialer: Send + Sync {
    fn dial(&self, endpoint: &FtpEndpoint) -> Result<Box<dyn FtpSession>, FtpError>;
}

/// One authenticated control connection
///
/// Calls block until the server answers.
pub trait FtpSession: Send {
    fn pwd(&mut self) -> Result<String, FtpError>;

    fn list(&mut self, path: &str) -> Result<Vec<FileInfo>, FtpError>;

    /// Download `path` into `out`, returning the byte count
    fn retrieve(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, FtpError>;

    /// Upload `input` to `path` until EOF, returning the byte count
    fn store(&mut self, path: &str, input: &mut dyn Read) -> Result<u64, FtpError>;

    fn mkdir(&mut self, path: &str) -> Result<(), FtpError>;

    /// Remove an empty directory
    fn rmdir(&mut self, path: &str) -> Result<(), FtpError>;

    /// Remove a single file
    fn delete(&mut self, path: &str) -> Result<(), FtpError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FtpError>;

    fn quit(&mut self) -> Result<(), FtpError>;
}

// =============================================================================
// suppaftp implementation
// =============================================================================

impl From<SuppaError> for FtpError {
    fn from(err: SuppaError) -> Self {
        match err {
            SuppaError::UnexpectedResponse(response) => FtpError::Reply {
                code: response.status.code(),
                message: String::from_utf8_lossy(&response.body).trim().to_string(),
            },
            SuppaError::ConnectionError(e) => FtpError::Connection(e),
            other => FtpError::Protocol(other.to_string()),
        }
    }
}

/// Dialer backed by the `suppaftp` client, passive mode, binary transfers
#[derive(Debug, Default, Clone)]
pub struct SuppaFtpDialer;

impl SuppaFtpDialer {
    fn resolve(endpoint: &FtpEndpoint) -> Result<SocketAddr, FtpError> {
        (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                FtpError::Connection(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("cannot resolve {}", endpoint.host),
                ))
            })
    }
}

impl FtpDialer for SuppaFtpDialer {
    fn dial(&self, endpoint: &FtpEndpoint) -> Result<Box<dyn FtpSession>, FtpError> {
        let addr = Self::resolve(endpoint)?;
        debug!("ftp: connecting to {} ({})", endpoint.host, addr);

        let mut stream = FtpStream::connect_timeout(addr, endpoint.timeout)?;
        stream.login(endpoint.username.as_str(), endpoint.password.as_str())?;
        stream.transfer_type(TransferType::Binary)?;
        Ok(Box::new(SuppaFtpSession(stream)))
    }
}

struct SuppaFtpSession(FtpStream);

impl FtpSession for SuppaFtpSession {
    fn pwd(&mut self) -> Result<String, FtpError> {
        Ok(self.0.pwd()?)
    }

    fn list(&mut self, path: &str) -> Result<Vec<FileInfo>, FtpError> {
        let lines = self.0.list(Some(path))?;
        let entries = lines
            .iter()
            .filter_map(|line| match ListEntry::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    trace!("ftp: skipping unparsable listing line {:?}: {}", line, e);
                    None
                }
            })
            .filter(|entry| entry.name() != "." && entry.name() != "..")
            .map(|entry| {
                if entry.is_directory() {
                    FileInfo::directory(entry.name(), Some(entry.modified()))
                } else {
                    FileInfo::file(entry.name(), entry.size() as u64, Some(entry.modified()))
                }
            })
            .collect();
        Ok(entries)
    }

    fn retrieve(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, FtpError> {
        let copied = self.0.retr(path, |reader| {
            io::copy(reader, &mut *out).map_err(SuppaError::ConnectionError)
        })?;
        Ok(copied)
    }

    fn store(&mut self, path: &str, mut input: &mut dyn Read) -> Result<u64, FtpError> {
        Ok(self.0.put_file(path, &mut input)?)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), FtpError> {
        Ok(self.0.mkdir(path)?)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), FtpError> {
        Ok(self.0.rmdir(path)?)
    }

    fn delete(&mut self, path: &str) -> Result<(), FtpError> {
        Ok(self.0.rm(path)?)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FtpError> {
        Ok(self.0.rename(from, to)?)
    }

    fn quit(&mut self) -> Result<(), FtpError> {
        Ok(self.0.quit()?)
    }
}

// =============================================================================
// In-memory server for tests
// =============================================================================

#[cfg(test)]
pub mod testing {
    use std::collections::{BTreeMap, HashMap};
    use std::io::{Read, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    enum Node {
        Dir,
        File(Vec<u8>),
    }

    /// Shared state of a fake FTP server
    #[derive(Default)]
    pub struct ServerState {
        tree: BTreeMap<String, Node>,
        pub dials: Vec<FtpEndpoint>,
        pub quits: usize,
        pub fail_probe: bool,
        pub fail_quit: bool,
        /// Replies DELE/RMD with a 2xx status wrapped as an error
        pub success_as_error: bool,
        /// Paths whose deletion fails with the given reply
        pub delete_failures: HashMap<String, (u32, String)>,
        /// Drop the connection after this many bytes of a download
        pub break_retrieve_after: Option<usize>,
        /// Downloads block until this channel yields or hangs up
        pub retrieve_gate: Option<std::sync::mpsc::Receiver<()>>,
    }

    fn norm(path: &str) -> String {
        let trimmed = path.trim_matches('/');
        format!("/{}", trimmed)
    }

    fn parent(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(i) => path[..i].to_string(),
        }
    }

    impl ServerState {
        pub fn add_dir(&mut self, path: &str) {
            self.tree.insert(norm(path), Node::Dir);
        }

        pub fn add_file(&mut self, path: &str, data: &[u8]) {
            self.tree.insert(norm(path), Node::File(data.to_vec()));
        }

        pub fn exists(&self, path: &str) -> bool {
            self.tree.contains_key(&norm(path))
        }

        pub fn content(&self, path: &str) -> Option<Vec<u8>> {
            match self.tree.get(&norm(path)) {
                Some(Node::File(data)) => Some(data.clone()),
                _ => None,
            }
        }

        /// Number of entries strictly below `path`
        pub fn count_under(&self, path: &str) -> usize {
            let prefix = format!("{}/", norm(path));
            self.tree.keys().filter(|k| k.starts_with(&prefix)).count()
        }

        fn children(&self, dir: &str) -> Vec<FileInfo> {
            self.tree
                .iter()
                .filter(|(k, _)| k.as_str() != "/" && parent(k) == dir)
                .map(|(k, node)| {
                    let name = k.rsplit('/').next().unwrap_or(k).to_string();
                    match node {
                        Node::Dir => FileInfo::directory(name, None),
                        Node::File(data) => FileInfo::file(name, data.len() as u64, None),
                    }
                })
                .collect()
        }
    }

    /// Fake server reachable through [`MemoryFtpDialer`]
    #[derive(Clone)]
    pub struct MemoryFtp {
        pub state: Arc<Mutex<ServerState>>,
    }

    impl MemoryFtp {
        pub fn new() -> Self {
            let mut state = ServerState::default();
            state.add_dir("/");
            Self {
                state: Arc::new(Mutex::new(state)),
            }
        }

        pub fn dialer(&self) -> Arc<dyn FtpDialer> {
            Arc::new(MemoryFtpDialer {
                state: self.state.clone(),
            })
        }
    }

    pub struct MemoryFtpDialer {
        state: Arc<Mutex<ServerState>>,
    }

    impl FtpDialer for MemoryFtpDialer {
        fn dial(&self, endpoint: &FtpEndpoint) -> Result<Box<dyn FtpSession>, FtpError> {
            let mut state = self.state.lock();
            state.dials.push(endpoint.clone());
            if endpoint.password == "wrong" {
                return Err(FtpError::reply(530, "Login incorrect."));
            }
            Ok(Box::new(MemorySession {
                state: self.state.clone(),
            }))
        }
    }

    struct MemorySession {
        state: Arc<Mutex<ServerState>>,
    }

    fn not_found() -> FtpError {
        FtpError::reply(550, "No such file or directory")
    }

    impl FtpSession for MemorySession {
        fn pwd(&mut self) -> Result<String, FtpError> {
            Ok("/home".to_string())
        }

        fn list(&mut self, path: &str) -> Result<Vec<FileInfo>, FtpError> {
            let state = self.state.lock();
            let dir = norm(path);
            if dir == "/" && state.fail_probe {
                return Err(FtpError::reply(530, "Not logged in."));
            }
            match state.tree.get(&dir) {
                Some(Node::Dir) => Ok(state.children(&dir)),
                _ => Err(not_found()),
            }
        }

        fn retrieve(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, FtpError> {
            let (data, limit, gate) = {
                let mut state = self.state.lock();
                let data = match state.tree.get(&norm(path)) {
                    Some(Node::File(data)) => data.clone(),
                    _ => return Err(not_found()),
                };
                (data, state.break_retrieve_after, state.retrieve_gate.take())
            };
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            let mut sent = 0;
            for chunk in data.chunks(32 * 1024) {
                if let Some(limit) = limit {
                    if sent >= limit {
                        return Err(FtpError::Connection(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "data connection reset",
                        )));
                    }
                }
                out.write_all(chunk)?;
                sent += chunk.len();
            }
            Ok(sent as u64)
        }

        fn store(&mut self, path: &str, input: &mut dyn Read) -> Result<u64, FtpError> {
            let mut data = Vec::new();
            input.read_to_end(&mut data)?;
            let len = data.len() as u64;
            let mut state = self.state.lock();
            let key = norm(path);
            if !matches!(state.tree.get(&parent(&key)), Some(Node::Dir)) {
                return Err(not_found());
            }
            state.tree.insert(key, Node::File(data));
            Ok(len)
        }

        fn mkdir(&mut self, path: &str) -> Result<(), FtpError> {
            let mut state = self.state.lock();
            let key = norm(path);
            if !matches!(state.tree.get(&parent(&key)), Some(Node::Dir)) {
                return Err(not_found());
            }
            if state.tree.contains_key(&key) {
                return Err(FtpError::reply(550, "File exists"));
            }
            state.tree.insert(key, Node::Dir);
            Ok(())
        }

        fn rmdir(&mut self, path: &str) -> Result<(), FtpError> {
            let mut state = self.state.lock();
            let key = norm(path);
            if !matches!(state.tree.get(&key), Some(Node::Dir)) {
                return Err(not_found());
            }
            if state.count_under(&key) > 0 {
                return Err(FtpError::reply(550, "Directory not empty"));
            }
            state.tree.remove(&key);
            if state.success_as_error {
                return Err(FtpError::reply(250, "Directory successfully removed"));
            }
            Ok(())
        }

        fn delete(&mut self, path: &str) -> Result<(), FtpError> {
            let mut state = self.state.lock();
            let key = norm(path);
            if let Some((code, message)) = state.delete_failures.get(&key).cloned() {
                return Err(FtpError::reply(code, message));
            }
            if !matches!(state.tree.get(&key), Some(Node::File(_))) {
                return Err(not_found());
            }
            state.tree.remove(&key);
            if state.success_as_error {
                return Err(FtpError::reply(250, "Requested file action okay, completed"));
            }
            Ok(())
        }

        fn rename(&mut self, from: &str, to: &str) -> Result<(), FtpError> {
            let mut state = self.state.lock();
            let node = state.tree.remove(&norm(from)).ok_or_else(not_found)?;
            state.tree.insert(norm(to), node);
            Ok(())
        }

        fn quit(&mut self) -> Result<(), FtpError> {
            let mut state = self.state.lock();
            state.quits += 1;
            if state.fail_quit {
                return Err(FtpError::Connection(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "control connection already gone",
                )));
            }
            Ok(())
        }
    }
}
