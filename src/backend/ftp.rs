//! FTP adapter
//!
//! One adapter exists per distinct (normalized) parameter set. It owns a
//! small pool of control connections bounded by the `conn` parameter; every
//! contract call checks out its own connection, so a directory walk or a
//! long download never shares a channel with another operation.
//!
//! All protocol calls block and run on the blocking thread pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::backend::pipe::{drain_into, spawn_reader};
use crate::backend::pool::SessionPool;
use crate::backend::{
    is_directory_path, Backend, BackendFactory, ByteStream, ConnectionParams, FileInfo, Form,
    FormElement, InputType,
};
use crate::cache::CacheConfig;
use crate::error::{RemoteFsError, Result};
use crate::protocol::ftp::{FtpDialer, FtpEndpoint, FtpError, FtpSession, SuppaFtpDialer};

pub const DEFAULT_PORT: &str = "21";
pub const DEFAULT_CONNECTIONS: usize = 5;
/// Upper bound on concurrent control connections per adapter
pub const MAX_CONNECTIONS: usize = 64;
const ANONYMOUS: &str = "anonymous";

// ===== Settings =====

/// Tuning of the FTP adapter
#[derive(Debug, Clone, Deserialize)]
pub struct FtpSettings {
    /// Bound on establishing a control connection
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_cache")]
    pub cache: CacheConfig,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cache() -> CacheConfig {
    CacheConfig::with_idle_ttl(
        crate::cache::DEFAULT_CAPACITY,
        Duration::from_secs(120),
        Duration::from_secs(60),
    )
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            cache: default_cache(),
        }
    }
}

// ===== Parameters =====

/// Fill defaults so equivalent parameter sets share one cache entry
pub fn normalize_params(mut params: ConnectionParams) -> ConnectionParams {
    let hostname = params.get("hostname");
    let hostname = hostname.strip_prefix("ftp://").unwrap_or(hostname).to_string();
    params.set("hostname", hostname);
    params.set_default("hostname", "localhost");
    params.set_default("port", DEFAULT_PORT);
    params.set_default("username", ANONYMOUS);
    if params.get("username") == ANONYMOUS {
        params.set_default("password", ANONYMOUS);
    }
    let conn = match params.get("conn").parse::<usize>() {
        Ok(0) | Err(_) => DEFAULT_CONNECTIONS,
        Ok(n) => n.min(MAX_CONNECTIONS),
    };
    params.set("conn", conn.to_string());
    params
}

fn endpoint(params: &ConnectionParams, timeout: Duration) -> Result<FtpEndpoint> {
    let port = params
        .get("port")
        .parse::<u16>()
        .map_err(|_| RemoteFsError::InvalidArgument(format!("invalid port: {}", params.get("port"))))?;
    Ok(FtpEndpoint {
        host: params.get("hostname").to_string(),
        port,
        username: params.get("username").to_string(),
        password: params.get("password").to_string(),
        timeout,
    })
}

// ===== Error mapping =====

/// Translate a protocol failure into the backend error taxonomy
pub fn map_ftp_error(err: FtpError) -> RemoteFsError {
    match err.code() {
        Some(530) | Some(532) => RemoteFsError::PermissionDenied,
        Some(550) => {
            let message = err.message();
            let lower = message.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") {
                RemoteFsError::PermissionDenied
            } else {
                RemoteFsError::NotFound(message)
            }
        }
        Some(553) => RemoteFsError::NotAllowed(err.message()),
        _ => RemoteFsError::Transport(err.to_string()),
    }
}

/// Whether an error actually carries a success-range reply
///
/// Some servers answer DELE/RMD in a way the client library reports as a
/// failure even though the status is below 300.
pub fn is_success_reply(err: &FtpError) -> bool {
    matches!(err.code(), Some(code) if (1..300).contains(&code))
}

/// Treat success-range replies reported as errors as success
pub fn tolerate_success_reply<T: Default>(
    result: std::result::Result<T, FtpError>,
) -> std::result::Result<T, FtpError> {
    match result {
        Err(e) if is_success_reply(&e) => {
            trace!("ftp: ignoring success reply reported as error: {}", e);
            Ok(T::default())
        }
        other => other,
    }
}

/// Remove `path`, walking the tree first when it names a directory
///
/// Directories are marked by a trailing slash. The first real failure aborts
/// the walk; whatever was already removed stays removed.
pub fn remove_recursive(
    session: &mut dyn FtpSession,
    path: &str,
) -> std::result::Result<(), FtpError> {
    if !is_directory_path(path) {
        return tolerate_success_reply(session.delete(path));
    }

    let entries = tolerate_success_reply(session.list(path))?;
    for entry in entries {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        if entry.is_dir() {
            remove_recursive(session, &format!("{}{}/", path, entry.name))?;
        } else {
            tolerate_success_reply(session.delete(&format!("{}{}", path, entry.name)))?;
        }
    }
    tolerate_success_reply(session.rmdir(path))
}

// ===== Control connections =====

struct FtpConnections {
    dialer: Arc<dyn FtpDialer>,
    endpoint: FtpEndpoint,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn FtpSession>>>,
    closed: AtomicBool,
}

impl FtpConnections {
    fn new(dialer: Arc<dyn FtpDialer>, endpoint: FtpEndpoint, limit: usize) -> Self {
        Self {
            dialer,
            endpoint,
            permits: Arc::new(Semaphore::new(limit)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reserve a connection slot; the connection itself is opened lazily
    async fn checkout(self: &Arc<Self>) -> Result<Lease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed_error())?;
        let session = self.idle.lock().pop();
        Ok(Lease {
            pool: self.clone(),
            session,
            _permit: permit,
        })
    }

    /// Run `op` on a checked-out connection on the blocking pool
    async fn run<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn FtpSession) -> std::result::Result<T, FtpError> + Send + 'static,
    {
        let mut lease = self.checkout().await?;
        tokio::task::spawn_blocking(move || {
            let result = lease.session().and_then(|s| op(s));
            lease.settle(result)
        })
        .await
        .map_err(|e| RemoteFsError::Transport(format!("ftp task failed: {}", e)))?
    }

    /// Refuse new checkouts and quit idle connections
    ///
    /// Connections still checked out are quit when their lease ends.
    fn close(&self) -> std::result::Result<(), FtpError> {
        let sessions = {
            let mut idle = self.idle.lock();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *idle)
        };
        self.permits.close();

        let mut first_error = None;
        for mut session in sessions {
            if let Err(e) = session.quit() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn closed_error() -> RemoteFsError {
    RemoteFsError::Transport("ftp session closed".to_string())
}

/// Exclusive use of one control connection
struct Lease {
    pool: Arc<FtpConnections>,
    session: Option<Box<dyn FtpSession>>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    fn session(&mut self) -> std::result::Result<&mut (dyn FtpSession + 'static), FtpError> {
        if self.session.is_none() {
            debug!(
                "ftp: opening control connection to {}:{}",
                self.pool.endpoint.host, self.pool.endpoint.port
            );
            self.session = Some(self.pool.dialer.dial(&self.pool.endpoint)?);
        }
        self.session
            .as_deref_mut()
            .ok_or_else(|| FtpError::Protocol("no control connection".to_string()))
    }

    /// Map the outcome, dropping the connection when it can't be reused
    fn settle<T>(&mut self, result: std::result::Result<T, FtpError>) -> Result<T> {
        result.map_err(|e| {
            if e.is_connection_error() {
                trace!("ftp: discarding broken control connection");
                self.session = None;
            }
            map_ftp_error(e)
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        {
            let mut idle = self.pool.idle.lock();
            if !self.pool.closed.load(Ordering::SeqCst) {
                idle.push(session);
                return;
            }
        }
        if let Err(e) = session.quit() {
            trace!("ftp: quit after close failed: {}", e);
        }
    }
}

// ===== Adapter =====

/// Live FTP adapter for one parameter set
pub struct FtpBackend {
    connections: Arc<FtpConnections>,
    home: String,
}

#[async_trait]
impl Backend for FtpBackend {
    async fn home(&self) -> Result<String> {
        Ok(self.home.clone())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        trace!("ftp: list path={:?}", path);
        let path = path.to_string();
        self.connections.run(move |s| s.list(&path)).await
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        trace!("ftp: read path={:?}", path);
        let path = path.to_string();
        let mut lease = self.connections.checkout().await?;
        Ok(spawn_reader(move |out| {
            let result = lease.session().and_then(|s| s.retrieve(&path, out));
            lease.settle(result).map(|_| ())
        }))
    }

    async fn write(&self, path: &str, content: ByteStream) -> Result<()> {
        trace!("ftp: write path={:?}", path);
        let path = path.to_string();
        let mut lease = self.connections.checkout().await?;
        drain_into(content, move |input| {
            let result = lease.session().and_then(|s| s.store(&path, input));
            lease.settle(result).map(|_| ())
        })
        .await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        trace!("ftp: mkdir path={:?}", path);
        let path = path.to_string();
        self.connections.run(move |s| s.mkdir(&path)).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        trace!("ftp: remove path={:?}", path);
        let path = path.to_string();
        self.connections.run(move |s| remove_recursive(s, &path)).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        trace!("ftp: rename from={:?} to={:?}", from, to);
        let (from, to) = (from.to_string(), to.to_string());
        self.connections.run(move |s| s.rename(&from, &to)).await
    }

    async fn touch(&self, path: &str) -> Result<()> {
        trace!("ftp: touch path={:?}", path);
        let path = path.to_string();
        self.connections
            .run(move |s| s.store(&path, &mut std::io::empty()).map(|_| ()))
            .await
    }

    async fn close(&self) -> Result<()> {
        let connections = self.connections.clone();
        tokio::task::spawn_blocking(move || connections.close())
            .await
            .map_err(|e| RemoteFsError::Transport(format!("ftp task failed: {}", e)))?
            .map_err(|e| RemoteFsError::Transport(e.to_string()))
    }
}

// ===== Factory =====

pub struct FtpFactory {
    dialer: Arc<dyn FtpDialer>,
    settings: FtpSettings,
    pool: SessionPool<FtpBackend>,
}

impl FtpFactory {
    /// Factory using the `suppaftp` client
    pub fn new(settings: FtpSettings) -> Self {
        Self::with_dialer(Arc::new(SuppaFtpDialer), settings)
    }

    pub fn with_dialer(dialer: Arc<dyn FtpDialer>, settings: FtpSettings) -> Self {
        let pool = SessionPool::new("ftp", &settings.cache);
        Self {
            dialer,
            settings,
            pool,
        }
    }

    async fn connect(&self, params: ConnectionParams) -> Result<FtpBackend> {
        let endpoint = endpoint(&params, self.settings.connect_timeout)?;
        let limit = params
            .get("conn")
            .parse::<usize>()
            .unwrap_or(DEFAULT_CONNECTIONS)
            .clamp(1, MAX_CONNECTIONS);
        let dialer = self.dialer.clone();

        let probe_endpoint = endpoint.clone();
        let probe_dialer = dialer.clone();
        let (session, home) = tokio::task::spawn_blocking(move || -> Result<(Box<dyn FtpSession>, String)> {
            let mut session = probe_dialer.dial(&probe_endpoint).map_err(|e| match e.code() {
                Some(530) => RemoteFsError::AuthenticationFailed,
                _ => map_ftp_error(e),
            })?;
            if let Err(e) = session.list("/") {
                debug!("ftp: verification listing failed: {}", e);
                if let Err(e) = session.quit() {
                    trace!("ftp: quit after failed verification: {}", e);
                }
                return Err(RemoteFsError::AuthenticationFailed);
            }
            let home = session.pwd().unwrap_or_else(|e| {
                trace!("ftp: pwd failed, browsing from root: {}", e);
                "/".to_string()
            });
            Ok((session, home))
        })
        .await
        .map_err(|e| RemoteFsError::Transport(format!("ftp task failed: {}", e)))??;

        debug!("ftp: connected to {}:{} as {}", endpoint.host, endpoint.port, endpoint.username);
        let connections = FtpConnections::new(dialer, endpoint, limit);
        connections.idle.lock().push(session);
        Ok(FtpBackend {
            connections: Arc::new(connections),
            home,
        })
    }
}

#[async_trait]
impl BackendFactory for FtpFactory {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn login_form(&self) -> Form {
        Form {
            elements: vec![
                FormElement::backend_type("ftp"),
                FormElement::new("hostname", InputType::Text).placeholder("Hostname*"),
                FormElement::new("username", InputType::Text).placeholder("Username"),
                FormElement::new("password", InputType::Password).placeholder("Password"),
                FormElement::new("advanced", InputType::Enable)
                    .placeholder("Advanced")
                    .target(["ftp_path", "ftp_port", "ftp_conn"]),
                FormElement::new("path", InputType::Text)
                    .id("ftp_path")
                    .placeholder("Path"),
                FormElement::new("port", InputType::Number)
                    .id("ftp_port")
                    .placeholder("Port"),
                FormElement::new("conn", InputType::Number)
                    .id("ftp_conn")
                    .placeholder("Number of connections"),
            ],
        }
    }

    async fn init(&self, params: ConnectionParams) -> Result<Arc<dyn Backend>> {
        let params = normalize_params(params);
        let backend: Arc<dyn Backend> = self.pool.get_or_init(params, |p| self.connect(p)).await?;
        Ok(backend)
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
        if !self.pool.is_empty() {
            warn!("ftp: sessions left after shutdown");
        }
    }
}
