//! SMB/CIFS adapter
//!
//! A session is set up once per parameter set: the shares are enumerated
//! and every non-administrative one is mounted. Contract paths name the
//! share in their first segment; the remainder is handed to the share with
//! `\` separators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::backend::pipe::{drain_into, spawn_reader};
use crate::backend::pool::SessionPool;
use crate::backend::{
    Backend, BackendFactory, ByteStream, ConnectionParams, FileInfo, Form, FormElement, InputType,
};
use crate::cache::CacheConfig;
use crate::error::{RemoteFsError, Result};
use crate::protocol::smb::{SmbDialer, SmbEndpoint, SmbError, SmbErrorKind, SmbSession, SmbShare};

pub const DEFAULT_PORT: &str = "445";
pub const GUEST: &str = "Guest";

// ===== Settings =====

#[derive(Debug, Clone, Deserialize)]
pub struct SambaSettings {
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
        Duration::from_secs(30 * 60),
        Duration::from_secs(5 * 60),
    )
}

impl Default for SambaSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            cache: default_cache(),
        }
    }
}

// ===== Parameters and paths =====

/// Fill defaults; `host` falls back to `hostname`
pub fn normalize_params(mut params: ConnectionParams) -> ConnectionParams {
    if !params.is_set("host") && params.is_set("hostname") {
        let hostname = params.get("hostname").to_string();
        params.set("host", hostname);
    }
    params.set_default("port", DEFAULT_PORT);
    params.set_default("username", GUEST);
    params
}

/// Split a contract path into its share name and share-relative path
///
/// `/docs/a/b.txt` becomes `("docs", "a\b.txt")`; `/docs` names the share
/// root and yields an empty remainder.
pub fn split_share_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(RemoteFsError::NotAllowed(format!("no share in path {:?}", path)));
    }
    let mut segments = trimmed.split('/').filter(|s| !s.is_empty());
    let share = segments.next().unwrap_or_default().to_string();
    let rest = segments.collect::<Vec<_>>().join("\\");
    Ok((share, rest))
}

pub fn map_smb_error(err: SmbError) -> RemoteFsError {
    match err.kind() {
        SmbErrorKind::PermissionDenied => RemoteFsError::PermissionDenied,
        SmbErrorKind::NotFound => RemoteFsError::NotFound(err.to_string()),
        SmbErrorKind::Other => RemoteFsError::Transport(err.to_string()),
    }
}

fn join_error(e: tokio::task::JoinError) -> RemoteFsError {
    RemoteFsError::Transport(format!("samba task failed: {}", e))
}

// ===== Adapter =====

/// Live SMB session with its mounted shares
pub struct SambaBackend {
    session: Arc<dyn SmbSession>,
    shares: BTreeMap<String, Arc<dyn SmbShare>>,
    closed: AtomicBool,
}

impl SambaBackend {
    fn resolve(&self, path: &str) -> Result<(String, Arc<dyn SmbShare>, String)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteFsError::Transport("samba session closed".to_string()));
        }
        let (name, rest) = split_share_path(path)?;
        let share = self
            .shares
            .get(&name)
            .cloned()
            .ok_or_else(|| RemoteFsError::NotFound(format!("share {}", name)))?;
        Ok((name, share, rest))
    }

    /// Like `resolve`, refusing the share root itself
    fn resolve_entry(&self, path: &str) -> Result<(String, Arc<dyn SmbShare>, String)> {
        let resolved = self.resolve(path)?;
        if resolved.2.is_empty() {
            return Err(RemoteFsError::NotAllowed(format!("{:?} is a share root", path)));
        }
        Ok(resolved)
    }

    async fn on_share<T, F>(share: Arc<dyn SmbShare>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SmbShare) -> std::result::Result<T, SmbError> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || op(share.as_ref()))
            .await
            .map_err(join_error)?
            .map_err(map_smb_error)
    }
}

#[async_trait]
impl Backend for SambaBackend {
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        trace!("samba: list path={:?}", path);
        if path == "/" {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RemoteFsError::Transport("samba session closed".to_string()));
            }
            return Ok(self
                .shares
                .keys()
                .map(|name| FileInfo::directory(name.clone(), None))
                .collect());
        }
        let (_, share, dir) = self.resolve(path)?;
        Self::on_share(share, move |s| s.read_dir(&dir)).await
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        trace!("samba: read path={:?}", path);
        let (_, share, file) = self.resolve_entry(path)?;
        Ok(spawn_reader(move |out| {
            share
                .read_file(&file, out)
                .map(|_| ())
                .map_err(map_smb_error)
        }))
    }

    async fn write(&self, path: &str, content: ByteStream) -> Result<()> {
        trace!("samba: write path={:?}", path);
        let (_, share, file) = self.resolve_entry(path)?;
        drain_into(content, move |input| {
            share
                .write_file(&file, input)
                .map(|_| ())
                .map_err(map_smb_error)
        })
        .await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        trace!("samba: mkdir path={:?}", path);
        let (_, share, dir) = self.resolve_entry(path)?;
        Self::on_share(share, move |s| s.mkdir(&dir)).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        trace!("samba: remove path={:?}", path);
        let (_, share, target) = self.resolve_entry(path)?;
        Self::on_share(share, move |s| s.remove_all(&target)).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        trace!("samba: rename from={:?} to={:?}", from, to);
        let (from_share, share, from_path) = self.resolve_entry(from)?;
        let (to_share, _, to_path) = self.resolve_entry(to)?;
        if from_share != to_share {
            return Err(RemoteFsError::NotImplemented(
                "rename across shares".to_string(),
            ));
        }
        Self::on_share(share, move |s| s.rename(&from_path, &to_path)).await
    }

    async fn touch(&self, path: &str) -> Result<()> {
        trace!("samba: touch path={:?}", path);
        let (_, share, file) = self.resolve_entry(path)?;
        Self::on_share(share, move |s| s.write_file(&file, &mut std::io::empty()).map(|_| ())).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = self.session.clone();
        let shares: Vec<_> = self
            .shares
            .iter()
            .map(|(name, share)| (name.clone(), share.clone()))
            .collect();

        tokio::task::spawn_blocking(move || {
            for (name, share) in shares {
                if let Err(e) = share.umount() {
                    warn!("samba: error unmounting share {}: {}", name, e);
                }
            }
            session.logoff()
        })
        .await
        .map_err(join_error)?
        .map_err(|e| RemoteFsError::Transport(format!("logoff failed: {}", e)))
    }
}

// ===== Factory =====

pub struct SambaFactory {
    dialer: Arc<dyn SmbDialer>,
    settings: SambaSettings,
    pool: SessionPool<SambaBackend>,
}

impl SambaFactory {
    /// Factory using libsmbclient
    #[cfg(feature = "libsmbclient")]
    pub fn new(settings: SambaSettings) -> Self {
        Self::with_dialer(Arc::new(crate::protocol::smb::native::PavaoDialer), settings)
    }

    pub fn with_dialer(dialer: Arc<dyn SmbDialer>, settings: SambaSettings) -> Self {
        let pool = SessionPool::new("samba", &settings.cache);
        Self {
            dialer,
            settings,
            pool,
        }
    }

    async fn connect(&self, params: ConnectionParams) -> Result<SambaBackend> {
        let host = params.get("host");
        if host.is_empty() {
            return Err(RemoteFsError::InvalidArgument("missing host".to_string()));
        }
        let port = params.get("port").parse::<u16>().map_err(|_| {
            RemoteFsError::InvalidArgument(format!("invalid port: {}", params.get("port")))
        })?;
        let endpoint = SmbEndpoint {
            host: host.to_string(),
            port,
            username: params.get("username").to_string(),
            password: params.get("password").to_string(),
            domain: params.get("domain").to_string(),
            timeout: self.settings.connect_timeout,
        };
        let dialer = self.dialer.clone();

        tokio::task::spawn_blocking(move || -> Result<SambaBackend> {
            let session = dialer.dial(&endpoint).map_err(|e| match e.kind() {
                SmbErrorKind::PermissionDenied => RemoteFsError::AuthenticationFailed,
                _ => map_smb_error(e),
            })?;

            let names = match session.share_names() {
                Ok(names) => names,
                Err(e) => {
                    debug!("samba: share enumeration failed: {}", e);
                    if let Err(e) = session.logoff() {
                        trace!("samba: logoff after failed enumeration: {}", e);
                    }
                    return Err(RemoteFsError::AuthenticationFailed);
                }
            };

            let mut shares = BTreeMap::new();
            for name in names {
                if name.ends_with('$') {
                    continue;
                }
                match session.mount(&name) {
                    Ok(share) => {
                        shares.insert(name, share);
                    }
                    Err(e) => debug!("samba: skipping share {}: {}", name, e),
                }
            }
            debug!(
                "samba: connected to {}:{} as {} ({} shares)",
                endpoint.host,
                endpoint.port,
                endpoint.username,
                shares.len()
            );

            Ok(SambaBackend {
                session: Arc::from(session),
                shares,
                closed: AtomicBool::new(false),
            })
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl BackendFactory for SambaFactory {
    fn name(&self) -> &'static str {
        "samba"
    }

    fn login_form(&self) -> Form {
        Form {
            elements: vec![
                FormElement::backend_type("samba"),
                FormElement::new("host", InputType::Text).placeholder("Hostname"),
                FormElement::new("username", InputType::Text).placeholder("Username"),
                FormElement::new("password", InputType::Password).placeholder("Password"),
                FormElement::new("advanced", InputType::Enable)
                    .placeholder("Advanced")
                    .target(["samba_port", "samba_path", "samba_domain"]),
                FormElement::new("path", InputType::Text)
                    .id("samba_path")
                    .placeholder("Path"),
                FormElement::new("port", InputType::Number)
                    .id("samba_port")
                    .placeholder("Port - eg: 445"),
                FormElement::new("domain", InputType::Text)
                    .id("samba_domain")
                    .placeholder("Domain"),
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pipe::{bytes_stream, collect};
    use crate::protocol::smb::testing::MemorySmb;
    use futures::StreamExt;

    fn server() -> MemorySmb {
        let server = MemorySmb::new();
        {
            let mut state = server.state.lock();
            state.add_share("docs");
            state.add_share("media");
            state.add_share("IPC$");
            state.add_share("broken");
            state.unmountable.insert("broken".to_string());
            state.add_dir("docs", "reports");
            state.add_file("docs", "reports\\q1.txt", b"revenue");
            state.add_file("media", "song.mp3", b"la");
        }
        server
    }

    fn factory(server: &MemorySmb) -> SambaFactory {
        SambaFactory::with_dialer(server.dialer(), SambaSettings::default())
    }

    fn login() -> ConnectionParams {
        ConnectionParams::new()
            .with("hostname", "nas.local")
            .with("username", "alice")
            .with("password", "secret")
    }

    #[test]
    fn test_normalize_defaults() {
        let params = normalize_params(ConnectionParams::new().with("hostname", "nas"));
        assert_eq!(params.get("host"), "nas");
        assert_eq!(params.get("port"), "445");
        assert_eq!(params.get("username"), "Guest");

        let params = normalize_params(
            ConnectionParams::new()
                .with("host", "primary")
                .with("hostname", "other"),
        );
        assert_eq!(params.get("host"), "primary");
    }

    #[test]
    fn test_split_share_path() {
        assert_eq!(
            split_share_path("/docs/a/b.txt").unwrap(),
            ("docs".to_string(), "a\\b.txt".to_string())
        );
        assert_eq!(
            split_share_path("/docs/").unwrap(),
            ("docs".to_string(), String::new())
        );
        assert!(matches!(split_share_path(""), Err(RemoteFsError::NotAllowed(_))));
        assert!(matches!(split_share_path("/"), Err(RemoteFsError::NotAllowed(_))));
    }

    #[test]
    fn test_login_form_targets_resolve() {
        let form = factory(&MemorySmb::new()).login_form();
        assert_eq!(form.elements[0].value.as_deref(), Some("samba"));
        assert!(form.targets_resolve());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_root_lists_mounted_shares() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        let entries = backend.list("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "media"]);
        assert!(entries.iter().all(|e| e.is_dir()));

        let dials = server.state.lock().dials.clone();
        assert_eq!(dials.len(), 1);
        assert_eq!(dials[0].host, "nas.local");
        assert_eq!(dials[0].port, 445);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_inside_share() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        let entries = backend.list("/docs/reports").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "q1.txt");
        assert_eq!(entries[0].size, 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_share_is_not_found() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        assert!(matches!(backend.list("/nope/x").await, Err(RemoteFsError::NotFound(_))));
        assert!(matches!(backend.list("/broken").await, Err(RemoteFsError::NotFound(_))));
        assert!(matches!(backend.list("").await, Err(RemoteFsError::NotAllowed(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_and_read_back() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        backend.create_dir("/docs/new").await.unwrap();
        backend
            .write("/docs/new/a.txt", bytes_stream(&b"payload"[..]))
            .await
            .unwrap();
        tokio_test::assert_ok!(backend.touch("/docs/new/empty").await);

        {
            let state = server.state.lock();
            assert_eq!(state.content("docs", "new\\a.txt").as_deref(), Some(&b"payload"[..]));
            assert_eq!(state.content("docs", "new\\empty").as_deref(), Some(&b""[..]));
        }

        let data = collect(backend.read("/docs/new/a.txt").await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"payload");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_classification() {
        let server = server();
        server
            .state
            .lock()
            .denied
            .insert("docs\\reports".to_string());
        let backend = factory(&server).init(login()).await.unwrap();

        assert!(matches!(
            backend.list("/docs/reports").await,
            Err(RemoteFsError::PermissionDenied)
        ));
        assert!(matches!(
            backend.remove("/media/missing").await,
            Err(RemoteFsError::NotFound(_))
        ));

        let mut stream = backend.read("/media/missing").await.unwrap();
        assert!(matches!(stream.next().await, Some(Err(RemoteFsError::NotFound(_)))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_tree() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        backend.remove("/docs/reports/").await.unwrap();
        let state = server.state.lock();
        assert!(!state.exists("docs", "reports"));
        assert!(!state.exists("docs", "reports\\q1.txt"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_share_root_is_not_removable() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        assert!(matches!(backend.remove("/docs/").await, Err(RemoteFsError::NotAllowed(_))));
        assert!(server.state.lock().exists("docs", "reports"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rename_within_share() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        backend
            .rename("/docs/reports/q1.txt", "/docs/reports/q2.txt")
            .await
            .unwrap();
        let state = server.state.lock();
        assert!(state.exists("docs", "reports\\q2.txt"));
        assert!(!state.exists("docs", "reports\\q1.txt"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rename_across_shares_is_not_implemented() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();

        let result = backend.rename("/docs/reports/q1.txt", "/media/q1.txt").await;
        assert!(matches!(result, Err(RemoteFsError::NotImplemented(_))));

        let state = server.state.lock();
        assert!(state.renames.is_empty());
        assert!(state.exists("docs", "reports\\q1.txt"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_login() {
        let server = server();
        let result = factory(&server)
            .init(login().with("password", "wrong"))
            .await;
        assert!(matches!(result, Err(RemoteFsError::AuthenticationFailed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_enumeration_is_not_cached() {
        let server = server();
        server.state.lock().fail_share_listing = true;
        let factory = factory(&server);

        let result = factory.init(login()).await;
        assert!(matches!(result, Err(RemoteFsError::AuthenticationFailed)));
        assert_eq!(server.state.lock().logoffs, 1);

        server.state.lock().fail_share_listing = false;
        factory.init(login()).await.unwrap();
        assert_eq!(server.state.lock().dials.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_eviction_unmounts_and_logs_off() {
        let server = server();
        let factory = factory(&server);
        factory.init(login()).await.unwrap();
        factory.shutdown().await;

        let state = server.state.lock();
        assert_eq!(state.umounts, vec!["docs".to_string(), "media".to_string()]);
        assert_eq!(state.logoffs, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logoff_failure_still_evicts() {
        let server = server();
        server.state.lock().fail_logoff = true;
        let factory = factory(&server);

        factory.init(login()).await.unwrap();
        factory.shutdown().await;
        assert!(factory.pool.is_empty());

        factory.init(login()).await.unwrap();
        assert_eq!(server.state.lock().dials.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_operations_fail_after_close() {
        let server = server();
        let backend = factory(&server).init(login()).await.unwrap();
        backend.close().await.unwrap();

        assert!(matches!(backend.list("/").await, Err(RemoteFsError::Transport(_))));
        assert!(matches!(
            backend.list("/docs/reports").await,
            Err(RemoteFsError::Transport(_))
        ));
    }
}
