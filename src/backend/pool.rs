//! Per-protocol pool of initialized adapters
//!
//! Wraps a [`ConnectionCache`] keyed by normalized connection parameters.
//! Evicted adapters are closed on the runtime in the background, and
//! concurrent initializations of the same parameter set are serialized so
//! only one of them dials.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backend::{Backend, ConnectionParams};
use crate::cache::{CacheConfig, ConnectionCache};
use crate::error::Result;

pub struct SessionPool<B> {
    protocol: &'static str,
    cache: Arc<ConnectionCache<ConnectionParams, Arc<B>>>,
    gates: DashMap<ConnectionParams, Arc<AsyncMutex<()>>>,
    closing: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<B> SessionPool<B>
where
    B: Backend + 'static,
{
    /// Create a pool; when called inside a runtime and the config sets a
    /// sweep interval, idle adapters are also purged in the background
    pub fn new(protocol: &'static str, config: &CacheConfig) -> Self {
        let cache = Arc::new(ConnectionCache::new(config));
        let closing: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let pending = closing.clone();
        cache.on_evict(move |params: &ConnectionParams, backend: Arc<B>| {
            debug!("{}: evicting session {:?}", protocol, params);
            match Handle::try_current() {
                Ok(handle) => {
                    let task = handle.spawn(async move {
                        if let Err(e) = backend.close().await {
                            warn!("{}: error closing session: {}", protocol, e);
                        }
                    });
                    let mut pending = pending.lock();
                    pending.retain(|t| !t.is_finished());
                    pending.push(task);
                }
                Err(_) => warn!("{}: no runtime available, dropping session unclosed", protocol),
            }
        });

        if let (Some(interval), Ok(_)) = (config.sweep_interval, Handle::try_current()) {
            cache.spawn_sweeper(interval);
        }

        Self {
            protocol,
            cache,
            gates: DashMap::new(),
            closing,
        }
    }

    /// Cached adapter for `params`, or the one `connect` builds
    ///
    /// `connect` runs only on a miss and at most once at a time per
    /// parameter set. Its failure is returned and nothing is cached.
    pub async fn get_or_init<F, Fut>(&self, params: ConnectionParams, connect: F) -> Result<Arc<B>>
    where
        F: FnOnce(ConnectionParams) -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        if let Some(backend) = self.cache.get(&params) {
            trace!("{}: session cache hit", self.protocol);
            return Ok(backend);
        }

        let gate = self.gates.entry(params.clone()).or_default().clone();
        let gate = scopeguard::guard(gate, |gate| {
            // Map entry plus this handle means nobody else is waiting
            self.gates
                .remove_if(&params, |_, g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) == 2);
        });
        let _held = gate.lock().await;

        if let Some(backend) = self.cache.get(&params) {
            trace!("{}: session initialized by a concurrent caller", self.protocol);
            return Ok(backend);
        }

        debug!("{}: opening session {:?}", self.protocol, params);
        let backend = Arc::new(connect(params.clone()).await?);
        self.cache.set(params.clone(), backend.clone());
        Ok(backend)
    }

    /// Drop the adapter cached for `params`, closing it
    pub fn invalidate(&self, params: &ConnectionParams) -> bool {
        self.cache.invalidate(params)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Evict every adapter and wait until all pending closes finish
    pub async fn shutdown(&self) {
        let evicted = self.cache.clear();
        if evicted > 0 {
            debug!("{}: closing {} sessions", self.protocol, evicted);
        }
        let pending = std::mem::take(&mut *self.closing.lock());
        for task in pending {
            if let Err(e) = task.await {
                warn!("{}: close task failed: {}", self.protocol, e);
            }
        }
    }
}
