//! Identifier to factory dispatch table

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, BackendFactory, ConnectionParams, Form};
use crate::error::{RemoteFsError, Result};

/// Factories known to the application, built once at startup
#[derive(Default, Clone)]
pub struct BackendRegistry {
    factories: HashMap<&'static str, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own name, replacing any previous one
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) -> &mut Self {
        debug!("registering backend: {}", factory.name());
        self.factories.insert(factory.name(), factory);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteFsError::NotFound(format!("backend type {}", name)))
    }

    /// Registered identifiers, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Initialize a backend of type `name`
    pub async fn init(&self, name: &str, params: ConnectionParams) -> Result<Arc<dyn Backend>> {
        self.get(name)?.init(params).await
    }

    /// Login forms of every registered backend, sorted by identifier
    pub fn forms(&self) -> Vec<(&'static str, Form)> {
        self.names()
            .into_iter()
            .filter_map(|name| self.factories.get(name).map(|f| (name, f.login_form())))
            .collect()
    }

    /// Close the cached sessions of every factory
    pub async fn shutdown(&self) {
        for factory in self.factories.values() {
            factory.shutdown().await;
        }
    }
}
