//! Named client connections shared across an application.
//!
//! Uses DashMap so lookups from many tasks never contend on a single lock.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::client::FailsafeClient;
use crate::core::error::ClientResult;

/// Keeps one [`FailsafeClient`] per connection name.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: DashMap<String, Arc<FailsafeClient>>,
}

impl ConnectionRegistry {
    #[inline]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Returns the client registered under `name`, building it with `create`
    /// if absent.
    ///
    /// # Arguments
    /// - `name`: Connection name, also used as the client name.
    /// - `create`: Called only when no client is registered yet.
    ///
    /// # Errors
    /// Whatever `create` returns. Nothing is registered in that case.
    pub fn get_or_create<F>(&self, name: &str, create: F) -> ClientResult<Arc<FailsafeClient>>
    where
        F: FnOnce() -> ClientResult<FailsafeClient>,
    {
        if let Some(existing) = self.clients.get(name) {
            return Ok(Arc::clone(&*existing));
        }

        let client = Arc::new(create()?);

        // Insert only if not already present (handles race)
        let entry = self
            .clients
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&client));
        debug!(target: "blipmq_client::registry", name, "client registered");
        Ok(Arc::clone(&*entry))
    }

    /// Registers `client` under its own name, returning the one it replaced.
    pub fn insert(&self, client: FailsafeClient) -> Option<Arc<FailsafeClient>> {
        self.clients
            .insert(client.name().to_string(), Arc::new(client))
    }

    pub fn get(&self, name: &str) -> Option<Arc<FailsafeClient>> {
        self.clients.get(name).map(|c| Arc::clone(&*c))
    }

    #[inline]
    pub fn remove(&self, name: &str) -> Option<Arc<FailsafeClient>> {
        self.clients.remove(name).map(|(_, c)| c)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Removes every client and shuts it down.
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<FailsafeClient>> = self
            .clients
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.clients.clear();
        for client in clients {
            client.shutdown().await;
        }
    }
}
