//! Named client instances.
//!
//! Instances are keyed by project token or any other caller-chosen name.
//! Nothing is created implicitly: a name resolves only after it has been
//! registered or initialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::Result;

use super::Tally;

/// Lookup table from name to live client.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<Tally>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by the whole process.
    pub fn global() -> &'static ClientRegistry {
        static GLOBAL: OnceLock<ClientRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ClientRegistry::new)
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Tally>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `client` under `name`, returning the client it replaced.
    pub fn register(&self, name: impl Into<String>, client: Arc<Tally>) -> Option<Arc<Tally>> {
        let name = name.into();
        tracing::debug!(name = %name, "Registered client");
        self.clients().insert(name, client)
    }

    /// Client under `name`, building and registering it with `init` if absent.
    pub fn get_or_init<F>(&self, name: &str, init: F) -> Result<Arc<Tally>>
    where
        F: FnOnce() -> Result<Tally>,
    {
        let mut clients = self.clients();
        if let Some(client) = clients.get(name) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(init()?);
        clients.insert(name.to_string(), Arc::clone(&client));
        tracing::debug!(name = %name, "Registered client");
        Ok(client)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tally>> {
        self.clients().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Tally>> {
        self.clients().remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use crate::error::Error;
    use crate::identity::RandomIdentifierProvider;
    use crate::persistence::MemoryStore;
    use crate::transport::{AckInfo, Transport, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Accept;

    #[async_trait]
    impl Transport for Accept {
        async fn submit(
            &self,
            _endpoint: &str,
            _batch: &[u8],
        ) -> std::result::Result<AckInfo, TransportError> {
            Ok(AckInfo { status: 200 })
        }
    }

    fn client(token: &str) -> Result<Tally> {
        Tally::builder(
            ClientOptions::new(token, "https://ingest.example.com")
                .with_flush_interval(Duration::ZERO)
                .with_archive_interval(Duration::ZERO),
        )
        .transport(Arc::new(Accept))
        .store(Box::new(MemoryStore::new()))
        .identifier_provider(Box::new(RandomIdentifierProvider))
        .build()
    }

    #[test]
    fn test_get_or_init_reuses_instance() {
        let registry = ClientRegistry::new();
        let first = registry.get_or_init("tok", || client("tok")).unwrap();
        let second = registry
            .get_or_init("tok", || panic!("should not build twice"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.names(), vec!["tok".to_string()]);
    }

    #[test]
    fn test_failed_init_registers_nothing() {
        let registry = ClientRegistry::new();
        let result = registry.get_or_init("broken", || Err(Error::Config("nope".to_string())));
        assert!(result.is_err());
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ClientRegistry::new();
        let a = Arc::new(client("a").unwrap());
        assert!(registry.register("primary", Arc::clone(&a)).is_none());
        assert_eq!(registry.get("primary").unwrap().token(), "a");

        let b = Arc::new(client("b").unwrap());
        let replaced = registry.register("primary", b).unwrap();
        assert!(Arc::ptr_eq(&replaced, &a));

        assert!(registry.remove("primary").is_some());
        assert!(registry.names().is_empty());
    }
}
