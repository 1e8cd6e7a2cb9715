use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use gearshift_core::config::ConnectionConfig;
use gearshift_core::{GearshiftConfig, GearshiftError, Result};
use tracing::info;

use crate::client::BrokerClient;
use crate::gearman::GearmanClient;

/// Builds the client for one named connection.
pub trait ClientFactory: Send + Sync {
    fn create(&self, name: &str, config: &ConnectionConfig) -> Arc<dyn BrokerClient>;
}

/// Produces real [`GearmanClient`]s.
#[derive(Debug, Default)]
pub struct GearmanClientFactory;

impl ClientFactory for GearmanClientFactory {
    fn create(&self, name: &str, config: &ConnectionConfig) -> Arc<dyn BrokerClient> {
        Arc::new(GearmanClient::new(name, config))
    }
}

/// Named connection configs plus a lazily filled cache of one client per
/// name. The configs never change after construction.
pub struct ConnectionRegistry {
    connections: BTreeMap<String, ConnectionConfig>,
    factory: Box<dyn ClientFactory>,
    clients: Mutex<HashMap<String, Arc<dyn BrokerClient>>>,
}

impl ConnectionRegistry {
    pub fn new(connections: BTreeMap<String, ConnectionConfig>) -> Self {
        Self::with_factory(connections, GearmanClientFactory)
    }

    pub fn with_factory(
        connections: BTreeMap<String, ConnectionConfig>,
        factory: impl ClientFactory + 'static,
    ) -> Self {
        Self {
            connections,
            factory: Box::new(factory),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &GearshiftConfig) -> Self {
        Self::new(config.connections.clone())
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Client for `name`, built on first use and cached afterwards.
    pub fn get(&self, name: &str) -> Result<Arc<dyn BrokerClient>> {
        let config = self.connections.get(name).ok_or_else(|| {
            GearshiftError::config(format!(
                "Can't create client '{name}'. Connection configuration is missing."
            ))
        })?;

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(name) {
            return Ok(Arc::clone(client));
        }
        let client = self.factory.create(name, config);
        info!(connection = %name, servers = %config.servers(), "broker client created");
        clients.insert(name.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Every client built so far. Never builds new ones.
    pub fn get_all(&self) -> Vec<Arc<dyn BrokerClient>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::client::{DispatchOutcome, JobRequest, TaskBatch};
    use crate::dispatch::DispatchOp;
    use crate::error::BrokerError;

    struct NullClient(String);

    #[async_trait]
    impl BrokerClient for NullClient {
        fn name(&self) -> &str {
            &self.0
        }
        async fn submit(
            &self,
            _op: DispatchOp,
            _job: &JobRequest,
        ) -> std::result::Result<DispatchOutcome, BrokerError> {
            Err(BrokerError::Closed)
        }
        async fn run_tasks(
            &self,
            _batch: TaskBatch,
        ) -> std::result::Result<Vec<DispatchOutcome>, BrokerError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingFactory(Arc<AtomicUsize>);

    impl ClientFactory for CountingFactory {
        fn create(&self, name: &str, _config: &ConnectionConfig) -> Arc<dyn BrokerClient> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Arc::new(NullClient(name.to_string()))
        }
    }

    fn registry(created: Arc<AtomicUsize>) -> ConnectionRegistry {
        let connections = BTreeMap::from([
            ("a".to_string(), ConnectionConfig::default()),
            ("b".to_string(), ConnectionConfig::default()),
        ]);
        ConnectionRegistry::with_factory(connections, CountingFactory(created))
    }

    #[test]
    fn get_caches_one_client_per_name() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = registry(created.clone());

        let first = registry.get("a").unwrap();
        let second = registry.get("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "a");
        assert_eq!(created.load(Ordering::SeqCst), 1);

        registry.get("b").unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn get_all_returns_only_built_clients() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        assert!(registry.get_all().is_empty());

        registry.get("b").unwrap();
        let all = registry.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), "b");
    }

    #[test]
    fn unknown_connection_is_a_configuration_error() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = registry(created.clone());

        let err = registry.get("nope").err().unwrap();
        assert_eq!(
            err.to_string(),
            "Configuration error: Can't create client 'nope'. Connection configuration is missing."
        );
        assert!(!registry.is_configured("nope"));
        assert!(registry.is_configured("a"));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_gets_build_a_single_client() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry(created.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("a").map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
