//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relayrace::catalog::{encode_entries, Capability, CatalogStore, ServerCatalog, ServerEntry, SqliteStore};
use relayrace::config::Config;
use relayrace::pool::{PoolConfig, RemoteListRefresher};
use relayrace::task::TaskConfig;
use relayrace::transport::TransportKind;

/// SSH-capable server with complete credentials.
pub fn server(i: usize) -> ServerEntry {
    ServerEntry::new(format!("relay-{i}"))
        .with_ssh(22, "tunnel", "secret", "AAAAC3NzaC1lZDI1NTE5")
        .with_capabilities([Capability::Ssh])
}

pub fn servers(n: usize) -> Vec<ServerEntry> {
    (0..n).map(server).collect()
}

pub fn addresses(entries: &[ServerEntry]) -> Vec<String> {
    entries.iter().map(|e| e.address.clone()).collect()
}

/// In-memory store with `entries` persisted under the SSH catalog key.
pub fn seeded_store(entries: &[ServerEntry]) -> Arc<dyn CatalogStore> {
    let store: Arc<dyn CatalogStore> = Arc::new(SqliteStore::in_memory().unwrap());
    store
        .save(TransportKind::Ssh.capability().as_str(), &encode_entries(entries).unwrap())
        .unwrap();
    store
}

pub fn seeded_catalog(entries: &[ServerEntry]) -> Arc<ServerCatalog> {
    Arc::new(ServerCatalog::new(
        TransportKind::Ssh.capability().as_str(),
        seeded_store(entries),
        Vec::new(),
    ))
}

pub fn pool_config() -> PoolConfig {
    PoolConfig {
        pool_limit: 10,
        head_size: 2,
        head_start: Duration::from_millis(500),
        poll_interval: Duration::from_millis(25),
        connect_timeout: Duration::from_secs(10),
    }
}

pub fn task_config() -> TaskConfig {
    TaskConfig {
        poll_interval: Duration::from_millis(20),
        graceful_stop_timeout: Duration::from_millis(200),
        barrier_timeout: Duration::from_secs(1),
    }
}

/// Configuration with short intervals for orchestrator tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.pool = PoolConfig {
        head_start: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
        connect_timeout: Duration::from_secs(2),
        ..pool_config()
    };
    config.task = task_config();
    config.reachability.enabled = false;
    config
}

/// Counts refresh requests.
#[derive(Default)]
pub struct CountingRefresher(AtomicUsize);

impl CountingRefresher {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl RemoteListRefresher for CountingRefresher {
    fn request_refresh(&self, _kind: TransportKind) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
