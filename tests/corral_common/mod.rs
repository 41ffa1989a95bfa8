//! Shared helpers for corral integration tests.
//!
//! A "process" is modelled as one [`Corral`] facade; several facades over
//! one [`InMemoryStore`] behave like several processes sharing a store.

#![allow(dead_code)]

use std::sync::Arc;

use corral::Corral;
use corral::CorralConfig;
use corral::InMemoryStore;
use corral::SharedStoreRef;

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Defaults with poll intervals short enough for tests.
pub fn test_config() -> CorralConfig {
    let mut config = CorralConfig::default();
    config.semaphore.poll_interval_ms = 5;
    config.rate_limiter.poll_interval_ms = 5;
    config.cache.poll_interval_ms = 5;
    config
}

/// `processes` facades sharing one store.
pub fn cluster(processes: usize, config: &CorralConfig) -> (Arc<InMemoryStore>, Vec<Corral>) {
    let store = Arc::new(InMemoryStore::new());
    let shared: SharedStoreRef = store.clone();
    let facades = (0..processes)
        .map(|_| Corral::with_store(config.clone(), Some(Arc::clone(&shared))).expect("valid test config"))
        .collect();
    (store, facades)
}
