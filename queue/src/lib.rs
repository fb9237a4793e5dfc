//! Re-scrape scheduling for imagespy.
//!
//! A typed, bounded worker pool plus the two updaters that feed it.

use std::sync::Arc;

use imagespy_core::config::UpdaterConfig;
use imagespy_core::error::Result;
use imagespy_core::event::EventEmitter;
use imagespy_runtime::metrics::UpdaterMetrics;
use imagespy_runtime::oci::RegistryClient;
use imagespy_runtime::scrape::ImageScraper;
use imagespy_runtime::store::Store;
use serde::{Deserialize, Serialize};

pub mod pool;
pub mod updater;

pub use pool::{TaskHandler, TaskOutcome, UpdateTask, WorkerPool};
pub use updater::{AllImagesUpdater, LatestImageUpdater, RunReport, Updater, UpdaterContext};

/// Worker pool statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub worker_count: usize,
    /// Tasks handed to the pool
    pub submitted: usize,
    /// Tasks handled, successfully or not
    pub completed: usize,
    /// Tasks that reported at least one failure
    pub failed: usize,
    /// Tasks running right now
    pub active: usize,
    /// Highest number of tasks that ran at the same time
    pub peak_active: usize,
}

/// Builds updaters sharing one set of collaborators.
pub struct UpdaterBuilder {
    store: Arc<dyn Store>,
    registry: Arc<dyn RegistryClient>,
    scraper: Arc<dyn ImageScraper>,
    metrics: Option<UpdaterMetrics>,
    events: Option<EventEmitter>,
    worker_count: usize,
}

impl UpdaterBuilder {
    /// Create a new updater builder
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<dyn RegistryClient>,
        scraper: Arc<dyn ImageScraper>,
    ) -> Self {
        Self {
            store,
            registry,
            scraper,
            metrics: None,
            events: None,
            worker_count: UpdaterConfig::default().worker_count,
        }
    }

    /// Take the worker count from configuration
    pub fn with_config(mut self, config: &UpdaterConfig) -> Self {
        self.worker_count = config.worker_count;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Record runs into these metrics instead of a private set
    pub fn with_metrics(mut self, metrics: UpdaterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    fn context(self) -> Result<(UpdaterContext, usize)> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => UpdaterMetrics::new()?,
        };
        let context = UpdaterContext {
            store: self.store,
            registry: self.registry,
            scraper: self.scraper,
            metrics,
            events: self.events.unwrap_or_default(),
        };
        Ok((context, self.worker_count))
    }

    /// Build the latest-tag updater
    pub fn build_latest(self) -> Result<LatestImageUpdater> {
        let (context, worker_count) = self.context()?;
        LatestImageUpdater::new(context, worker_count)
    }

    /// Build the all-tags updater
    pub fn build_all(self) -> Result<AllImagesUpdater> {
        let (context, worker_count) = self.context()?;
        AllImagesUpdater::new(context, worker_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagespy_core::error::SpyError;
    use imagespy_runtime::testing::FakeRegistry;
    use imagespy_runtime::{MemoryStore, Scraper};

    fn builder() -> UpdaterBuilder {
        let registry = Arc::new(FakeRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let scraper = Arc::new(Scraper::new(
            registry.clone(),
            store.clone(),
            EventEmitter::default(),
        ));
        UpdaterBuilder::new(store, registry, scraper)
    }

    #[test]
    fn test_builder_uses_config_worker_count() {
        let config = UpdaterConfig {
            worker_count: 4,
            ..Default::default()
        };
        let updater = builder().with_config(&config).build_latest().unwrap();
        assert_eq!(updater.pool().worker_count(), 4);
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = builder().with_worker_count(0).build_all();
        assert!(matches!(result, Err(SpyError::Queue(_))));
    }

    #[tokio::test]
    async fn test_run_on_empty_store() {
        let updater = builder().build_latest().unwrap();
        let report = updater.run().await.unwrap();
        assert_eq!(report.groups, 0);
        assert_eq!(report.failures, 0);
        assert_eq!(updater.pool().stats().submitted, 0);
    }
}
