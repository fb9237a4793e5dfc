//! Periodic re-scrape runs.
//!
//! [`LatestImageUpdater`] re-checks every tag currently flagged latest, so a
//! newer version pushed upstream is picked up. [`AllImagesUpdater`] walks the
//! full tag list of every known repository.
//!
//! Both group work per repository and dispatch it to a [`WorkerPool`].
//! Individual scrape failures are logged and counted; a run only fails when
//! its work list cannot be built.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use imagespy_core::error::{Result, StepContext};
use imagespy_core::event::{events, EventEmitter, SpyEvent};
use imagespy_runtime::metrics::UpdaterMetrics;
use imagespy_runtime::oci::{ImageReference, RegistryClient};
use imagespy_runtime::scrape::ImageScraper;
use imagespy_runtime::store::{ImageGetOptions, Store, TagListOptions};
use serde::{Deserialize, Serialize};

use crate::pool::{TaskHandler, TaskOutcome, UpdateTask, WorkerPool};

/// Summary of one updater run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Repository groups dispatched
    pub groups: usize,
    /// Successful scrapes
    pub scraped: usize,
    /// Failed scrapes
    pub failures: usize,
    /// Wall time of the run
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A re-scrape run over the store.
#[async_trait]
pub trait Updater: Send + Sync {
    async fn run(&self) -> Result<RunReport>;
}

/// Collaborators shared by both updaters.
#[derive(Clone)]
pub struct UpdaterContext {
    pub store: Arc<dyn Store>,
    pub registry: Arc<dyn RegistryClient>,
    pub scraper: Arc<dyn ImageScraper>,
    pub metrics: UpdaterMetrics,
    pub events: EventEmitter,
}

impl UpdaterContext {
    async fn dispatch(
        &self,
        kind: &'static str,
        pool: &WorkerPool,
        tasks: Vec<UpdateTask>,
        started: Instant,
        mut outcome: TaskOutcome,
    ) -> Result<RunReport> {
        let groups = tasks.len();
        let handler = Arc::new(ScrapeHandler {
            registry: self.registry.clone(),
            scraper: self.scraper.clone(),
        });
        outcome.merge(pool.run(tasks, handler).await?);

        let report = RunReport {
            groups,
            scraped: outcome.scraped,
            failures: outcome.failures,
            duration: started.elapsed(),
        };
        self.metrics.record_run(report.duration, report.failures);

        tracing::info!(
            updater = kind,
            groups = report.groups,
            scraped = report.scraped,
            failures = report.failures,
            duration_ms = report.duration.as_millis() as u64,
            "Updater run completed"
        );
        self.events.emit(SpyEvent::with_fields(
            events::UPDATER_RUN_COMPLETED,
            [
                ("updater", serde_json::json!(kind)),
                ("groups", serde_json::json!(report.groups)),
                ("scraped", serde_json::json!(report.scraped)),
                ("failures", serde_json::json!(report.failures)),
                (
                    "duration_ms",
                    serde_json::json!(report.duration.as_millis() as u64),
                ),
            ],
        ));
        Ok(report)
    }
}

/// Runs [`UpdateTask`]s against the scraper.
struct ScrapeHandler {
    registry: Arc<dyn RegistryClient>,
    scraper: Arc<dyn ImageScraper>,
}

impl ScrapeHandler {
    async fn scrape_latest(&self, images: &[String]) -> TaskOutcome {
        let mut outcome = TaskOutcome::default();
        for image in images {
            let reference = match ImageReference::from_repository_name(image) {
                Ok(reference) => reference,
                Err(e) => {
                    tracing::error!(image = %image, error = %e, "Invalid stored image reference");
                    outcome.failures += 1;
                    continue;
                }
            };
            match self.scraper.scrape_latest_image(&reference).await {
                Ok(_) => outcome.scraped += 1,
                Err(e) => {
                    tracing::error!(image = %image, error = %e, "Scraping latest image failed");
                    outcome.failures += 1;
                }
            }
        }
        outcome
    }

    async fn scrape_all(&self, repository: &str) -> TaskOutcome {
        let mut outcome = TaskOutcome::default();
        let reference = match ImageReference::from_repository_name(repository) {
            Ok(reference) => reference,
            Err(e) => {
                tracing::error!(repository, error = %e, "Invalid stored repository name");
                outcome.failures += 1;
                return outcome;
            }
        };

        let tags = match self.registry.fetch_tag_list(&reference).await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::error!(repository, error = %e, "Fetching tag list failed");
                outcome.failures += 1;
                return outcome;
            }
        };

        for tag in tags {
            let tagged = reference.with_tag(tag.as_str());
            let result = match self.scraper.scrape_image(&tagged).await {
                Ok(_) => self.scraper.scrape_latest_image(&tagged).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => outcome.scraped += 1,
                Err(e) => {
                    tracing::error!(image = %tagged, error = %e, "Scraping image failed");
                    outcome.failures += 1;
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl TaskHandler for ScrapeHandler {
    async fn handle(&self, task: &UpdateTask) -> TaskOutcome {
        match task {
            UpdateTask::ScrapeLatest { images, .. } => self.scrape_latest(images).await,
            UpdateTask::ScrapeAll { repository } => self.scrape_all(repository).await,
        }
    }
}

/// Re-checks every latest tag, one pool task per repository.
pub struct LatestImageUpdater {
    context: UpdaterContext,
    pool: WorkerPool,
}

impl LatestImageUpdater {
    pub fn new(context: UpdaterContext, worker_count: usize) -> Result<Self> {
        Ok(Self {
            context,
            pool: WorkerPool::new(worker_count)?,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// `"<image-name>:<tag>"` of every latest tag, grouped by image name.
    fn groups(&self, outcome: &mut TaskOutcome) -> Result<BTreeMap<String, Vec<String>>> {
        let store = &self.context.store;
        let tags = store
            .tags()
            .list(&TagListOptions {
                is_latest: Some(true),
                ..Default::default()
            })
            .step("reading latest tags")?;

        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tag in tags {
            match store.images().get(&ImageGetOptions::by_id(tag.image_id)) {
                Ok(image) => groups
                    .entry(image.name.clone())
                    .or_default()
                    .push(format!("{}:{}", image.name, tag.name)),
                Err(e) => {
                    tracing::error!(tag = %tag.name, image_id = tag.image_id, error = %e, "Reading image of latest tag failed");
                    outcome.failures += 1;
                }
            }
        }
        Ok(groups)
    }
}

#[async_trait]
impl Updater for LatestImageUpdater {
    async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let mut outcome = TaskOutcome::default();
        let tasks = self
            .groups(&mut outcome)?
            .into_iter()
            .map(|(repository, images)| UpdateTask::ScrapeLatest { repository, images })
            .collect();
        self.context
            .dispatch("latest", &self.pool, tasks, started, outcome)
            .await
    }
}

/// Scrapes every registry tag of every known repository.
pub struct AllImagesUpdater {
    context: UpdaterContext,
    pool: WorkerPool,
}

impl AllImagesUpdater {
    pub fn new(context: UpdaterContext, worker_count: usize) -> Result<Self> {
        Ok(Self {
            context,
            pool: WorkerPool::new(worker_count)?,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

#[async_trait]
impl Updater for AllImagesUpdater {
    async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let tasks = self
            .context
            .store
            .images()
            .list_names()
            .step("reading image names")?
            .into_iter()
            .map(|repository| UpdateTask::ScrapeAll { repository })
            .collect();
        self.context
            .dispatch("all", &self.pool, tasks, started, TaskOutcome::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_report_serializes_duration_as_millis() {
        let report = RunReport {
            groups: 2,
            scraped: 3,
            failures: 1,
            duration: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], 1500);
        let back: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
