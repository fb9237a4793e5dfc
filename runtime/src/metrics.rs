//! Updater run metrics in Prometheus format.

use std::time::Duration;

use imagespy_core::error::{Result, SpyError};
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};

/// Prometheus namespace of all updater metrics.
pub const NAMESPACE: &str = "imagespy_updater";

/// Gauges describing the most recent updater run.
///
/// Owns its registry so several updaters (or tests) never collide on a
/// process-wide default registry.
#[derive(Clone)]
pub struct UpdaterMetrics {
    registry: Registry,
    last_completion: Gauge,
    duration: Gauge,
    last_scrape_fails: Gauge,
}

impl UpdaterMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let last_completion = register_gauge(
            &registry,
            "last_completion_timestamp_seconds",
            "The timestamp of the last completion of an updater run.",
        )?;
        let duration = register_gauge(
            &registry,
            "duration_seconds",
            "The duration of the last updater run in seconds.",
        )?;
        let last_scrape_fails = register_gauge(
            &registry,
            "last_scrape_fails",
            "Number of failed scrapes during the last updater run.",
        )?;

        Ok(Self {
            registry,
            last_completion,
            duration,
            last_scrape_fails,
        })
    }

    /// Record a finished run.
    pub fn record_run(&self, duration: Duration, failures: usize) {
        self.duration.set(duration.as_secs_f64());
        self.last_scrape_fails.set(failures as f64);
        self.last_completion
            .set(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
    }

    pub fn last_scrape_fails(&self) -> f64 {
        self.last_scrape_fails.get()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration.get()
    }

    pub fn last_completion_timestamp(&self) -> f64 {
        self.last_completion.get()
    }

    /// Text exposition of all gauges.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| SpyError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| SpyError::Metrics(e.to_string()))
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
        .map_err(|e| SpyError::Metrics(e.to_string()))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| SpyError::Metrics(e.to_string()))?;
    Ok(gauge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_zero() {
        let metrics = UpdaterMetrics::new().unwrap();
        assert_eq!(metrics.last_scrape_fails(), 0.0);
        assert_eq!(metrics.duration_seconds(), 0.0);
        assert_eq!(metrics.last_completion_timestamp(), 0.0);
    }

    #[test]
    fn test_record_run() {
        let metrics = UpdaterMetrics::new().unwrap();
        metrics.record_run(Duration::from_millis(1500), 3);
        assert_eq!(metrics.last_scrape_fails(), 3.0);
        assert!((metrics.duration_seconds() - 1.5).abs() < f64::EPSILON);
        assert!(metrics.last_completion_timestamp() > 0.0);
    }

    #[test]
    fn test_render_contains_namespaced_gauges() {
        let metrics = UpdaterMetrics::new().unwrap();
        metrics.record_run(Duration::from_secs(2), 1);
        let text = metrics.render().unwrap();
        assert!(text.contains("imagespy_updater_last_completion_timestamp_seconds"));
        assert!(text.contains("imagespy_updater_duration_seconds 2"));
        assert!(text.contains("imagespy_updater_last_scrape_fails 1"));
    }

    #[test]
    fn test_independent_registries() {
        // Two instances must not clash on registration
        let a = UpdaterMetrics::new().unwrap();
        let b = UpdaterMetrics::new().unwrap();
        a.record_run(Duration::from_secs(1), 5);
        assert_eq!(b.last_scrape_fails(), 0.0);
    }
}
