//! Registry push notifications.
//!
//! A Docker registry can be configured to POST an event envelope for every
//! push. Each pushed schema 2 manifest triggers a scrape of the pushed tag
//! followed by a latest-tag refresh, on a background task.

use std::sync::Arc;

use dashmap::DashMap;
use imagespy_core::error::Result;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::oci::reference::ImageReference;
use crate::oci::registry::MEDIA_TYPE_MODERN;
use crate::scrape::ImageScraper;

/// Content type of a registry notification envelope.
pub const EVENTS_MEDIA_TYPE: &str = "application/vnd.docker.distribution.events.v1+json";

const PUSH_ACTION: &str = "push";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: Target,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Target {
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    repository: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    url: String,
}

/// Extract the references of pushed schema 2 manifests from an envelope.
///
/// The registry host is taken from each target URL; default HTTP(S) ports
/// are dropped. Events without a tag or with an unparseable URL are skipped.
pub fn pushed_references(payload: &[u8]) -> Result<Vec<ImageReference>> {
    let envelope: Envelope = serde_json::from_slice(payload)?;

    let mut references = Vec::new();
    for event in envelope.events {
        if event.action != PUSH_ACTION || event.target.media_type != MEDIA_TYPE_MODERN {
            continue;
        }
        let target = event.target;
        if target.tag.is_empty() || target.repository.is_empty() {
            continue;
        }
        let registry = match registry_host(&target.url) {
            Some(host) => host,
            None => {
                tracing::warn!(url = %target.url, "Ignoring push event with invalid target URL");
                continue;
            }
        };
        let reference = ImageReference {
            registry,
            repository: target.repository,
            tag: Some(target.tag),
            digest: None,
        };
        if !references.contains(&reference) {
            references.push(reference);
        }
    }
    Ok(references)
}

/// `host[:port]` of an absolute URL, without :80 and :443.
fn registry_host(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    // Drop userinfo
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() || port.parse::<u16>().is_err() {
                return None;
            }
            if port == "80" || port == "443" {
                Some(host.to_string())
            } else {
                Some(authority.to_string())
            }
        }
        None => Some(authority.to_string()),
    }
}

/// Removes an in-flight entry when the scrape task ends, however it ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Turns notification envelopes into background scrapes.
///
/// A reference that is already being scraped is not scheduled again until
/// its running scrape has finished.
#[derive(Clone)]
pub struct NotificationHandler {
    scraper: Arc<dyn ImageScraper>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl NotificationHandler {
    pub fn new(scraper: Arc<dyn ImageScraper>) -> Self {
        Self {
            scraper,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Number of scrapes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Handle one notification request.
    ///
    /// Never fails towards the sender: unsupported content types and
    /// malformed payloads are logged and ignored. Returns the handles of the
    /// spawned scrape tasks.
    pub fn handle(&self, content_type: &str, payload: &[u8]) -> Vec<JoinHandle<()>> {
        if content_type != EVENTS_MEDIA_TYPE {
            tracing::debug!(content_type, "Ignoring notification with unsupported content type");
            return Vec::new();
        }

        let references = match pushed_references(payload) {
            Ok(references) => references,
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode registry notification");
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for reference in references {
            let key = reference.full_reference();
            if self.in_flight.insert(key.clone(), ()).is_some() {
                tracing::debug!(reference = %key, "Scrape already in flight");
                continue;
            }

            let guard = InFlightGuard {
                in_flight: self.in_flight.clone(),
                key,
            };
            let scraper = self.scraper.clone();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                tracing::info!(reference = %reference, "Scraping pushed image");
                if let Err(e) = scraper.scrape_image(&reference).await {
                    tracing::error!(reference = %reference, error = %e, "Scrape of pushed image failed");
                }
                if let Err(e) = scraper.scrape_latest_image(&reference).await {
                    tracing::error!(reference = %reference, error = %e, "Latest scrape of pushed image failed");
                }
            }));
        }
        handles
    }
}
