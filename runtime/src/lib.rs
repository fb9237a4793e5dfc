//! imagespy runtime - the scrape engine.
//!
//! Reads images from container registries, normalizes their manifests and
//! records images, tags, platforms and layers in a store. Also maintains
//! layer provenance and serves registry push notifications.

#![allow(clippy::result_large_err)]

pub mod metrics;
pub mod notify;
pub mod oci;
pub mod provenance;
pub mod scrape;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export common types
pub use metrics::UpdaterMetrics;
pub use notify::{NotificationHandler, EVENTS_MEDIA_TYPE};
pub use oci::{ImageReference, OciRegistryClient, RawManifest, RegistryAuth, RegistryClient};
pub use oci::{RegistryImage, ResolvedPlatform};
pub use provenance::ProvenanceIndexer;
pub use scrape::{scrape_reference, ImageScraper, Scraper};
pub use store::{MemoryStore, Repositories, Store, Transaction};

/// imagespy runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
