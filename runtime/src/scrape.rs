//! Scrape orchestration.
//!
//! [`Scraper::scrape_image`] records one tag of an image.
//! [`Scraper::scrape_latest_image`] keeps the single latest tag per
//! (repository, distinction) pointing at the greatest version the registry
//! currently offers.
//!
//! Image creation (image, initial tag, platforms, layers and positions) runs
//! in one store transaction after all manifests have been resolved, so a
//! half-created image is never visible. Latest-flag changes are written one
//! by one, always setting the new latest before clearing the old one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagespy_core::error::{Result, StepContext};
use imagespy_core::event::{events, EventEmitter, SpyEvent};
use imagespy_core::model::{Image, Layer, LayerPosition, Platform, Tag};
use imagespy_core::version::{classify, Version};

use crate::oci::manifest::{RegistryImage, ResolvedPlatform};
use crate::oci::reference::ImageReference;
use crate::oci::registry::RegistryClient;
use crate::provenance::ProvenanceIndexer;
use crate::store::{
    ImageGetOptions, LayerGetOptions, Repositories, Store, TagGetOptions, TagListOptions,
};

/// Source of "now" for persisted timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The two scrape operations, as consumed by updaters and notifications.
#[async_trait]
pub trait ImageScraper: Send + Sync {
    /// Ensure the reference's tag is recorded. Returns the tagged image.
    async fn scrape_image(&self, reference: &ImageReference) -> Result<Image>;

    /// Ensure the latest flag of the reference's distinction is correct.
    /// Returns the latest image.
    async fn scrape_latest_image(&self, reference: &ImageReference) -> Result<Image>;
}

/// Registry-to-store scrape orchestrator.
pub struct Scraper {
    registry: Arc<dyn RegistryClient>,
    store: Arc<dyn Store>,
    events: EventEmitter,
    provenance: ProvenanceIndexer,
    clock: Clock,
}

impl Scraper {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        store: Arc<dyn Store>,
        events: EventEmitter,
    ) -> Self {
        let provenance = ProvenanceIndexer::new(store.clone(), events.clone());
        Self {
            registry,
            store,
            events,
            provenance,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock, e.g. for deterministic timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn provenance(&self) -> &ProvenanceIndexer {
        &self.provenance
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Look up an image by digest, mapping NotFound to None.
    fn find_image(&self, digest: &str) -> Result<Option<Image>> {
        match self.store.images().get(&ImageGetOptions::by_digest(digest)) {
            Ok(image) => Ok(Some(image)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn find_tag(&self, options: &TagGetOptions) -> Result<Option<Tag>> {
        match self.store.tags().get(options) {
            Ok(tag) => Ok(Some(tag)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Add the version's tag to an already stored image unless present.
    fn record_tag(&self, image: &Image, version: &Version) -> Result<()> {
        let recorded = self
            .find_tag(&TagGetOptions {
                image_id: Some(image.id),
                name: Some(version.as_str().to_string()),
                distinction: Some(version.distinction()),
                ..Default::default()
            })
            .step("reading image")?;
        if recorded.is_some() {
            return Ok(());
        }

        self.store
            .tags()
            .create(Tag::new(image.id, version.as_str(), version.distinction()))
            .step("updating image")?;
        tracing::info!(image = %image.name, tag = %version, "Added tag to image");
        self.events.emit(SpyEvent::with_fields(
            events::TAG_CREATED,
            [
                ("name", serde_json::json!(image.name)),
                ("tag", serde_json::json!(version.as_str())),
            ],
        ));
        Ok(())
    }

    fn touch(&self, mut image: Image) -> Result<Image> {
        image.scraped_at = self.now();
        self.store.images().update(&image)?;
        Ok(image)
    }

    /// Normalize the registry image and persist it with its initial tag,
    /// then index the provenance of its layers.
    async fn create_image(
        &self,
        reference: &ImageReference,
        digest: &str,
        version: &Version,
    ) -> Result<Image> {
        let registry_image =
            RegistryImage::fetch(self.registry.clone(), reference, digest.to_string()).await?;
        let platforms = registry_image.resolve_platforms().await?;

        let (image, layers) = match self.persist_image(&registry_image, &platforms, version) {
            Ok(created) => created,
            Err(e) => {
                // A concurrent scrape may have stored the same digest first
                let Some(existing) = self.find_image(digest)? else {
                    return Err(e);
                };
                tracing::debug!(
                    image = %existing.name,
                    digest = %existing.digest,
                    "Image was created concurrently, reusing it"
                );
                self.record_tag(&existing, version)?;
                return Ok(existing);
            }
        };

        tracing::info!(
            image = %image.name,
            digest = %image.digest,
            tag = %version,
            platforms = platforms.len(),
            "Created image"
        );
        self.events.emit(SpyEvent::with_fields(
            events::IMAGE_CREATED,
            [
                ("name", serde_json::json!(image.name)),
                ("digest", serde_json::json!(image.digest)),
                ("tag", serde_json::json!(version.as_str())),
            ],
        ));

        for layer in layers.values() {
            self.provenance
                .update_source_images_of_layer(layer)
                .step("updating source images of layer")?;
        }

        Ok(image)
    }

    /// Write image, tag, platforms, layers and positions in one transaction.
    fn persist_image(
        &self,
        registry_image: &RegistryImage,
        platforms: &[ResolvedPlatform],
        version: &Version,
    ) -> Result<(Image, BTreeMap<String, Layer>)> {
        let tx = self.store.transaction()?;
        match self.write_image(&*tx, registry_image, platforms, version) {
            Ok(created) => {
                tx.commit()?;
                Ok(created)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    fn write_image<R: Repositories + ?Sized>(
        &self,
        repos: &R,
        registry_image: &RegistryImage,
        platforms: &[ResolvedPlatform],
        version: &Version,
    ) -> Result<(Image, BTreeMap<String, Layer>)> {
        let now = self.now();
        let image = repos.images().create(Image {
            id: 0,
            digest: registry_image.digest().to_string(),
            name: registry_image.reference().repository_name(),
            schema_version: registry_image.schema_version(),
            created_at: now,
            scraped_at: now,
        })?;

        repos
            .tags()
            .create(Tag::new(image.id, version.as_str(), version.distinction()))?;

        let mut layers: BTreeMap<String, Layer> = BTreeMap::new();
        for resolved in platforms {
            let descriptor = &resolved.descriptor;
            let config = &resolved.manifest.config;
            let platform = repos.platforms().create(Platform {
                id: 0,
                image_id: image.id,
                architecture: descriptor.architecture.clone(),
                os: descriptor.os.clone(),
                os_version: descriptor.os_version.clone(),
                variant: descriptor.variant.clone(),
                manifest_digest: config.digest().to_string(),
                created: config.created().unwrap_or(now),
                created_at: now,
                features: descriptor.features.clone(),
                os_features: descriptor.os_features.clone(),
            })?;

            for (position, digest) in resolved.manifest.layers.iter().enumerate() {
                let layer = match layers.get(digest) {
                    Some(layer) => layer.clone(),
                    None => {
                        let layer = match repos.layers().get(&LayerGetOptions {
                            digest: Some(digest.clone()),
                            ..Default::default()
                        }) {
                            Ok(layer) => layer,
                            Err(e) if e.is_not_found() => {
                                repos.layers().create(Layer::new(digest.clone()))?
                            }
                            Err(e) => return Err(e),
                        };
                        layers.insert(digest.clone(), layer.clone());
                        layer
                    }
                };

                repos.layer_positions().create(LayerPosition {
                    id: 0,
                    layer_id: layer.id,
                    platform_id: platform.id,
                    position: position as u32,
                })?;
            }
        }

        Ok((image, layers))
    }

    /// The greatest version among the repository's tags in the reference's
    /// distinction, seeded with the reference's own tag.
    async fn find_latest_version(
        &self,
        reference: &ImageReference,
        seed: Version,
    ) -> Result<Version> {
        let distinction = seed.distinction();
        let tags = self
            .registry
            .fetch_tag_list(reference)
            .await
            .step("retrieving tag list")?;

        let mut latest = seed;
        for tag in tags {
            let candidate = classify(&tag);
            if candidate.distinction() != distinction {
                continue;
            }
            match candidate.is_greater_than(&latest) {
                Ok(true) => latest = candidate,
                Ok(false) => {}
                Err(e) => {
                    tracing::trace!(error = %e, "Skipping incomparable tag");
                }
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl ImageScraper for Scraper {
    async fn scrape_image(&self, reference: &ImageReference) -> Result<Image> {
        let digest = self
            .registry
            .fetch_digest(reference)
            .await
            .step("retrieving digest")?;
        let version = classify(reference.tag_or_default());

        let existing = self.find_image(&digest).step("reading image")?;
        let image = match existing {
            Some(image) => {
                self.record_tag(&image, &version)?;
                self.touch(image).step("updating image")?
            }
            None => {
                tracing::debug!(reference = %reference, digest = %digest, "Image not yet known");
                self.create_image(reference, &digest, &version)
                    .await
                    .step("creating image from registry image")?
            }
        };

        Ok(image)
    }

    async fn scrape_latest_image(&self, reference: &ImageReference) -> Result<Image> {
        let repository = reference.repository_name();
        let seed = classify(reference.tag_or_default());
        let distinction = seed.distinction();

        let current_tag = self
            .find_tag(&TagGetOptions {
                distinction: Some(distinction.clone()),
                image_name: Some(repository.clone()),
                is_latest: Some(true),
                ..Default::default()
            })
            .step("reading latest tag")?;
        let current_image = match &current_tag {
            Some(tag) => Some(
                self.store
                    .images()
                    .get(&ImageGetOptions::by_id(tag.image_id))
                    .step("reading image")?,
            ),
            None => None,
        };

        let seed_tag = seed.as_str().to_string();
        let latest = self.find_latest_version(reference, seed).await?;
        let latest_reference = if latest.as_str() == seed_tag {
            reference.clone()
        } else {
            reference.with_tag(latest.as_str())
        };

        let latest_digest = self
            .registry
            .fetch_digest(&latest_reference)
            .await
            .step("retrieving digest")?;

        let latest_image = match self.find_image(&latest_digest).step("reading image")? {
            Some(image) => image,
            None => self
                .create_image(&latest_reference, &latest_digest, &latest)
                .await
                .step("creating image from registry image")?,
        };

        if let Some(current) = current_image {
            if current.digest == latest_image.digest {
                return self.touch(current).step("updating image");
            }
        }

        // Promote first, then clear the previous latest
        let mut latest_tag = match self
            .find_tag(&TagGetOptions {
                distinction: Some(distinction.clone()),
                image_id: Some(latest_image.id),
                name: Some(latest.as_str().to_string()),
                ..Default::default()
            })
            .step("reading latest tag")?
        {
            Some(tag) => tag,
            None => self
                .store
                .tags()
                .create(Tag::new(latest_image.id, latest.as_str(), distinction.clone()))
                .step("updating tag")?,
        };

        if !latest_tag.is_latest || !latest_tag.is_tagged {
            latest_tag.is_latest = true;
            latest_tag.is_tagged = true;
            self.store.tags().update(&latest_tag).step("updating tag")?;
            tracing::info!(
                image = %repository,
                tag = %latest_tag.name,
                distinction = %distinction,
                "Promoted latest tag"
            );
            self.events.emit(SpyEvent::with_fields(
                events::TAG_LATEST_PROMOTED,
                [
                    ("name", serde_json::json!(repository)),
                    ("tag", serde_json::json!(latest_tag.name)),
                    ("digest", serde_json::json!(latest_image.digest)),
                ],
            ));
        }

        if let Some(mut current) = current_tag {
            if current.id != latest_tag.id && current.is_latest {
                current.is_latest = false;
                let untagged = current.name == latest_tag.name;
                if untagged {
                    current.is_tagged = false;
                }
                self.store.tags().update(&current).step("updating tag")?;

                self.events.emit(SpyEvent::with_fields(
                    events::TAG_LATEST_CLEARED,
                    [
                        ("name", serde_json::json!(repository)),
                        ("tag", serde_json::json!(current.name)),
                    ],
                ));
                if untagged {
                    self.emit_untagged(&repository, &current.name);
                }
            }
        }

        // Only the promoted row carries its tag name within the repository
        let stale = self
            .store
            .tags()
            .list(&TagListOptions {
                distinction: Some(distinction.clone()),
                image_name: Some(repository.clone()),
                ..Default::default()
            })
            .step("reading latest tag")?
            .into_iter()
            .filter(|t| t.id != latest_tag.id && t.name == latest_tag.name && t.is_tagged);
        for mut tag in stale {
            tag.is_tagged = false;
            tag.is_latest = false;
            self.store.tags().update(&tag).step("updating tag")?;
            self.emit_untagged(&repository, &tag.name);
        }

        self.touch(latest_image).step("updating image")
    }
}

impl Scraper {
    fn emit_untagged(&self, repository: &str, tag: &str) {
        tracing::debug!(image = %repository, tag, "Tag moved to another image");
        self.events.emit(SpyEvent::with_fields(
            events::TAG_UNTAGGED,
            [
                ("name", serde_json::json!(repository)),
                ("tag", serde_json::json!(tag)),
            ],
        ));
    }
}

impl std::fmt::Debug for Scraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scraper").finish_non_exhaustive()
    }
}

/// Parse a reference against the configured default registry and scrape it
/// with both operations. Returns (tagged image, latest image).
pub async fn scrape_reference(
    scraper: &dyn ImageScraper,
    reference: &str,
    default_registry: &str,
) -> Result<(Image, Image)> {
    let reference = ImageReference::parse_with_registry(reference, default_registry)?;
    let image = scraper.scrape_image(&reference).await?;
    let latest = scraper.scrape_latest_image(&reference).await?;
    Ok((image, latest))
}
