//! Integration tests: scrape orchestration end to end.
//!
//! Drives the public `Scraper` API against a `MemoryStore` and the in-crate
//! `FakeRegistry`, checking the store contents after each scenario.

use std::sync::Arc;

use imagespy_core::event::{events, EventEmitter};
use imagespy_core::model::{Image, Tag};
use imagespy_runtime::oci::EMPTY_LAYER_DIGEST;
use imagespy_runtime::store::{
    ImageGetOptions, ImageListOptions, LayerGetOptions, LayerListOptions, PlatformListOptions, TagListOptions,
};
use imagespy_runtime::testing::{legacy_manifest, list_manifest, modern_manifest, FakeRegistry};
use imagespy_runtime::{
    scrape_reference, ImageReference, ImageScraper, MemoryStore, Repositories, Scraper,
};

const REPO: &str = "dev.local/unit";

struct Harness {
    registry: Arc<FakeRegistry>,
    store: Arc<MemoryStore>,
    events: EventEmitter,
    scraper: Scraper,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(FakeRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let events = EventEmitter::new(1024);
        let scraper = Scraper::new(registry.clone(), store.clone(), events.clone());
        Self {
            registry,
            store,
            events,
            scraper,
        }
    }

    fn reference(tag: &str) -> ImageReference {
        ImageReference::parse(&format!("{}:{}", REPO, tag)).unwrap()
    }

    async fn scrape(&self, tag: &str) -> (Image, Image) {
        scrape_reference(&self.scraper, &format!("{}:{}", REPO, tag), "docker.io")
            .await
            .unwrap()
    }

    fn images(&self) -> Vec<Image> {
        self.store.images().list(&ImageListOptions::default()).unwrap()
    }

    fn tags(&self) -> Vec<Tag> {
        self.store.tags().list(&TagListOptions::default()).unwrap()
    }

    fn tag(&self, name: &str) -> Tag {
        self.tags()
            .into_iter()
            .find(|t| t.name == name && t.is_tagged)
            .unwrap_or_else(|| panic!("no tagged row named {}", name))
    }

    fn layer_sources(&self, digest: &str) -> Vec<i64> {
        self.store
            .layers()
            .get(&LayerGetOptions {
                digest: Some(digest.to_string()),
                ..Default::default()
            })
            .unwrap()
            .source_image_ids
            .as_slice()
            .to_vec()
    }

    fn latest_count(&self, distinction: &str) -> usize {
        self.tags()
            .iter()
            .filter(|t| t.distinction == distinction && t.is_latest)
            .count()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_new_image_without_prior_latest() {
    let h = Harness::new();
    let abc = h
        .registry
        .put_tag(REPO, "1", modern_manifest("sha256:cfg1", &["sha256:l1"]));

    let (image, latest) = h.scrape("1").await;
    assert_eq!(image.digest, abc);
    assert_eq!(latest.id, image.id);

    assert_eq!(h.images().len(), 1);
    let tags = h.tags();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "1");
    assert_eq!(tags[0].distinction, "major");
    assert!(tags[0].is_latest);
    assert!(tags[0].is_tagged);
}

#[tokio::test]
async fn test_newer_tag_supersedes() {
    let h = Harness::new();
    let abc = h
        .registry
        .put_tag(REPO, "1", modern_manifest("sha256:cfg1", &["sha256:l1"]));
    h.scrape("1").await;
    assert!(h.tag("1").is_latest);

    let def = h.registry.put_tag(
        REPO,
        "2",
        modern_manifest("sha256:cfg2", &["sha256:l1", "sha256:l2"]),
    );
    let latest = h
        .scraper
        .scrape_latest_image(&Harness::reference("1"))
        .await
        .unwrap();
    assert_eq!(latest.digest, def);

    let digests: Vec<_> = h.images().into_iter().map(|i| i.digest).collect();
    assert!(digests.contains(&abc));
    assert!(digests.contains(&def));
    assert_eq!(digests.len(), 2);

    let one = h.tag("1");
    let two = h.tag("2");
    assert!(!one.is_latest);
    assert!(one.is_tagged);
    assert!(two.is_latest);
}

#[tokio::test]
async fn test_scraping_newer_tag_directly_supersedes() {
    let h = Harness::new();
    h.registry
        .put_tag(REPO, "1", modern_manifest("sha256:cfg1", &["sha256:l1"]));
    h.scrape("1").await;

    h.registry
        .put_tag(REPO, "2", modern_manifest("sha256:cfg2", &["sha256:l2"]));
    h.scrape("2").await;

    assert!(!h.tag("1").is_latest);
    assert!(h.tag("2").is_latest);
    assert_eq!(h.latest_count("major"), 1);
}

#[tokio::test]
async fn test_layer_provenance() {
    let h = Harness::new();
    h.registry.put_tag(
        REPO,
        "base",
        modern_manifest("sha256:cfga", &["sha256:l1", "sha256:l2"]),
    );
    h.registry.put_tag(
        "dev.local/app",
        "1",
        modern_manifest("sha256:cfgb", &["sha256:l1", "sha256:l2", "sha256:l3"]),
    );

    let a = h
        .scraper
        .scrape_image(&Harness::reference("base"))
        .await
        .unwrap();
    let b = h
        .scraper
        .scrape_image(&ImageReference::parse("dev.local/app:1").unwrap())
        .await
        .unwrap();

    assert_eq!(h.layer_sources("sha256:l1"), vec![a.id]);
    assert_eq!(h.layer_sources("sha256:l2"), vec![a.id]);
    assert_eq!(h.layer_sources("sha256:l3"), vec![b.id]);

    let children = h.scraper.provenance().children(a.id).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, b.id);
}

#[tokio::test]
async fn test_duplicate_and_empty_layers_collapse() {
    let h = Harness::new();
    h.registry.put_tag(
        REPO,
        "1",
        modern_manifest(
            "sha256:cfg",
            &["sha256:a", "sha256:b", EMPTY_LAYER_DIGEST, "sha256:b", "sha256:c"],
        ),
    );
    let image = h
        .scraper
        .scrape_image(&Harness::reference("1"))
        .await
        .unwrap();

    let platforms = h
        .store
        .platforms()
        .list(&PlatformListOptions {
            image_id: Some(image.id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(platforms.len(), 1);

    let layers = h
        .store
        .layers()
        .list(&LayerListOptions {
            platform_id: Some(platforms[0].id),
        })
        .unwrap();
    let digests: Vec<_> = layers.iter().map(|l| l.digest.as_str()).collect();
    assert_eq!(digests, vec!["sha256:a", "sha256:b", "sha256:c"]);
}

#[tokio::test]
async fn test_latest_scrape_is_idempotent() {
    let h = Harness::new();
    h.registry
        .put_tag(REPO, "1", modern_manifest("sha256:cfg1", &["sha256:l1"]));
    h.registry
        .put_tag(REPO, "2", modern_manifest("sha256:cfg2", &["sha256:l2"]));

    let reference = Harness::reference("1");
    let first = h.scraper.scrape_latest_image(&reference).await.unwrap();
    let images_before = h.images();
    let tags_before = h.tags();

    let second = h.scraper.scrape_latest_image(&reference).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.tags(), tags_before);

    let strip = |images: Vec<Image>| -> Vec<(i64, String)> {
        images.into_iter().map(|i| (i.id, i.digest)).collect()
    };
    assert_eq!(strip(h.images()), strip(images_before));
}

#[tokio::test]
async fn test_single_latest_per_distinction() {
    let h = Harness::new();
    for (tag, cfg) in [
        ("1", "sha256:c1"),
        ("3", "sha256:c3"),
        ("2", "sha256:c2"),
        ("1.0", "sha256:c10"),
        ("1.1", "sha256:c11"),
        ("latest", "sha256:c3"),
    ] {
        h.registry.put_tag(REPO, tag, modern_manifest(cfg, &[cfg]));
    }

    for tag in ["1", "2", "1.0", "latest", "3", "1.1", "2"] {
        h.scrape(tag).await;
        for distinction in ["major", "majorMinor", "static-latest"] {
            assert!(h.latest_count(distinction) <= 1, "{} after {}", distinction, tag);
        }
    }

    assert!(h.tag("3").is_latest);
    assert!(h.tag("1.1").is_latest);
    assert!(h.tag("latest").is_latest);
    assert!(!h.tag("1").is_latest);
}

#[tokio::test]
async fn test_moved_tag_is_untagged() {
    let h = Harness::new();
    let old = h
        .registry
        .put_tag(REPO, "latest", modern_manifest("sha256:c1", &["sha256:l1"]));
    h.scrape("latest").await;

    let mut rx = h.events.subscribe();
    let new = h
        .registry
        .put_tag(REPO, "latest", modern_manifest("sha256:c2", &["sha256:l2"]));
    let (image, latest) = h.scrape("latest").await;
    assert_eq!(image.digest, new);
    assert_eq!(latest.digest, new);

    let old_image = h
        .images()
        .into_iter()
        .find(|i| i.digest == old)
        .unwrap();
    let old_tag = h
        .tags()
        .into_iter()
        .find(|t| t.image_id == old_image.id)
        .unwrap();
    assert!(!old_tag.is_latest);
    assert!(!old_tag.is_tagged);
    assert_eq!(h.latest_count("static-latest"), 1);

    let mut keys = Vec::new();
    while let Ok(event) = rx.try_recv() {
        keys.push(event.key);
    }
    assert!(keys.iter().any(|k| k == events::TAG_LATEST_PROMOTED));
    assert!(keys.iter().any(|k| k == events::TAG_LATEST_CLEARED));
    assert!(keys.iter().any(|k| k == events::TAG_UNTAGGED));
}

#[tokio::test]
async fn test_tag_moved_back_to_earlier_digest() {
    let h = Harness::new();
    let first = h
        .registry
        .put_tag(REPO, "latest", modern_manifest("sha256:c1", &["sha256:l1"]));
    h.scrape("latest").await;
    let second = h
        .registry
        .put_tag(REPO, "latest", modern_manifest("sha256:c2", &["sha256:l2"]));
    h.scrape("latest").await;

    let restored = h
        .registry
        .put_tag(REPO, "latest", modern_manifest("sha256:c1", &["sha256:l1"]));
    assert_eq!(restored, first);
    let (image, latest) = h.scrape("latest").await;
    assert_eq!(image.digest, first);
    assert_eq!(latest.digest, first);
    assert_eq!(h.images().len(), 2);

    let live: Vec<_> = h
        .tags()
        .into_iter()
        .filter(|t| t.name == "latest" && t.is_tagged)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].image_id, latest.id);
    assert!(live[0].is_latest);
    assert_eq!(h.latest_count("static-latest"), 1);

    let second_image = h
        .images()
        .into_iter()
        .find(|i| i.digest == second)
        .unwrap();
    let second_tag = h
        .tags()
        .into_iter()
        .find(|t| t.image_id == second_image.id)
        .unwrap();
    assert!(!second_tag.is_latest);
    assert!(!second_tag.is_tagged);

    let by_tag = h
        .store
        .images()
        .get(&ImageGetOptions {
            name: Some(REPO.to_string()),
            tag_name: Some("latest".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_tag.digest, first);
}

#[tokio::test]
async fn test_failed_resolution_leaves_no_image() {
    let h = Harness::new();
    let present = h
        .registry
        .put_blob(REPO, modern_manifest("sha256:cfg", &["sha256:l1"]));
    // Second member is never served
    h.registry.put_tag(
        REPO,
        "1",
        list_manifest(&[
            (present.as_str(), "amd64", "linux", ""),
            ("sha256:missing", "arm64", "linux", "v8"),
        ]),
    );

    let err = h
        .scraper
        .scrape_image(&Harness::reference("1"))
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .starts_with("creating image from registry image failed"));
    assert!(h.images().is_empty());
    assert!(h.tags().is_empty());
    assert!(h
        .store
        .layers()
        .list(&LayerListOptions::default())
        .unwrap()
        .is_empty());
}

// ============================================================================
// Manifest encodings
// ============================================================================

#[tokio::test]
async fn test_manifest_list_shares_layers_across_platforms() {
    let h = Harness::new();
    let amd = h.registry.put_blob(
        REPO,
        modern_manifest("sha256:cfg-amd", &["sha256:base", "sha256:amd"]),
    );
    let arm = h.registry.put_blob(
        REPO,
        modern_manifest("sha256:cfg-arm", &["sha256:base", "sha256:arm"]),
    );
    h.registry.put_tag(
        REPO,
        "1",
        list_manifest(&[
            (amd.as_str(), "amd64", "linux", ""),
            (arm.as_str(), "arm", "linux", "v7"),
        ]),
    );

    let image = h
        .scraper
        .scrape_image(&Harness::reference("1"))
        .await
        .unwrap();
    assert_eq!(image.schema_version, 2);

    let platforms = h
        .store
        .platforms()
        .list(&PlatformListOptions {
            image_id: Some(image.id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(platforms.len(), 2);
    let arm_platform = platforms.iter().find(|p| p.architecture == "arm").unwrap();
    assert_eq!(arm_platform.variant, "v7");
    assert_eq!(arm_platform.manifest_digest, "sha256:cfg-arm");

    // One row for the shared base layer, one source image
    let layers = h.store.layers().list(&LayerListOptions::default()).unwrap();
    assert_eq!(layers.len(), 3);
    assert_eq!(h.layer_sources("sha256:base"), vec![image.id]);
}

#[tokio::test]
async fn test_legacy_manifest_uses_history() {
    let h = Harness::new();
    h.registry.put_tag(
        REPO,
        "1",
        legacy_manifest(
            &["sha256:top", EMPTY_LAYER_DIGEST, "sha256:bottom"],
            &["2019-03-02T10:00:00Z", "2019-03-01T10:00:00Z", "2019-02-01T10:00:00Z"],
        ),
    );

    let image = h
        .scraper
        .scrape_image(&Harness::reference("1"))
        .await
        .unwrap();
    assert_eq!(image.schema_version, 1);

    let platform = h
        .store
        .platforms()
        .list(&PlatformListOptions {
            image_id: Some(image.id),
            ..Default::default()
        })
        .unwrap()
        .remove(0);
    assert_eq!(platform.manifest_digest, image.digest);
    assert_eq!(platform.created.to_rfc3339(), "2019-03-02T10:00:00+00:00");

    let layers = h
        .store
        .layers()
        .list(&LayerListOptions {
            platform_id: Some(platform.id),
        })
        .unwrap();
    let digests: Vec<_> = layers.iter().map(|l| l.digest.as_str()).collect();
    assert_eq!(digests, vec!["sha256:bottom", "sha256:top"]);
}

#[tokio::test]
async fn test_events_for_new_image() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    h.registry
        .put_tag(REPO, "1", modern_manifest("sha256:cfg", &["sha256:l1"]));
    h.scraper
        .scrape_image(&Harness::reference("1"))
        .await
        .unwrap();

    let mut keys = Vec::new();
    while let Ok(event) = rx.try_recv() {
        keys.push(event.key);
    }
    assert_eq!(keys.first().map(String::as_str), Some(events::IMAGE_CREATED));
    assert!(keys.iter().any(|k| k == events::LAYER_SOURCES_UPDATED));
}
