//! In-memory registry double and manifest builders.
//!
//! Used by the unit tests of this crate and by the integration tests of the
//! runtime and queue crates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use imagespy_core::error::{Result, SpyError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::oci::reference::ImageReference;
use crate::oci::registry::{
    RawManifest, RegistryClient, MEDIA_TYPE_LEGACY_SIGNED, MEDIA_TYPE_LIST, MEDIA_TYPE_MODERN,
};

#[derive(Default)]
struct Repository {
    tags: BTreeMap<String, String>,
    manifests: HashMap<String, RawManifest>,
    legacy: HashMap<String, RawManifest>,
}

/// [`RegistryClient`] serving manifests from memory, with call counters.
#[derive(Default)]
pub struct FakeRegistry {
    repositories: Mutex<HashMap<String, Repository>>,
    broken: Mutex<HashSet<String>>,
    tag_list_fetches: AtomicUsize,
    digest_fetches: AtomicUsize,
    manifest_fetches: AtomicUsize,
    legacy_fetches: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a manifest addressable by its digest only. Returns the digest.
    pub fn put_blob(&self, repository: &str, manifest: RawManifest) -> String {
        let digest = digest_of(&manifest.bytes);
        self.repositories
            .lock()
            .entry(repository.to_string())
            .or_default()
            .manifests
            .insert(digest.clone(), manifest);
        digest
    }

    /// Store a manifest and point `tag` at it. Returns the digest.
    pub fn put_tag(&self, repository: &str, tag: &str, manifest: RawManifest) -> String {
        let digest = self.put_blob(repository, manifest);
        self.repositories
            .lock()
            .entry(repository.to_string())
            .or_default()
            .tags
            .insert(tag.to_string(), digest.clone());
        digest
    }

    /// Serve a schema 1 encoding for `tag`.
    pub fn put_legacy(&self, repository: &str, tag: &str, manifest: RawManifest) {
        self.repositories
            .lock()
            .entry(repository.to_string())
            .or_default()
            .legacy
            .insert(tag.to_string(), manifest);
    }

    pub fn remove_tag(&self, repository: &str, tag: &str) {
        if let Some(repo) = self.repositories.lock().get_mut(repository) {
            repo.tags.remove(tag);
        }
    }

    /// Make every call for `repository` fail with a transport error.
    pub fn break_repository(&self, repository: &str) {
        self.broken.lock().insert(repository.to_string());
    }

    pub fn tag_list_fetches(&self) -> usize {
        self.tag_list_fetches.load(Ordering::SeqCst)
    }

    pub fn digest_fetches(&self) -> usize {
        self.digest_fetches.load(Ordering::SeqCst)
    }

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn legacy_fetches(&self) -> usize {
        self.legacy_fetches.load(Ordering::SeqCst)
    }

    fn check(&self, reference: &ImageReference, operation: &'static str) -> Result<String> {
        let name = reference.repository_name();
        if self.broken.lock().contains(&name) {
            return Err(SpyError::transport(operation, format!("{} unreachable", name)));
        }
        Ok(name)
    }

    fn tag_digest(&self, name: &str, tag: &str) -> Result<String> {
        self.repositories
            .lock()
            .get(name)
            .and_then(|repo| repo.tags.get(tag).cloned())
            .ok_or_else(|| SpyError::not_found("tag", format!("{}:{}", name, tag)))
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn fetch_tag_list(&self, reference: &ImageReference) -> Result<Vec<String>> {
        self.tag_list_fetches.fetch_add(1, Ordering::SeqCst);
        let name = self.check(reference, "fetching tag list")?;
        self.repositories
            .lock()
            .get(&name)
            .map(|repo| repo.tags.keys().cloned().collect())
            .ok_or_else(|| SpyError::not_found("repository", name))
    }

    async fn fetch_digest(&self, reference: &ImageReference) -> Result<String> {
        self.digest_fetches.fetch_add(1, Ordering::SeqCst);
        let name = self.check(reference, "fetching digest")?;
        match reference.digest {
            Some(ref digest) => Ok(digest.clone()),
            None => self.tag_digest(&name, reference.tag_or_default()),
        }
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        reference_or_digest: &str,
    ) -> Result<RawManifest> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let name = self.check(reference, "fetching manifest")?;
        let digest = if reference_or_digest.contains(':') {
            reference_or_digest.to_string()
        } else {
            self.tag_digest(&name, reference_or_digest)?
        };
        self.repositories
            .lock()
            .get(&name)
            .and_then(|repo| repo.manifests.get(&digest).cloned())
            .ok_or_else(|| SpyError::not_found("manifest", format!("{}@{}", name, digest)))
    }

    async fn fetch_legacy_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        self.legacy_fetches.fetch_add(1, Ordering::SeqCst);
        let name = self.check(reference, "fetching legacy manifest")?;
        let tag = reference.tag_or_default();
        self.repositories
            .lock()
            .get(&name)
            .and_then(|repo| repo.legacy.get(tag).cloned())
            .ok_or_else(|| SpyError::not_found("legacy manifest", format!("{}:{}", name, tag)))
    }
}

/// sha256 digest of manifest bytes, as a registry computes it.
pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Schema 2 manifest with the given config digest and layers in order.
pub fn modern_manifest(config_digest: &str, layers: &[&str]) -> RawManifest {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 1024,
                "digest": digest,
            })
        })
        .collect();
    let body = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MODERN,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 7023,
            "digest": config_digest,
        },
        "layers": layers,
    });
    RawManifest::new(body.to_string().into_bytes(), Some(MEDIA_TYPE_MODERN))
}

/// Schema 1 manifest. Both `fs_layers` and `created` are newest first, as
/// the encoding stores them.
pub fn legacy_manifest(fs_layers: &[&str], created: &[&str]) -> RawManifest {
    let fs_layers: Vec<_> = fs_layers
        .iter()
        .map(|digest| serde_json::json!({ "blobSum": digest }))
        .collect();
    let history: Vec<_> = created
        .iter()
        .map(|created| {
            let v1 = serde_json::json!({
                "created": created,
                "container_config": { "Cmd": ["/bin/sh", "-c", "true"] },
            });
            serde_json::json!({ "v1Compatibility": v1.to_string() })
        })
        .collect();
    let body = serde_json::json!({
        "schemaVersion": 1,
        "name": "unit",
        "tag": "1",
        "architecture": "amd64",
        "fsLayers": fs_layers,
        "history": history,
    });
    RawManifest::new(body.to_string().into_bytes(), Some(MEDIA_TYPE_LEGACY_SIGNED))
}

/// Manifest list of `(digest, architecture, os, variant)` members.
pub fn list_manifest(members: &[(&str, &str, &str, &str)]) -> RawManifest {
    let manifests: Vec<_> = members
        .iter()
        .map(|(digest, architecture, os, variant)| {
            serde_json::json!({
                "mediaType": MEDIA_TYPE_MODERN,
                "size": 528,
                "digest": digest,
                "platform": {
                    "architecture": architecture,
                    "os": os,
                    "variant": variant,
                },
            })
        })
        .collect();
    let body = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_LIST,
        "manifests": manifests,
    });
    RawManifest::new(body.to_string().into_bytes(), Some(MEDIA_TYPE_LIST))
}
