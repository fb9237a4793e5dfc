//! Manifest normalization.
//!
//! Turns the three registry encodings (schema 1, schema 2 / OCI manifest,
//! manifest list / OCI index) into one value model:
//!
//! ```text
//! RegistryImage
//!   └── PlatformDescriptor ──(resolve once)──> ResolvedManifest
//!                                                ├── layers (outermost last)
//!                                                └── ImageConfig (digest, history)
//! ```
//!
//! Parsing happens once at [`RegistryImage::from_raw`]. Platform manifests of
//! a list, and the build history of schema 2 manifests, need further registry
//! round trips; [`RegistryImage::resolve_platforms`] performs them at most
//! once per image and caches the result.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imagespy_core::error::{Result, SpyError};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::reference::ImageReference;
use super::registry::{RawManifest, RegistryClient, SchemaKind};

/// Digest of a gzipped empty tar, emitted as a placeholder layer by older
/// build tooling. Never counts as content.
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8c7c22955b46d4";

// ============================================================================
// Wire formats
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<LegacyHistory>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyHistory {
    pub v1_compatibility: String,
}

/// The subset of a v1Compatibility blob that carries history.
#[derive(Debug, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    author: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    container_config: Option<V1ContainerConfig>,
    #[serde(default)]
    throwaway: bool,
}

#[derive(Debug, Deserialize)]
struct V1ContainerConfig {
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: i64,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<PlatformSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformSpec {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "os.version", default)]
    pub os_version: String,
    #[serde(rename = "os.features", default)]
    pub os_features: Vec<String>,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModernManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// A raw manifest decoded into exactly one of the supported encodings.
#[derive(Debug, Clone)]
pub enum ParsedManifest {
    LegacySingle(LegacyManifest),
    ModernSingle(ModernManifest),
    ModernList(ManifestList),
}

impl ParsedManifest {
    /// Decode according to the detected schema kind.
    pub fn parse(raw: &RawManifest) -> Result<Self> {
        match &raw.kind {
            SchemaKind::Legacy => Ok(Self::LegacySingle(serde_json::from_slice(&raw.bytes)?)),
            SchemaKind::Modern => Ok(Self::ModernSingle(serde_json::from_slice(&raw.bytes)?)),
            SchemaKind::List => Ok(Self::ModernList(serde_json::from_slice(&raw.bytes)?)),
            SchemaKind::Unknown(media_type) => {
                Err(SpyError::UnsupportedEncoding(media_type.clone()))
            }
        }
    }

    pub fn schema_version(&self) -> u8 {
        match self {
            Self::LegacySingle(_) => 1,
            Self::ModernSingle(_) | Self::ModernList(_) => 2,
        }
    }
}

impl LegacyManifest {
    /// Layers with the base first, placeholder layers removed.
    pub fn layers(&self) -> Vec<String> {
        self.fs_layers
            .iter()
            .rev()
            .map(|l| l.blob_sum.clone())
            .filter(|digest| digest != EMPTY_LAYER_DIGEST)
            .collect()
    }

    /// History with the oldest entry first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.history
            .iter()
            .rev()
            .map(|h| HistoryEntry::from_v1_compatibility(&h.v1_compatibility))
            .collect()
    }
}

impl ModernManifest {
    /// Layers in manifest order with placeholders dropped and each digest
    /// kept at its first occurrence only.
    pub fn layers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.layers
            .iter()
            .map(|l| l.digest.as_str())
            .filter(|digest| *digest != EMPTY_LAYER_DIGEST)
            .filter(|digest| seen.insert(*digest))
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Normalized model
// ============================================================================

/// One step of an image's build history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: Option<DateTime<Utc>>,
    pub created_by: String,
    pub author: String,
    pub comment: String,
    pub empty_layer: bool,
}

impl HistoryEntry {
    fn from_v1_compatibility(blob: &str) -> Result<Self> {
        let v1: V1Compatibility = serde_json::from_str(blob)?;
        let created_by = v1
            .container_config
            .and_then(|c| c.cmd)
            .map(|cmd| cmd.join(" "))
            .unwrap_or_default();
        Ok(Self {
            created: v1.created,
            created_by,
            author: v1.author,
            comment: v1.comment,
            empty_layer: v1.throwaway,
        })
    }
}

/// Config record of a platform manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    digest: String,
    history: Vec<HistoryEntry>,
    media_type: Option<String>,
    size: Option<i64>,
    schema: u8,
}

impl ImageConfig {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Media type of the config blob. Schema 1 has none.
    pub fn media_type(&self) -> Result<&str> {
        self.media_type
            .as_deref()
            .ok_or(SpyError::UnsupportedBySchema {
                schema: self.schema,
                field: "media type",
            })
    }

    /// Size of the config blob. Schema 1 has none.
    pub fn size(&self) -> Result<i64> {
        self.size.ok_or(SpyError::UnsupportedBySchema {
            schema: self.schema,
            field: "size",
        })
    }

    /// Build time: the newest history entry carrying a timestamp.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find_map(|h| h.created)
    }
}

/// Fully resolved manifest of one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    pub media_type: String,
    pub schema_version: u8,
    /// Layer digests, base first.
    pub layers: Vec<String>,
    pub config: ImageConfig,
}

/// Platform metadata known without further registry calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformDescriptor {
    pub architecture: String,
    pub os: String,
    pub os_version: String,
    pub variant: String,
    pub features: Vec<String>,
    pub os_features: Vec<String>,
    /// Manifest digest of a list member. None for single-platform images.
    pub digest: Option<String>,
}

impl PlatformDescriptor {
    /// The implicit platform of single-platform manifests.
    fn implicit() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..Default::default()
        }
    }

    fn from_list_member(member: &Descriptor) -> Self {
        let spec = member.platform.clone().unwrap_or_default();
        Self {
            architecture: spec.architecture,
            os: spec.os,
            os_version: spec.os_version,
            variant: spec.variant,
            features: spec.features,
            os_features: spec.os_features,
            digest: Some(member.digest.clone()),
        }
    }
}

/// A platform together with its resolved manifest.
#[derive(Debug, Clone)]
pub struct ResolvedPlatform {
    pub descriptor: PlatformDescriptor,
    pub manifest: Arc<ResolvedManifest>,
}

/// Where a platform's manifest comes from.
#[derive(Debug)]
enum ManifestSource {
    /// Schema 1 carries everything inline.
    Legacy(Arc<ResolvedManifest>),
    /// Schema 2 body is known; history still needs the legacy encoding.
    Modern(ModernManifest, String),
    /// List member, fetched by digest on resolution.
    Member(String),
}

#[derive(Debug)]
struct ManifestSlot {
    descriptor: PlatformDescriptor,
    source: ManifestSource,
    resolved: OnceCell<Arc<ResolvedManifest>>,
}

/// An image as the registry describes it, normalized.
pub struct RegistryImage {
    client: Arc<dyn RegistryClient>,
    reference: ImageReference,
    digest: String,
    schema_version: u8,
    slots: Vec<ManifestSlot>,
    history: OnceCell<Vec<HistoryEntry>>,
}

impl std::fmt::Debug for RegistryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryImage")
            .field("reference", &self.reference)
            .field("digest", &self.digest)
            .field("schema_version", &self.schema_version)
            .field("platforms", &self.slots.len())
            .finish()
    }
}

impl RegistryImage {
    /// Fetch and normalize the manifest `reference` points at.
    ///
    /// `digest` is the registry-computed digest of that manifest.
    pub async fn fetch(
        client: Arc<dyn RegistryClient>,
        reference: &ImageReference,
        digest: String,
    ) -> Result<Self> {
        let raw = client
            .fetch_manifest(reference, reference.manifest_reference())
            .await?;
        Self::from_raw(client, reference, digest, &raw)
    }

    /// Normalize an already fetched manifest.
    pub fn from_raw(
        client: Arc<dyn RegistryClient>,
        reference: &ImageReference,
        digest: String,
        raw: &RawManifest,
    ) -> Result<Self> {
        let parsed = ParsedManifest::parse(raw)?;
        let schema_version = parsed.schema_version();

        let slots = match parsed {
            ParsedManifest::LegacySingle(legacy) => {
                let manifest = ResolvedManifest {
                    media_type: raw.media_type.clone(),
                    schema_version,
                    layers: legacy.layers(),
                    config: ImageConfig {
                        digest: digest.clone(),
                        history: legacy.history()?,
                        media_type: None,
                        size: None,
                        schema: 1,
                    },
                };
                vec![ManifestSlot {
                    descriptor: PlatformDescriptor::implicit(),
                    source: ManifestSource::Legacy(Arc::new(manifest)),
                    resolved: OnceCell::new(),
                }]
            }
            ParsedManifest::ModernSingle(modern) => vec![ManifestSlot {
                descriptor: PlatformDescriptor::implicit(),
                source: ManifestSource::Modern(modern, raw.media_type.clone()),
                resolved: OnceCell::new(),
            }],
            ParsedManifest::ModernList(list) => list
                .manifests
                .iter()
                .map(|member| ManifestSlot {
                    descriptor: PlatformDescriptor::from_list_member(member),
                    source: ManifestSource::Member(member.digest.clone()),
                    resolved: OnceCell::new(),
                })
                .collect(),
        };

        Ok(Self {
            client,
            reference: reference.clone(),
            digest,
            schema_version,
            slots,
            history: OnceCell::new(),
        })
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn schema_version(&self) -> u8 {
        self.schema_version
    }

    /// Platform metadata without resolving manifests.
    pub fn platforms(&self) -> impl Iterator<Item = &PlatformDescriptor> {
        self.slots.iter().map(|s| &s.descriptor)
    }

    /// Resolve every platform's manifest. Each one is fetched at most once
    /// for the lifetime of this image.
    pub async fn resolve_platforms(&self) -> Result<Vec<ResolvedPlatform>> {
        let futures = self.slots.iter().map(|slot| async move {
            let manifest = slot
                .resolved
                .get_or_try_init(|| self.resolve_slot(slot))
                .await?
                .clone();
            Ok::<_, SpyError>(ResolvedPlatform {
                descriptor: slot.descriptor.clone(),
                manifest,
            })
        });
        futures::future::try_join_all(futures).await
    }

    async fn resolve_slot(&self, slot: &ManifestSlot) -> Result<Arc<ResolvedManifest>> {
        match &slot.source {
            ManifestSource::Legacy(manifest) => Ok(manifest.clone()),
            ManifestSource::Modern(modern, media_type) => {
                self.resolve_modern(modern, media_type.clone()).await
            }
            ManifestSource::Member(digest) => {
                let raw = self.client.fetch_manifest(&self.reference, digest).await?;
                match ParsedManifest::parse(&raw)? {
                    ParsedManifest::ModernSingle(modern) => {
                        self.resolve_modern(&modern, raw.media_type).await
                    }
                    _ => Err(SpyError::UnsupportedEncoding(format!(
                        "{} as member of a manifest list",
                        raw.media_type
                    ))),
                }
            }
        }
    }

    async fn resolve_modern(
        &self,
        modern: &ModernManifest,
        media_type: String,
    ) -> Result<Arc<ResolvedManifest>> {
        let history = self.history().await?.to_vec();
        Ok(Arc::new(ResolvedManifest {
            media_type: modern.media_type.clone().unwrap_or(media_type),
            schema_version: 2,
            layers: modern.layers(),
            config: ImageConfig {
                digest: modern.config.digest.clone(),
                history,
                media_type: Some(modern.config.media_type.clone()),
                size: Some(modern.config.size),
                schema: 2,
            },
        }))
    }

    /// Build history from the schema 1 encoding of the same tag.
    async fn history(&self) -> Result<&[HistoryEntry]> {
        let history = self
            .history
            .get_or_try_init(|| async {
                match self.client.fetch_legacy_manifest(&self.reference).await {
                    Ok(raw) => match ParsedManifest::parse(&raw)? {
                        ParsedManifest::LegacySingle(legacy) => legacy.history(),
                        _ => Ok(Vec::new()),
                    },
                    Err(e) if e.is_not_found() => {
                        tracing::debug!(
                            reference = %self.reference,
                            "Legacy manifest unavailable, history left empty"
                        );
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(history.as_slice())
    }
}
