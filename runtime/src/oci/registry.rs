//! Registry client for reading tags, digests and raw manifests.
//!
//! [`RegistryClient`] is the seam the scraper consumes. [`OciRegistryClient`]
//! implements it with the `oci-distribution` crate against any
//! distribution-spec registry (Docker Hub, GHCR, a private registry, etc.).

use async_trait::async_trait;
use imagespy_core::config::RegistryConfig;
use imagespy_core::error::{Result, SpyError};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::reference::ImageReference;

/// Docker schema 1 manifest, unsigned.
pub const MEDIA_TYPE_LEGACY: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Docker schema 1 manifest, signed.
pub const MEDIA_TYPE_LEGACY_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 manifest.
pub const MEDIA_TYPE_MODERN: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const MEDIA_TYPE_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Which of the three manifest encodings a raw manifest uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaKind {
    /// Schema 1, single platform.
    Legacy,
    /// Schema 2 or OCI manifest, single platform.
    Modern,
    /// Schema 2 manifest list or OCI index.
    List,
    /// Anything else, carrying whatever media type was seen.
    Unknown(String),
}

impl SchemaKind {
    /// Classify a media type. Returns None if the media type says nothing useful.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        // Registries may append parameters like "; charset=utf-8"
        let media_type = media_type.split(';').next().unwrap_or("").trim();
        match media_type {
            MEDIA_TYPE_LEGACY | MEDIA_TYPE_LEGACY_SIGNED => Some(SchemaKind::Legacy),
            MEDIA_TYPE_MODERN | MEDIA_TYPE_OCI_MANIFEST => Some(SchemaKind::Modern),
            MEDIA_TYPE_LIST | MEDIA_TYPE_OCI_INDEX => Some(SchemaKind::List),
            "" | "application/json" | "text/plain" | "application/octet-stream" => None,
            other => Some(SchemaKind::Unknown(other.to_string())),
        }
    }

    /// Classify from the JSON body's `schemaVersion` / `mediaType` / shape.
    fn from_body(bytes: &[u8]) -> Self {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(_) => return SchemaKind::Unknown("invalid json".to_string()),
        };

        if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
            if let Some(kind) = Self::from_media_type(media_type) {
                return kind;
            }
        }

        match value.get("schemaVersion").and_then(|v| v.as_u64()) {
            Some(1) => SchemaKind::Legacy,
            Some(2) if value.get("manifests").is_some() => SchemaKind::List,
            Some(2) if value.get("layers").is_some() => SchemaKind::Modern,
            Some(v) => SchemaKind::Unknown(format!("schemaVersion {}", v)),
            None => SchemaKind::Unknown("missing schemaVersion".to_string()),
        }
    }
}

/// Manifest bytes exactly as served by the registry.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub kind: SchemaKind,
}

impl RawManifest {
    /// Wrap manifest bytes, detecting the encoding from the media type and
    /// falling back to the body when the media type is missing or generic.
    pub fn new(bytes: Vec<u8>, media_type: Option<&str>) -> Self {
        let from_header = media_type.and_then(SchemaKind::from_media_type);
        let kind = match from_header {
            Some(kind) => kind,
            None => SchemaKind::from_body(&bytes),
        };
        let media_type = match (media_type, &kind) {
            (Some(m), _) if !m.is_empty() => m.to_string(),
            (_, SchemaKind::Legacy) => MEDIA_TYPE_LEGACY_SIGNED.to_string(),
            (_, SchemaKind::Modern) => MEDIA_TYPE_MODERN.to_string(),
            (_, SchemaKind::List) => MEDIA_TYPE_LIST.to_string(),
            (_, SchemaKind::Unknown(m)) => m.clone(),
        };
        Self {
            bytes,
            media_type,
            kind,
        }
    }
}

/// Read access to a container registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// All tags of the reference's repository.
    async fn fetch_tag_list(&self, reference: &ImageReference) -> Result<Vec<String>>;

    /// Manifest digest the reference's tag currently points at.
    async fn fetch_digest(&self, reference: &ImageReference) -> Result<String>;

    /// Manifest of the reference's repository addressed by tag or digest.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        reference_or_digest: &str,
    ) -> Result<RawManifest>;

    /// Schema 1 manifest of the reference's tag, used only to recover history.
    async fn fetch_legacy_manifest(&self, reference: &ImageReference) -> Result<RawManifest>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from the registry configuration, which itself falls back
    /// to `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`.
    pub fn from_config(config: &RegistryConfig) -> Self {
        match config.credentials() {
            Some((username, password)) => Self::basic(username, password),
            None => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`RegistryClient`] backed by `oci-distribution`.
pub struct OciRegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistryClient {
    /// Create a client talking HTTPS to every registry.
    pub fn new(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Https)
    }

    /// Create a client from configuration. `insecure` registries are
    /// contacted over plain HTTP.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let protocol = if config.insecure {
            ClientProtocol::HttpsExcept(vec![config.address.clone()])
        } else {
            ClientProtocol::Https
        };
        Self::with_protocol(RegistryAuth::from_config(config), protocol)
    }

    fn with_protocol(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    async fn pull_raw(
        &self,
        reference: &ImageReference,
        reference_or_digest: &str,
        accepted: &[&str],
        operation: &'static str,
    ) -> Result<RawManifest> {
        let oci_ref = to_oci_reference(reference, Some(reference_or_digest))?;
        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth.to_oci_auth(), accepted)
            .await
            .map_err(|e| map_registry_error(operation, "manifest", &oci_ref, e))?;

        tracing::debug!(
            reference = %oci_ref,
            digest = %digest,
            size = bytes.len(),
            "Fetched manifest"
        );

        Ok(RawManifest::new(bytes, None))
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn fetch_tag_list(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let oci_ref = to_oci_reference(reference, None)?;
        let response = self
            .client
            .list_tags(&oci_ref, &self.auth.to_oci_auth(), None, None)
            .await
            .map_err(|e| map_registry_error("fetching tag list", "repository", &oci_ref, e))?;

        tracing::debug!(
            repository = %reference.repository_name(),
            tags = response.tags.len(),
            "Fetched tag list"
        );

        Ok(response.tags)
    }

    async fn fetch_digest(&self, reference: &ImageReference) -> Result<String> {
        if let Some(ref digest) = reference.digest {
            return Ok(digest.clone());
        }

        let oci_ref = to_oci_reference(reference, None)?;
        self.client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| map_registry_error("fetching digest", "tag", &oci_ref, e))
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        reference_or_digest: &str,
    ) -> Result<RawManifest> {
        self.pull_raw(
            reference,
            reference_or_digest,
            &[
                MEDIA_TYPE_MODERN,
                MEDIA_TYPE_LIST,
                MEDIA_TYPE_OCI_MANIFEST,
                MEDIA_TYPE_OCI_INDEX,
                MEDIA_TYPE_LEGACY_SIGNED,
                MEDIA_TYPE_LEGACY,
            ],
            "fetching manifest",
        )
        .await
    }

    async fn fetch_legacy_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        let raw = self
            .pull_raw(
                reference,
                reference.tag_or_default(),
                &[MEDIA_TYPE_LEGACY_SIGNED, MEDIA_TYPE_LEGACY],
                "fetching legacy manifest",
            )
            .await?;

        // Registries that cannot convert answer with the modern encoding
        if raw.kind != SchemaKind::Legacy {
            return Err(SpyError::not_found(
                "legacy manifest",
                reference.to_string(),
            ));
        }
        Ok(raw)
    }
}

/// Convert an ImageReference to an oci-distribution Reference, optionally
/// overriding the tag or digest.
fn to_oci_reference(
    reference: &ImageReference,
    reference_or_digest: Option<&str>,
) -> Result<Reference> {
    let target = reference_or_digest.unwrap_or_else(|| reference.tag_or_default());
    let separator = if target.contains(':') { '@' } else { ':' };
    let ref_str = format!("{}{}{}", reference.repository_name(), separator, target);

    ref_str.parse::<Reference>().map_err(|e| {
        SpyError::Reference(format!("invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Map oci-distribution errors onto NotFound / Transport.
fn map_registry_error(
    operation: &'static str,
    kind: &'static str,
    reference: &Reference,
    error: OciDistributionError,
) -> SpyError {
    match error {
        OciDistributionError::ImageManifestNotFoundError(_) => {
            SpyError::not_found(kind, reference.to_string())
        }
        OciDistributionError::ServerError { code: 404, .. } => {
            SpyError::not_found(kind, reference.to_string())
        }
        other => SpyError::transport(operation, format!("{}: {}", reference, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Schema detection
    // ========================================================================

    #[test]
    fn test_kind_from_media_type() {
        assert_eq!(
            SchemaKind::from_media_type(MEDIA_TYPE_LEGACY_SIGNED),
            Some(SchemaKind::Legacy)
        );
        assert_eq!(
            SchemaKind::from_media_type(MEDIA_TYPE_OCI_MANIFEST),
            Some(SchemaKind::Modern)
        );
        assert_eq!(
            SchemaKind::from_media_type(&format!("{}; charset=utf-8", MEDIA_TYPE_LIST)),
            Some(SchemaKind::List)
        );
        assert_eq!(SchemaKind::from_media_type("application/json"), None);
        assert_eq!(
            SchemaKind::from_media_type("application/x-foo"),
            Some(SchemaKind::Unknown("application/x-foo".to_string()))
        );
    }

    #[test]
    fn test_raw_manifest_detects_from_body() {
        let legacy = RawManifest::new(br#"{"schemaVersion":1,"fsLayers":[]}"#.to_vec(), None);
        assert_eq!(legacy.kind, SchemaKind::Legacy);
        assert_eq!(legacy.media_type, MEDIA_TYPE_LEGACY_SIGNED);

        let list = RawManifest::new(
            br#"{"schemaVersion":2,"manifests":[]}"#.to_vec(),
            Some("application/json"),
        );
        assert_eq!(list.kind, SchemaKind::List);

        let modern = RawManifest::new(
            format!(r#"{{"schemaVersion":2,"mediaType":"{}"}}"#, MEDIA_TYPE_MODERN).into_bytes(),
            None,
        );
        assert_eq!(modern.kind, SchemaKind::Modern);
    }

    #[test]
    fn test_raw_manifest_unknown_body() {
        let raw = RawManifest::new(br#"{"schemaVersion":3}"#.to_vec(), None);
        assert!(matches!(raw.kind, SchemaKind::Unknown(_)));

        let garbage = RawManifest::new(b"not json".to_vec(), None);
        assert!(matches!(garbage.kind, SchemaKind::Unknown(_)));
    }

    #[test]
    fn test_header_wins_over_body() {
        let raw = RawManifest::new(
            br#"{"schemaVersion":2,"layers":[]}"#.to_vec(),
            Some(MEDIA_TYPE_LEGACY),
        );
        assert_eq!(raw.kind, SchemaKind::Legacy);
    }

    // ========================================================================
    // Auth and references
    // ========================================================================

    #[test]
    fn test_registry_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("user", "pass").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_registry_auth_from_config() {
        let config = RegistryConfig {
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let auth = RegistryAuth::from_config(&config);
        assert_eq!(auth.username.as_deref(), Some("user"));
        assert_eq!(auth.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let r = ImageReference::parse("ghcr.io/imagespy/api:v0.1.0").unwrap();
        let oci_ref = to_oci_reference(&r, None).unwrap();
        assert_eq!(oci_ref.to_string(), "ghcr.io/imagespy/api:v0.1.0");
    }

    #[test]
    fn test_to_oci_reference_with_digest_override() {
        let r = ImageReference::parse("ghcr.io/imagespy/api:v0.1.0").unwrap();
        let digest = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";
        let oci_ref = to_oci_reference(&r, Some(digest)).unwrap();
        assert_eq!(oci_ref.digest(), Some(digest));
    }
}
