//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:1.2.3` into registry, repository
//! path, tag and digest. The persisted image name is
//! [`ImageReference::repository_name`], i.e. `registry/path`.

use imagespy_core::error::{Result, SpyError};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, optionally with port (e.g., "ghcr.io", "dev.local:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "1.2.3")
    pub tag: Option<String>,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference, defaulting the registry to Docker Hub.
    pub fn parse(reference: &str) -> Result<Self> {
        Self::parse_with_registry(reference, DEFAULT_REGISTRY)
    }

    /// Parse a reference, using `default_registry` when the reference names none.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1` → docker.io/library/nginx:1
    /// - `org/app` → docker.io/org/app:latest
    /// - `ghcr.io/org/app:1.2` → ghcr.io/org/app:1.2
    /// - `dev.local:5000/app@sha256:abc...` → digest-only reference
    pub fn parse_with_registry(reference: &str, default_registry: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SpyError::Reference("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !digest.contains(':') {
                    return Err(SpyError::Reference(format!(
                        "invalid digest in '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag is whatever follows the last colon after the last slash, so
        // that "host:5000/app" keeps its port and "app:1" keeps its tag.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(SpyError::Reference(format!(
                "empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name, default_registry)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Parse a persisted image name (see [`Self::repository_name`]), optionally
    /// followed by `:tag` or `@digest`.
    ///
    /// The first path component is always the registry host, even when it
    /// does not look like one (`myreg/app`).
    pub fn from_repository_name(name: &str) -> Result<Self> {
        let (registry, rest) = match name.trim().split_once('/') {
            Some((registry, rest)) if !registry.is_empty() && !rest.is_empty() => {
                (registry, rest)
            }
            _ => {
                return Err(SpyError::Reference(format!(
                    "stored image name '{}' has no registry host",
                    name
                )))
            }
        };

        let mut reference = Self::parse_with_registry(rest, registry)?;
        if reference.registry != registry {
            // The path itself starts with something host-like
            reference.repository = format!("{}/{}", reference.registry, reference.repository);
            reference.registry = registry.to_string();
        }
        Ok(reference)
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str, default_registry: &str) -> Result<(String, String)> {
        if let Some((first, rest)) = name.split_once('/') {
            // The first component is a registry if it looks like a hostname
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(SpyError::Reference(format!(
                        "empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        if name.is_empty() {
            return Err(SpyError::Reference("empty repository name".to_string()));
        }

        let repository = if default_registry == DEFAULT_REGISTRY && !name.contains('/') {
            // Single name like "nginx" → "library/nginx" on Docker Hub
            format!("library/{}", name)
        } else {
            name.to_string()
        };

        Ok((default_registry.to_string(), repository))
    }

    /// Repository name including the registry host, as persisted on images.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag, or "latest" for digest-only references.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// A sibling reference in the same repository with another tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// The same reference pinned to a digest.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            digest: Some(digest.into()),
            ..self.clone()
        }
    }

    /// Tag or digest used to address the manifest, digest preferred.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repository_name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = SpyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
