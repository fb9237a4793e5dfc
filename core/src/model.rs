//! Persisted entities: Image → Tag / Platform → Layer / LayerPosition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Store-assigned identifier. `0` means "not yet persisted".
pub type Id = i64;

/// A content-addressed image. Immutable once created apart from `scraped_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: Id,
    /// Registry-computed manifest digest, unique across the store.
    pub digest: String,
    /// Repository name including registry host, e.g. "docker.io/library/nginx".
    pub name: String,
    pub schema_version: u8,
    pub created_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

/// A tag name pointing at an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Id,
    pub image_id: Id,
    pub name: String,
    /// Version class the tag belongs to, e.g. "majorMinorPatch".
    pub distinction: String,
    /// At most one latest tag per (repository, distinction).
    pub is_latest: bool,
    /// False once the name has moved on to another digest.
    pub is_tagged: bool,
}

impl Tag {
    /// A fresh tag as recorded on first scrape.
    pub fn new(image_id: Id, name: impl Into<String>, distinction: impl Into<String>) -> Self {
        Self {
            id: 0,
            image_id,
            name: name.into(),
            distinction: distinction.into(),
            is_latest: false,
            is_tagged: true,
        }
    }
}

/// One architecture/OS/variant-specific manifest within an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: Id,
    pub image_id: Id,
    pub architecture: String,
    pub os: String,
    pub os_version: String,
    pub variant: String,
    /// Digest of the platform's config blob.
    pub manifest_digest: String,
    /// Build time taken from the image history.
    pub created: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub features: Vec<String>,
    pub os_features: Vec<String>,
}

/// A filesystem layer, shared across platforms and images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: Id,
    pub digest: String,
    /// Images judged the likely origin of this layer.
    #[serde(default)]
    pub source_image_ids: ImageIdSet,
}

impl Layer {
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            id: 0,
            digest: digest.into(),
            source_image_ids: ImageIdSet::default(),
        }
    }
}

/// Slot of a layer within a platform's stack; position 0 is the base layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPosition {
    pub id: Id,
    pub layer_id: Id,
    pub platform_id: Id,
    pub position: u32,
}

/// Sorted, de-duplicated set of image ids.
///
/// Equality is set equality since the representation is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ImageIdSet(Vec<Id>);

impl ImageIdSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert an id. Returns false if it was already present.
    pub fn insert(&mut self, id: Id) -> bool {
        match self.0.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, id);
                true
            }
        }
    }

    pub fn contains(&self, id: Id) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Id> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[Id] {
        &self.0
    }

    /// Ids in `self` that are not in `other`.
    pub fn difference(&self, other: &ImageIdSet) -> ImageIdSet {
        ImageIdSet(self.iter().filter(|id| !other.contains(*id)).collect())
    }

    pub fn is_disjoint(&self, other: &ImageIdSet) -> bool {
        self.iter().all(|id| !other.contains(id))
    }
}

impl FromIterator<Id> for ImageIdSet {
    fn from_iter<T: IntoIterator<Item = Id>>(iter: T) -> Self {
        let mut ids: Vec<Id> = iter.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }
}

impl From<Vec<Id>> for ImageIdSet {
    fn from(ids: Vec<Id>) -> Self {
        ids.into_iter().collect()
    }
}

// Snapshots are external input; restore the canonical order on load.
impl<'de> Deserialize<'de> for ImageIdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Id>::deserialize(deserializer).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // ImageIdSet
    // ========================================================================

    #[test]
    fn test_id_set_is_sorted_and_deduplicated() {
        let set: ImageIdSet = vec![3, 1, 3, 2, 1].into();
        assert_eq!(set.as_slice(), &[1, 2, 3]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_id_set_equality_ignores_input_order() {
        let a: ImageIdSet = vec![5, 2].into();
        let b: ImageIdSet = vec![2, 5, 5].into();
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_set_insert() {
        let mut set = ImageIdSet::new();
        assert!(set.insert(4));
        assert!(set.insert(1));
        assert!(!set.insert(4));
        assert_eq!(set.as_slice(), &[1, 4]);
        assert!(set.contains(1));
        assert!(!set.contains(2));
    }

    #[test]
    fn test_id_set_difference() {
        let a: ImageIdSet = vec![1, 2, 3].into();
        let b: ImageIdSet = vec![2, 4].into();
        assert_eq!(a.difference(&b).as_slice(), &[1, 3]);
        assert_eq!(b.difference(&a).as_slice(), &[4]);
        assert!(a.difference(&a).is_empty());
    }

    #[test]
    fn test_id_set_disjoint() {
        let a: ImageIdSet = vec![1, 2].into();
        let b: ImageIdSet = vec![3].into();
        let c: ImageIdSet = vec![2, 3].into();
        assert!(a.is_disjoint(&b));
        assert!(!a.is_disjoint(&c));
        assert!(ImageIdSet::new().is_disjoint(&a));
    }

    #[test]
    fn test_id_set_serializes_as_plain_array() {
        let set: ImageIdSet = vec![2, 1].into();
        assert_eq!(serde_json::to_string(&set).unwrap(), "[1,2]");
        let back: ImageIdSet = serde_json::from_str("[1,2]").unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_id_set_deserialize_restores_canonical_order() {
        let set: ImageIdSet = serde_json::from_str("[9,3,9,1]").unwrap();
        assert_eq!(set.as_slice(), &[1, 3, 9]);
        assert!(set.contains(3));
        let other: ImageIdSet = vec![1, 9].into();
        assert_eq!(set.difference(&other).as_slice(), &[3]);

        let layer: Layer =
            serde_json::from_str(r#"{"id":1,"digest":"sha256:a","source_image_ids":[4,2,4]}"#)
                .unwrap();
        assert_eq!(layer.source_image_ids.as_slice(), &[2, 4]);
    }

    // ========================================================================
    // Entities
    // ========================================================================

    #[test]
    fn test_new_tag_defaults() {
        let tag = Tag::new(7, "1.2.3", "majorMinorPatch");
        assert_eq!(tag.id, 0);
        assert_eq!(tag.image_id, 7);
        assert!(!tag.is_latest);
        assert!(tag.is_tagged);
    }

    #[test]
    fn test_layer_without_sources_deserializes() {
        let layer: Layer = serde_json::from_str(r#"{"id":1,"digest":"sha256:a"}"#).unwrap();
        assert!(layer.source_image_ids.is_empty());
    }
}
