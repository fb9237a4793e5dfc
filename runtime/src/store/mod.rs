//! Persistent store for scraped images.
//!
//! Typed repositories per entity, grouped by [`Repositories`]. A [`Store`]
//! additionally opens [`Transaction`]s exposing the same repositories; writes
//! made through a transaction become visible to other readers only on
//! [`Transaction::commit`].

mod memory;

pub use memory::MemoryStore;

use imagespy_core::error::Result;
use imagespy_core::model::{Id, Image, Layer, LayerPosition, Platform, Tag};

/// Filters for a single image lookup. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct ImageGetOptions {
    pub id: Option<Id>,
    pub digest: Option<String>,
    pub name: Option<String>,
    /// Image must carry a tag with this name.
    pub tag_name: Option<String>,
}

impl ImageGetOptions {
    pub fn by_id(id: Id) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_digest(digest: impl Into<String>) -> Self {
        Self {
            digest: Some(digest.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageListOptions {
    pub name: Option<String>,
    pub ids: Option<Vec<Id>>,
}

/// Filters for a single tag lookup. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct TagGetOptions {
    pub distinction: Option<String>,
    pub image_id: Option<Id>,
    /// Name of the owning image (the repository).
    pub image_name: Option<String>,
    pub is_latest: Option<bool>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TagListOptions {
    pub distinction: Option<String>,
    pub image_id: Option<Id>,
    pub image_name: Option<String>,
    pub is_latest: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct PlatformGetOptions {
    pub id: Option<Id>,
    pub architecture: Option<String>,
    pub os: Option<String>,
    pub variant: Option<String>,
    pub image_id: Option<Id>,
}

#[derive(Debug, Clone, Default)]
pub struct PlatformListOptions {
    pub image_id: Option<Id>,
    /// Platforms having a layer with this digest at any position.
    pub layer_digest: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LayerGetOptions {
    pub id: Option<Id>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LayerListOptions {
    /// Layers of one platform, ordered by position.
    pub platform_id: Option<Id>,
}

#[derive(Debug, Clone, Default)]
pub struct LayerPositionListOptions {
    pub platform_id: Option<Id>,
    pub layer_id: Option<Id>,
}

pub trait ImageRepository {
    /// Insert an image; the returned copy carries the assigned id.
    fn create(&self, image: Image) -> Result<Image>;
    fn get(&self, options: &ImageGetOptions) -> Result<Image>;
    fn list(&self, options: &ImageListOptions) -> Result<Vec<Image>>;
    fn update(&self, image: &Image) -> Result<()>;
    /// Distinct repository names, sorted.
    fn list_names(&self) -> Result<Vec<String>>;
}

pub trait TagRepository {
    fn create(&self, tag: Tag) -> Result<Tag>;
    fn get(&self, options: &TagGetOptions) -> Result<Tag>;
    fn list(&self, options: &TagListOptions) -> Result<Vec<Tag>>;
    fn update(&self, tag: &Tag) -> Result<()>;
}

pub trait PlatformRepository {
    fn create(&self, platform: Platform) -> Result<Platform>;
    fn get(&self, options: &PlatformGetOptions) -> Result<Platform>;
    fn list(&self, options: &PlatformListOptions) -> Result<Vec<Platform>>;
}

pub trait LayerRepository {
    fn create(&self, layer: Layer) -> Result<Layer>;
    fn get(&self, options: &LayerGetOptions) -> Result<Layer>;
    fn list(&self, options: &LayerListOptions) -> Result<Vec<Layer>>;
    /// Persist a changed `source_image_ids` set.
    fn update(&self, layer: &Layer) -> Result<()>;
}

pub trait LayerPositionRepository {
    fn create(&self, position: LayerPosition) -> Result<LayerPosition>;
    fn list(&self, options: &LayerPositionListOptions) -> Result<Vec<LayerPosition>>;
}

/// The full repository set.
pub trait Repositories {
    fn images(&self) -> &dyn ImageRepository;
    fn tags(&self) -> &dyn TagRepository;
    fn platforms(&self) -> &dyn PlatformRepository;
    fn layers(&self) -> &dyn LayerRepository;
    fn layer_positions(&self) -> &dyn LayerPositionRepository;
}

/// Shared store handle.
pub trait Store: Repositories + Send + Sync {
    /// Open a transaction. Writers are serialized; the transaction blocks
    /// other writers until it is committed or rolled back.
    fn transaction(&self) -> Result<Box<dyn Transaction + '_>>;
}

/// A write scope. Dropping without commit rolls back.
pub trait Transaction: Repositories {
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}
