//! In-memory store with optional JSON snapshot persistence.
//!
//! The snapshot is rewritten after every committed write with an atomic
//! write (write to tmp file, then rename) to prevent corruption.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use imagespy_core::error::{Result, SpyError};
use imagespy_core::model::{Id, Image, Layer, LayerPosition, Platform, Tag};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use super::{
    ImageGetOptions, ImageListOptions, ImageRepository, LayerGetOptions, LayerListOptions,
    LayerPositionListOptions, LayerPositionRepository, LayerRepository, PlatformGetOptions,
    PlatformListOptions, PlatformRepository, Repositories, Store, TagGetOptions, TagListOptions,
    TagRepository, Transaction,
};

/// All rows, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    next_id: Id,
    images: BTreeMap<Id, Image>,
    tags: BTreeMap<Id, Tag>,
    platforms: BTreeMap<Id, Platform>,
    layers: BTreeMap<Id, Layer>,
    layer_positions: BTreeMap<Id, LayerPosition>,
}

fn matches<T: PartialEq>(filter: &Option<T>, value: &T) -> bool {
    filter.as_ref().map_or(true, |f| f == value)
}

impl Tables {
    fn assign_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn image_name(&self, image_id: Id) -> Option<&str> {
        self.images.get(&image_id).map(|i| i.name.as_str())
    }

    fn layer_by_digest(&self, digest: &str) -> Option<&Layer> {
        self.layers.values().find(|l| l.digest == digest)
    }

    // ------------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------------

    fn create_image(&mut self, mut image: Image) -> Result<Image> {
        if self.images.values().any(|i| i.digest == image.digest) {
            return Err(SpyError::Store(format!(
                "image {} already exists",
                image.digest
            )));
        }
        image.id = self.assign_id();
        self.images.insert(image.id, image.clone());
        Ok(image)
    }

    fn get_image(&self, o: &ImageGetOptions) -> Result<Image> {
        self.images
            .values()
            .find(|i| {
                matches(&o.id, &i.id)
                    && matches(&o.digest, &i.digest)
                    && matches(&o.name, &i.name)
                    && o.tag_name.as_ref().map_or(true, |name| {
                        self.tags
                            .values()
                            .any(|t| t.image_id == i.id && &t.name == name && t.is_tagged)
                    })
            })
            .cloned()
            .ok_or_else(|| SpyError::not_found("image", format!("{:?}", o)))
    }

    fn list_images(&self, o: &ImageListOptions) -> Vec<Image> {
        self.images
            .values()
            .filter(|i| matches(&o.name, &i.name))
            .filter(|i| o.ids.as_ref().map_or(true, |ids| ids.contains(&i.id)))
            .cloned()
            .collect()
    }

    fn update_image(&mut self, image: &Image) -> Result<()> {
        match self.images.get_mut(&image.id) {
            Some(existing) => {
                *existing = image.clone();
                Ok(())
            }
            None => Err(SpyError::not_found("image", image.id.to_string())),
        }
    }

    fn image_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.images.values().map(|i| i.name.as_str()).collect();
        names.into_iter().map(str::to_string).collect()
    }

    // ------------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------------

    fn create_tag(&mut self, mut tag: Tag) -> Result<Tag> {
        if !self.images.contains_key(&tag.image_id) {
            return Err(SpyError::Store(format!(
                "tag {} references unknown image {}",
                tag.name, tag.image_id
            )));
        }
        tag.id = self.assign_id();
        self.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    fn tag_matches(
        &self,
        t: &Tag,
        distinction: &Option<String>,
        image_id: &Option<Id>,
        image_name: &Option<String>,
        is_latest: &Option<bool>,
    ) -> bool {
        matches(distinction, &t.distinction)
            && matches(image_id, &t.image_id)
            && matches(is_latest, &t.is_latest)
            && image_name
                .as_deref()
                .map_or(true, |name| self.image_name(t.image_id) == Some(name))
    }

    fn get_tag(&self, o: &TagGetOptions) -> Result<Tag> {
        self.tags
            .values()
            .find(|t| {
                matches(&o.name, &t.name)
                    && self.tag_matches(t, &o.distinction, &o.image_id, &o.image_name, &o.is_latest)
            })
            .cloned()
            .ok_or_else(|| SpyError::not_found("tag", format!("{:?}", o)))
    }

    fn list_tags(&self, o: &TagListOptions) -> Vec<Tag> {
        self.tags
            .values()
            .filter(|t| self.tag_matches(t, &o.distinction, &o.image_id, &o.image_name, &o.is_latest))
            .cloned()
            .collect()
    }

    fn update_tag(&mut self, tag: &Tag) -> Result<()> {
        match self.tags.get_mut(&tag.id) {
            Some(existing) => {
                *existing = tag.clone();
                Ok(())
            }
            None => Err(SpyError::not_found("tag", tag.id.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Platforms
    // ------------------------------------------------------------------------

    fn create_platform(&mut self, mut platform: Platform) -> Result<Platform> {
        if !self.images.contains_key(&platform.image_id) {
            return Err(SpyError::Store(format!(
                "platform references unknown image {}",
                platform.image_id
            )));
        }
        platform.id = self.assign_id();
        self.platforms.insert(platform.id, platform.clone());
        Ok(platform)
    }

    fn get_platform(&self, o: &PlatformGetOptions) -> Result<Platform> {
        self.platforms
            .values()
            .find(|p| {
                matches(&o.id, &p.id)
                    && matches(&o.architecture, &p.architecture)
                    && matches(&o.os, &p.os)
                    && matches(&o.variant, &p.variant)
                    && matches(&o.image_id, &p.image_id)
            })
            .cloned()
            .ok_or_else(|| SpyError::not_found("platform", format!("{:?}", o)))
    }

    fn list_platforms(&self, o: &PlatformListOptions) -> Vec<Platform> {
        let with_layer: Option<HashSet<Id>> = o.layer_digest.as_deref().map(|digest| {
            match self.layer_by_digest(digest) {
                Some(layer) => self
                    .layer_positions
                    .values()
                    .filter(|lp| lp.layer_id == layer.id)
                    .map(|lp| lp.platform_id)
                    .collect(),
                None => HashSet::new(),
            }
        });

        self.platforms
            .values()
            .filter(|p| matches(&o.image_id, &p.image_id))
            .filter(|p| with_layer.as_ref().map_or(true, |ids| ids.contains(&p.id)))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------------
    // Layers
    // ------------------------------------------------------------------------

    fn create_layer(&mut self, mut layer: Layer) -> Result<Layer> {
        if self.layer_by_digest(&layer.digest).is_some() {
            return Err(SpyError::Store(format!(
                "layer {} already exists",
                layer.digest
            )));
        }
        layer.id = self.assign_id();
        self.layers.insert(layer.id, layer.clone());
        Ok(layer)
    }

    fn get_layer(&self, o: &LayerGetOptions) -> Result<Layer> {
        self.layers
            .values()
            .find(|l| matches(&o.id, &l.id) && matches(&o.digest, &l.digest))
            .cloned()
            .ok_or_else(|| SpyError::not_found("layer", format!("{:?}", o)))
    }

    fn list_layers(&self, o: &LayerListOptions) -> Vec<Layer> {
        match o.platform_id {
            Some(platform_id) => {
                let mut positions: Vec<&LayerPosition> = self
                    .layer_positions
                    .values()
                    .filter(|lp| lp.platform_id == platform_id)
                    .collect();
                positions.sort_by_key(|lp| lp.position);
                positions
                    .into_iter()
                    .filter_map(|lp| self.layers.get(&lp.layer_id).cloned())
                    .collect()
            }
            None => self.layers.values().cloned().collect(),
        }
    }

    fn update_layer(&mut self, layer: &Layer) -> Result<()> {
        match self.layers.get_mut(&layer.id) {
            Some(existing) => {
                *existing = layer.clone();
                Ok(())
            }
            None => Err(SpyError::not_found("layer", layer.id.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Layer positions
    // ------------------------------------------------------------------------

    fn create_layer_position(&mut self, mut position: LayerPosition) -> Result<LayerPosition> {
        if !self.layers.contains_key(&position.layer_id)
            || !self.platforms.contains_key(&position.platform_id)
        {
            return Err(SpyError::Store(format!(
                "layer position references unknown layer {} or platform {}",
                position.layer_id, position.platform_id
            )));
        }
        position.id = self.assign_id();
        self.layer_positions.insert(position.id, position.clone());
        Ok(position)
    }

    fn list_layer_positions(&self, o: &LayerPositionListOptions) -> Vec<LayerPosition> {
        let mut positions: Vec<LayerPosition> = self
            .layer_positions
            .values()
            .filter(|lp| matches(&o.platform_id, &lp.platform_id))
            .filter(|lp| matches(&o.layer_id, &lp.layer_id))
            .cloned()
            .collect();
        positions.sort_by_key(|lp| (lp.platform_id, lp.position));
        positions
    }
}

/// Uniform access to a set of tables, either the published ones or a
/// transaction's working copy.
trait TableAccess {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R;
    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R>;
}

impl<T: TableAccess> ImageRepository for T {
    fn create(&self, image: Image) -> Result<Image> {
        self.write(|t| t.create_image(image))
    }

    fn get(&self, options: &ImageGetOptions) -> Result<Image> {
        self.read(|t| t.get_image(options))
    }

    fn list(&self, options: &ImageListOptions) -> Result<Vec<Image>> {
        Ok(self.read(|t| t.list_images(options)))
    }

    fn update(&self, image: &Image) -> Result<()> {
        self.write(|t| t.update_image(image))
    }

    fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.read(|t| t.image_names()))
    }
}

impl<T: TableAccess> TagRepository for T {
    fn create(&self, tag: Tag) -> Result<Tag> {
        self.write(|t| t.create_tag(tag))
    }

    fn get(&self, options: &TagGetOptions) -> Result<Tag> {
        self.read(|t| t.get_tag(options))
    }

    fn list(&self, options: &TagListOptions) -> Result<Vec<Tag>> {
        Ok(self.read(|t| t.list_tags(options)))
    }

    fn update(&self, tag: &Tag) -> Result<()> {
        self.write(|t| t.update_tag(tag))
    }
}

impl<T: TableAccess> PlatformRepository for T {
    fn create(&self, platform: Platform) -> Result<Platform> {
        self.write(|t| t.create_platform(platform))
    }

    fn get(&self, options: &PlatformGetOptions) -> Result<Platform> {
        self.read(|t| t.get_platform(options))
    }

    fn list(&self, options: &PlatformListOptions) -> Result<Vec<Platform>> {
        Ok(self.read(|t| t.list_platforms(options)))
    }
}

impl<T: TableAccess> LayerRepository for T {
    fn create(&self, layer: Layer) -> Result<Layer> {
        self.write(|t| t.create_layer(layer))
    }

    fn get(&self, options: &LayerGetOptions) -> Result<Layer> {
        self.read(|t| t.get_layer(options))
    }

    fn list(&self, options: &LayerListOptions) -> Result<Vec<Layer>> {
        Ok(self.read(|t| t.list_layers(options)))
    }

    fn update(&self, layer: &Layer) -> Result<()> {
        self.write(|t| t.update_layer(layer))
    }
}

impl<T: TableAccess> LayerPositionRepository for T {
    fn create(&self, position: LayerPosition) -> Result<LayerPosition> {
        self.write(|t| t.create_layer_position(position))
    }

    fn list(&self, options: &LayerPositionListOptions) -> Result<Vec<LayerPosition>> {
        Ok(self.read(|t| t.list_layer_positions(options)))
    }
}

/// In-memory [`Store`].
///
/// Writers are serialized by one lock. A transaction holds that lock for its
/// lifetime and edits a private copy of the tables, which replaces the
/// published tables on commit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    writer: Mutex<()>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    /// Create an empty store that is never written to disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a JSON snapshot, loading it if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(|e| {
                SpyError::Store(format!(
                    "failed to read snapshot {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str(&data).map_err(|e| {
                SpyError::Store(format!("failed to parse snapshot: {}", e))
            })?
        } else {
            Tables::default()
        };

        tracing::debug!(path = %path.display(), "Opened store snapshot");

        Ok(Self {
            tables: RwLock::new(tables),
            writer: Mutex::new(()),
            snapshot: Some(path),
        })
    }

    /// Path of the snapshot file, if any.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Save tables to the snapshot file (atomic write).
    fn persist(&self, tables: &Tables) -> Result<()> {
        let path = match &self.snapshot {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SpyError::Store(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(tables)
            .map_err(|e| SpyError::Store(format!("failed to serialize snapshot: {}", e)))?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| {
            SpyError::Store(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, path).map_err(|e| {
            SpyError::Store(format!(
                "failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

impl TableAccess for MemoryStore {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let _writer = self.writer.lock();
        let mut working = self.tables.read().clone();
        let result = f(&mut working)?;
        self.persist(&working)?;
        *self.tables.write() = working;
        Ok(result)
    }
}

impl Repositories for MemoryStore {
    fn images(&self) -> &dyn ImageRepository {
        self
    }

    fn tags(&self) -> &dyn TagRepository {
        self
    }

    fn platforms(&self) -> &dyn PlatformRepository {
        self
    }

    fn layers(&self) -> &dyn LayerRepository {
        self
    }

    fn layer_positions(&self) -> &dyn LayerPositionRepository {
        self
    }
}

impl Store for MemoryStore {
    fn transaction(&self) -> Result<Box<dyn Transaction + '_>> {
        let writer = self.writer.lock();
        let working = self.tables.read().clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            _writer: writer,
            working: Mutex::new(working),
        }))
    }
}

/// Transaction over a [`MemoryStore`].
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    _writer: MutexGuard<'a, ()>,
    working: Mutex<Tables>,
}

impl TableAccess for MemoryTransaction<'_> {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.working.lock())
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        f(&mut self.working.lock())
    }
}

impl Repositories for MemoryTransaction<'_> {
    fn images(&self) -> &dyn ImageRepository {
        self
    }

    fn tags(&self) -> &dyn TagRepository {
        self
    }

    fn platforms(&self) -> &dyn PlatformRepository {
        self
    }

    fn layers(&self) -> &dyn LayerRepository {
        self
    }

    fn layer_positions(&self) -> &dyn LayerPositionRepository {
        self
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            store,
            _writer,
            working,
        } = *self;
        let working = working.into_inner();
        store.persist(&working)?;
        *store.tables.write() = working;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        tracing::debug!("Transaction rolled back");
        Ok(())
    }
}
