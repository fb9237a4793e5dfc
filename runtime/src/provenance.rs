//! Layer provenance.
//!
//! A layer shared by several platforms is assumed to originate from the
//! platform with the shallowest layer stack; every deeper platform added
//! layers on top of it. The images owning those shallowest platforms are the
//! layer's source images.

use std::collections::HashMap;
use std::sync::Arc;

use imagespy_core::error::Result;
use imagespy_core::event::{events, EventEmitter, SpyEvent};
use imagespy_core::model::{Id, Image, ImageIdSet, Layer, LayerPosition};

use crate::store::{
    ImageListOptions, LayerGetOptions, LayerPositionListOptions, PlatformGetOptions,
    PlatformListOptions, Store,
};

/// Maintains `Layer::source_image_ids` and answers provenance queries.
#[derive(Clone)]
pub struct ProvenanceIndexer {
    store: Arc<dyn Store>,
    events: EventEmitter,
}

impl ProvenanceIndexer {
    pub fn new(store: Arc<dyn Store>, events: EventEmitter) -> Self {
        Self { store, events }
    }

    /// Images owning the shallowest platforms that contain the layer.
    pub fn compute_source_images(&self, layer_digest: &str) -> Result<ImageIdSet> {
        let platforms = self.store.platforms().list(&PlatformListOptions {
            layer_digest: Some(layer_digest.to_string()),
            ..Default::default()
        })?;

        let mut min_depth = usize::MAX;
        let mut sources: Vec<Id> = Vec::new();
        for platform in platforms {
            let depth = self.depth(platform.id)?;
            if depth < min_depth {
                min_depth = depth;
                sources.clear();
                sources.push(platform.image_id);
            } else if depth == min_depth {
                sources.push(platform.image_id);
            }
        }

        // Several platforms of one image collapse into one id
        Ok(sources.into_iter().collect())
    }

    /// Recompute and persist the layer's source images. Returns true if the
    /// stored set changed.
    pub fn update_source_images_of_layer(&self, layer: &Layer) -> Result<bool> {
        let mut current = self.store.layers().get(&LayerGetOptions {
            id: Some(layer.id),
            ..Default::default()
        })?;
        let sources = self.compute_source_images(&current.digest)?;
        if sources == current.source_image_ids {
            return Ok(false);
        }

        tracing::debug!(
            layer = %current.digest,
            previous = ?current.source_image_ids.as_slice(),
            sources = ?sources.as_slice(),
            "Updating source images of layer"
        );

        current.source_image_ids = sources;
        self.store.layers().update(&current)?;

        self.events.emit(SpyEvent::with_fields(
            events::LAYER_SOURCES_UPDATED,
            [
                ("layer", serde_json::json!(current.digest)),
                (
                    "source_image_ids",
                    serde_json::json!(current.source_image_ids.as_slice()),
                ),
            ],
        ));
        Ok(true)
    }

    /// Stored source images of a layer.
    pub fn source_images(&self, layer_digest: &str) -> Result<Vec<Image>> {
        let layer = self.store.layers().get(&LayerGetOptions {
            digest: Some(layer_digest.to_string()),
            ..Default::default()
        })?;
        self.images(layer.source_image_ids.as_slice().to_vec())
    }

    /// Images built FROM the given image.
    ///
    /// Takes the image's deepest platform and its outermost layer, then finds
    /// platforms of other images carrying that layer at the same position
    /// with more layers on top.
    pub fn children(&self, image_id: Id) -> Result<Vec<Image>> {
        let platforms = self.store.platforms().list(&PlatformListOptions {
            image_id: Some(image_id),
            ..Default::default()
        })?;

        let mut deepest: Option<Vec<LayerPosition>> = None;
        for platform in platforms {
            let positions = self.positions(platform.id)?;
            if deepest.as_ref().map_or(true, |d| positions.len() > d.len()) {
                deepest = Some(positions);
            }
        }

        let deepest = match deepest {
            Some(positions) if !positions.is_empty() => positions,
            _ => return Ok(Vec::new()),
        };
        let depth = deepest.len();
        let top = match deepest.iter().max_by_key(|lp| lp.position) {
            Some(top) => top.clone(),
            None => return Ok(Vec::new()),
        };

        let candidates = self.store.layer_positions().list(&LayerPositionListOptions {
            layer_id: Some(top.layer_id),
            ..Default::default()
        })?;

        let mut depths: HashMap<Id, usize> = HashMap::new();
        let mut children = ImageIdSet::new();
        for candidate in candidates {
            if candidate.position != top.position || candidate.platform_id == top.platform_id {
                continue;
            }
            let platform = self.store.platforms().get(&PlatformGetOptions {
                id: Some(candidate.platform_id),
                ..Default::default()
            })?;
            if platform.image_id == image_id {
                continue;
            }
            let candidate_depth = match depths.get(&platform.id) {
                Some(d) => *d,
                None => {
                    let d = self.depth(platform.id)?;
                    depths.insert(platform.id, d);
                    d
                }
            };
            if candidate_depth > depth {
                children.insert(platform.image_id);
            }
        }

        self.images(children.as_slice().to_vec())
    }

    fn positions(&self, platform_id: Id) -> Result<Vec<LayerPosition>> {
        self.store.layer_positions().list(&LayerPositionListOptions {
            platform_id: Some(platform_id),
            ..Default::default()
        })
    }

    fn depth(&self, platform_id: Id) -> Result<usize> {
        Ok(self.positions(platform_id)?.len())
    }

    fn images(&self, ids: Vec<Id>) -> Result<Vec<Image>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.images().list(&ImageListOptions {
            ids: Some(ids),
            ..Default::default()
        })
    }
}
