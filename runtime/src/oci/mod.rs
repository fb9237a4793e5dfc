//! Registry access and manifest normalization.
//!
//! ```text
//! ImageReference ──> RegistryClient ──> RawManifest ──> RegistryImage
//!                    (oci-distribution)  (bytes + kind)   (platforms, layers, history)
//! ```

pub mod manifest;
pub mod reference;
pub mod registry;

pub use manifest::{
    HistoryEntry, ImageConfig, ParsedManifest, PlatformDescriptor, RegistryImage,
    ResolvedManifest, ResolvedPlatform, EMPTY_LAYER_DIGEST,
};
pub use reference::ImageReference;
pub use registry::{OciRegistryClient, RawManifest, RegistryAuth, RegistryClient, SchemaKind};
