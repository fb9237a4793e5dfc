//! imagespy core - foundational types and abstractions.
//!
//! Data model, tag version resolution, error taxonomy, configuration,
//! logging setup and the event bus shared by the imagespy crates.

pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod model;
pub mod version;

// Re-export commonly used types
pub use config::{RegistryConfig, SpyConfig, StoreConfig, UpdaterConfig};
pub use error::{Result, SpyError, StepContext};
pub use event::{EventEmitter, SpyEvent};
pub use log::{LogConfig, LogFormat};
pub use model::{Id, Image, ImageIdSet, Layer, LayerPosition, Platform, Tag};
pub use version::{classify, Version, VersionKind, VersionResolver};

/// imagespy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
