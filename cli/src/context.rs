//! Configuration loading and collaborator wiring for commands.
//!
//! Precedence: command-line flags, then the YAML config file, then defaults.
//! Without an explicit store path the CLI persists to `~/.imagespy/store.json`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use imagespy_core::config::SpyConfig;
use imagespy_core::event::EventEmitter;
use imagespy_core::log::LogFormat;
use imagespy_runtime::{MemoryStore, OciRegistryClient, Scraper};

/// Flags accepted by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// JSON snapshot file of the image store
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Default registry for references without a host
    #[arg(long, global = true)]
    pub registry: Option<String>,

    /// Use plain HTTP for the default registry
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Log filter, e.g. "info" or "imagespy_runtime=debug"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format (text, json)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,
}

/// Return the default store snapshot path (~/.imagespy/store.json).
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".imagespy"))
        .unwrap_or_else(|| PathBuf::from(".imagespy"))
        .join("store.json")
}

/// Load the config file (if any) and apply flag overrides.
pub fn load_config(args: &GlobalArgs) -> Result<SpyConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SpyConfig::from_file(path)?,
        None => SpyConfig::default(),
    };

    if let Some(store) = &args.store {
        config.store.path = Some(store.clone());
    }
    if config.store.path.is_none() {
        config.store.path = Some(default_store_path());
    }
    if let Some(registry) = &args.registry {
        config.registry.address = registry.clone();
    }
    if args.insecure {
        config.registry.insecure = true;
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.log.format = format;
    }

    config.validate()?;
    Ok(config)
}

/// Wired collaborators for one command invocation.
pub struct Context {
    pub config: SpyConfig,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<OciRegistryClient>,
    pub events: EventEmitter,
    pub scraper: Arc<Scraper>,
}

impl Context {
    pub fn open(config: SpyConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let store = match &config.store.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                MemoryStore::open(path)?
            }
            None => MemoryStore::new(),
        };
        let store = Arc::new(store);
        let registry = Arc::new(OciRegistryClient::from_config(&config.registry));
        let events = EventEmitter::new(config.updater.event_capacity);
        let scraper = Arc::new(Scraper::new(
            registry.clone(),
            store.clone(),
            events.clone(),
        ));

        tracing::debug!(
            store = ?config.store.path,
            registry = %config.registry.address,
            "Opened imagespy context"
        );

        Ok(Self {
            config,
            store,
            registry,
            events,
            scraper,
        })
    }

    /// The registry used for references without a host.
    pub fn default_registry(&self) -> &str {
        &self.config.registry.address
    }
}
