use thiserror::Error;

/// imagespy error types
#[derive(Error, Debug)]
pub enum SpyError {
    /// A digest, image, tag, platform or layer is absent.
    ///
    /// Routinely expected: it drives create-vs-update branching and is never
    /// logged as an error.
    #[error("{kind} does not exist: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The registry returned a manifest of an unrecognized type
    #[error("unknown manifest encoding: {0}")]
    UnsupportedEncoding(String),

    /// A field was queried that the manifest schema does not carry
    #[error("{field} is not supported by manifest schema {schema}")]
    UnsupportedBySchema { schema: u8, field: &'static str },

    /// Two tags cannot be ordered against each other
    #[error("cannot compare version '{left}' with '{right}'")]
    Incomparable { left: String, right: String },

    /// Registry unreachable or returned an invalid response
    #[error("registry {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// Persistence failure
    #[error("store error: {0}")]
    Store(String),

    /// A named orchestration step failed
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<SpyError>,
    },

    /// Invalid image reference
    #[error("invalid image reference: {0}")]
    Reference(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Worker pool error
    #[error("queue error: {0}")]
    Queue(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpyError {
    /// Build a NotFound error.
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        SpyError::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Build a Transport error for the given registry operation.
    pub fn transport(operation: &'static str, message: impl std::fmt::Display) -> Self {
        SpyError::Transport {
            operation,
            message: message.to_string(),
        }
    }

    /// Returns true if this error (or the error it wraps) is a NotFound.
    pub fn is_not_found(&self) -> bool {
        match self {
            SpyError::NotFound { .. } => true,
            SpyError::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if this error (or the error it wraps) is Incomparable.
    pub fn is_incomparable(&self) -> bool {
        match self {
            SpyError::Incomparable { .. } => true,
            SpyError::Step { source, .. } => source.is_incomparable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SpyError {
    fn from(err: serde_json::Error) -> Self {
        SpyError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SpyError {
    fn from(err: serde_yaml::Error) -> Self {
        SpyError::Serialization(err.to_string())
    }
}

/// Result type alias for imagespy operations
pub type Result<T> = std::result::Result<T, SpyError>;

/// Attach a step name to the error of a fallible operation.
pub trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|source| SpyError::Step {
            step,
            source: Box::new(source),
        })
    }
}
