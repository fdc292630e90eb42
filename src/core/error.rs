use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StackError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No match for single-result fetch on '{0}'")]
    NotFound(String),

    #[error("Unsupported predicate shape: {0}")]
    UnsupportedPredicateShape(String),

    #[error("Cannot resolve key path '{0}': no attribute or relationship '{1}' on entity '{2}'")]
    SchemaResolution(String, String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution lane closed: {0}")]
    LaneClosed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StackError {
    /// `NotFound` is the one recoverable fetch failure; callers catch it to
    /// implement fetch-or-create fallbacks.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Store file corrupt: {0}")]
    Corrupt(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Incompatible store already mounted: {0}")]
    IncompatibleStore(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),
}

impl StoreError {
    /// The recognized incompatible-schema error class. Only this class is
    /// eligible for the one-shot reset-on-failure path at store-open time.
    pub fn is_schema_incompatibility(&self) -> bool {
        matches!(self, Self::SchemaMismatch(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StackError>;
