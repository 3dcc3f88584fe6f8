#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred with the database connection")]
    Database(#[from] diesel::result::Error),

    #[error("an error occurred getting a database connection")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("an error occurred running a migration")]
    Migration(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("an error occurred parsing the file")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Parsing(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("classifier invocation failed: {0}")]
    Classifier(String),

    #[error("store not found at {0}")]
    StoreNotFound(String),

    #[error("store already exists at {0}")]
    StoreAlreadyExists(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    DateFormat(#[from] chrono::ParseError),

    #[error("invalid archive: could not find {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("schema descriptor invalid: {0}")]
    Schema(String),
}

/// Failures from the external name-resolution or occurrence-download
/// services. Transport failures are retried by [`crate::retry::retry`];
/// these variants are what a caller sees once retries are exhausted.
#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("transport error contacting remote service: {0}")]
    Transport(String),

    #[error("remote service returned no match")]
    NoMatch,

    #[error("occurrence download was killed by the server")]
    DownloadKilled,

    #[error("remote service rejected the request: {0}")]
    Rejected(String),
}
