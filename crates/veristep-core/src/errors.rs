use std::path::PathBuf;

/// Failures from the image fingerprinting path.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("unsupported image input: {0}")]
    Unsupported(String),
    #[error("failed to fetch image from {url}: {detail}")]
    Fetch { url: String, detail: String },
    #[error("failed to decode image bytes: {0}")]
    Decode(String),
}

/// Failures from rule and example-case storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },
    #[error("include cycle detected at {path}")]
    IncludeCycle { path: PathBuf },
    #[error("include depth limit ({max}) exceeded at {path}")]
    IncludeDepth { path: PathBuf, max: usize },
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigError: {}", self.0)
    }
}
impl std::error::Error for ConfigError {}
