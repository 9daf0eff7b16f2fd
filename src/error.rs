use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("{url} returned status {status}")]
    HttpStatus { status: u16, url: String },

    #[error("invalid JSON from {url}: {message}")]
    Json { url: String, message: String },

    #[error("failed to parse manifest {url}: {message}")]
    Csv { url: String, message: String },

    #[error("manifest not found: {0}")]
    #[diagnostic(help("check that the manifest URL is reachable and ends in .csv"))]
    ManifestNotFound(String),

    #[error("no manifest URL given and none configured")]
    MissingManifest,

    #[error("missing config file {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid term identifier: {0}")]
    InvalidTermId(String),
}

impl CatalogError {
    /// Transport-level failures, as opposed to local misuse.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            CatalogError::Http(_)
                | CatalogError::HttpStatus { .. }
                | CatalogError::Json { .. }
                | CatalogError::Csv { .. }
        )
    }
}
