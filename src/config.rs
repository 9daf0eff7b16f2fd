use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

pub const CONFIG_FILE: &str = "ngff-catalog.json";
pub const DEFAULT_BATCH_WIDTH: usize = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_JITTER_MAX_MS: u64 = 5000;
pub const DEFAULT_TAXONOMY_ENDPOINT: &str = "https://rest.ensembl.org/taxonomy/id";
pub const DEFAULT_ONTOLOGY_ENDPOINT: &str = "https://www.ebi.ac.uk/ols4/api/ontologies";
pub const DEFAULT_STATS_NAMESPACE: &str = "_ome2024_ngff_challenge_stats";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub batch_width: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub jitter: Option<JitterEntry>,
    #[serde(default)]
    pub endpoints: Option<EndpointsEntry>,
    #[serde(default)]
    pub stats_namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct JitterEntry {
    #[serde(default)]
    pub min_ms: Option<u64>,
    #[serde(default)]
    pub max_ms: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EndpointsEntry {
    #[serde(default)]
    pub taxonomy: Option<String>,
    #[serde(default)]
    pub ontology: Option<String>,
}

/// Randomized start delay for external term lookups, with an optional cap
/// on lookups fetching at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterPolicy {
    pub min: Duration,
    pub max: Duration,
    pub seed: Option<u64>,
    pub max_in_flight: Option<usize>,
}

impl JitterPolicy {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
            seed: None,
            max_in_flight: None,
        }
    }
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::from_millis(DEFAULT_JITTER_MAX_MS),
            seed: None,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub taxonomy: String,
    pub ontology: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            taxonomy: DEFAULT_TAXONOMY_ENDPOINT.to_string(),
            ontology: DEFAULT_ONTOLOGY_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub manifest: Option<String>,
    pub batch_width: usize,
    pub timeout: Duration,
    pub jitter: JitterPolicy,
    pub endpoints: Endpoints,
    pub stats_namespace: String,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            manifest: None,
            batch_width: DEFAULT_BATCH_WIDTH,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            jitter: JitterPolicy::default(),
            endpoints: Endpoints::default(),
            stats_namespace: DEFAULT_STATS_NAMESPACE.to_string(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the config from `path`, or from the first of `./ngff-catalog.json`
    /// and the per-user config directory that exists. Falls back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        let config_path = match path {
            Some(path) => {
                let explicit = Utf8PathBuf::from(path);
                if !explicit.as_std_path().exists() {
                    return Err(CatalogError::MissingConfig(explicit.into_std_path_buf()));
                }
                Some(explicit)
            }
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            return Ok(ResolvedConfig::default());
        };

        tracing::debug!(path = %config_path, "reading config");
        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| CatalogError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn discover() -> Option<Utf8PathBuf> {
        let local = Utf8PathBuf::from(CONFIG_FILE);
        if local.as_std_path().exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "ome", "ngff-catalog")
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.config_dir().join(CONFIG_FILE)).ok())
            .filter(|path| path.as_std_path().exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CatalogError> {
        let defaults = ResolvedConfig::default();

        let batch_width = config.batch_width.unwrap_or(defaults.batch_width);
        if batch_width == 0 {
            return Err(CatalogError::InvalidConfig(
                "batch_width must be at least 1".to_string(),
            ));
        }

        let jitter = match config.jitter {
            Some(entry) => {
                let min_ms = entry.min_ms.unwrap_or(0);
                let max_ms = entry.max_ms.unwrap_or(DEFAULT_JITTER_MAX_MS.max(min_ms));
                if min_ms > max_ms {
                    return Err(CatalogError::InvalidConfig(format!(
                        "jitter.min_ms ({min_ms}) exceeds jitter.max_ms ({max_ms})"
                    )));
                }
                if entry.max_in_flight == Some(0) {
                    return Err(CatalogError::InvalidConfig(
                        "jitter.max_in_flight must be at least 1".to_string(),
                    ));
                }
                JitterPolicy {
                    min: Duration::from_millis(min_ms),
                    max: Duration::from_millis(max_ms),
                    seed: entry.seed,
                    max_in_flight: entry.max_in_flight,
                }
            }
            None => defaults.jitter,
        };

        let endpoints = match config.endpoints {
            Some(entry) => Endpoints {
                taxonomy: entry
                    .taxonomy
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.endpoints.taxonomy),
                ontology: entry
                    .ontology
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.endpoints.ontology),
            },
            None => defaults.endpoints,
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            manifest: config.manifest,
            batch_width,
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            jitter,
            endpoints,
            stats_namespace: config
                .stats_namespace
                .unwrap_or(defaults.stats_namespace),
        })
    }
}
