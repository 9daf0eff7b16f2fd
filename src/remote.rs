use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue, PRAGMA, USER_AGENT};
use serde_json::Value;

use crate::error::CatalogError;

/// Whether a fetch may be answered from an intermediary cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Cached,
    Revalidate,
}

/// Read access to remote manifests, array stores and lookup services.
///
/// `Ok(None)` is reserved for HTTP 404: callers treat it as "absent"
/// rather than as a protocol failure.
pub trait RemoteSource: Send + Sync {
    fn get_text(&self, url: &str, freshness: Freshness) -> Result<Option<String>, CatalogError>;

    fn get_json(&self, url: &str) -> Result<Option<Value>, CatalogError> {
        let Some(body) = self.get_text(url, Freshness::Cached)? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|err| CatalogError::Json {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ngff-catalog/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CatalogError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| CatalogError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl RemoteSource for HttpSource {
    fn get_text(&self, url: &str, freshness: Freshness) -> Result<Option<String>, CatalogError> {
        tracing::debug!(url, ?freshness, "GET");
        let mut request = self.client.get(url);
        if freshness == Freshness::Revalidate {
            request = request
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache");
        }
        let response = request
            .send()
            .map_err(|err| CatalogError::Http(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        response
            .text()
            .map(Some)
            .map_err(|err| CatalogError::Http(err.to_string()))
    }
}
