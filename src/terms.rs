use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde_json::Value;

use crate::config::{Endpoints, JitterPolicy};
use crate::error::CatalogError;
use crate::remote::RemoteSource;

pub const PENDING_LABEL: &str = "Loading...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Pending,
    Resolved(String),
}

impl CacheEntry {
    pub fn label(&self) -> &str {
        match self {
            CacheEntry::Pending => PENDING_LABEL,
            CacheEntry::Resolved(label) => label,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CacheEntry::Pending)
    }
}

/// One external identifier service.
pub trait TermLookup: Send + Sync {
    /// Normalizes an identifier into the service's lookup key. `None` when
    /// the identifier has no recognized prefix.
    fn lookup_key(&self, identifier: &str) -> Option<String>;

    /// Fetches the display label for a key. `Ok(None)` when the service
    /// answered without a label.
    fn fetch_label(&self, key: &str) -> Result<Option<String>, CatalogError>;
}

static TAXON_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:NCBI:txid|(?:obo:)?NCBITaxon[_:])(\d+)$").expect("valid regex")
});

static ONTOLOGY_TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:obo:)?(FBbi|NCIT|MI|OBI|NCBITaxon)[_:]([A-Za-z]?\d+)$").expect("valid regex")
});

/// Organism names from a taxonomy service, keyed by NCBI taxon number.
pub struct OrganismLookup {
    source: Arc<dyn RemoteSource>,
    endpoint: String,
}

impl OrganismLookup {
    pub fn new(source: Arc<dyn RemoteSource>, endpoint: impl Into<String>) -> Self {
        Self {
            source,
            endpoint: endpoint.into(),
        }
    }
}

impl TermLookup for OrganismLookup {
    fn lookup_key(&self, identifier: &str) -> Option<String> {
        TAXON_ID
            .captures(identifier.trim())
            .map(|caps| caps[1].to_string())
    }

    fn fetch_label(&self, key: &str) -> Result<Option<String>, CatalogError> {
        let url = format!("{}/{key}?content-type=application/json", self.endpoint);
        Ok(self.source.get_json(&url)?.and_then(|json| label_field(&json, "name")))
    }
}

/// Ontology term labels (imaging modality and friends) from an OLS-style
/// service, keyed by CURIE such as `FBbi_00000246`.
pub struct ModalityLookup {
    source: Arc<dyn RemoteSource>,
    endpoint: String,
}

impl ModalityLookup {
    pub fn new(source: Arc<dyn RemoteSource>, endpoint: impl Into<String>) -> Self {
        Self {
            source,
            endpoint: endpoint.into(),
        }
    }
}

impl TermLookup for ModalityLookup {
    fn lookup_key(&self, identifier: &str) -> Option<String> {
        ONTOLOGY_TERM
            .captures(identifier.trim())
            .map(|caps| format!("{}_{}", &caps[1], &caps[2]))
    }

    fn fetch_label(&self, key: &str) -> Result<Option<String>, CatalogError> {
        let ontology = key
            .split_once('_')
            .map(|(ontology, _)| ontology.to_lowercase())
            .ok_or_else(|| CatalogError::InvalidTermId(key.to_string()))?;
        // OLS expects the term IRI url-encoded twice.
        let url = format!(
            "{}/{ontology}/terms/http%253A%252F%252Fpurl.obolibrary.org%252Fobo%252F{key}",
            self.endpoint
        );
        Ok(self.source.get_json(&url)?.and_then(|json| label_field(&json, "label")))
    }
}

fn label_field(json: &Value, field: &str) -> Option<String> {
    json.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

pub fn organism_lookup(source: Arc<dyn RemoteSource>, endpoints: &Endpoints) -> OrganismLookup {
    OrganismLookup::new(source, endpoints.taxonomy.clone())
}

pub fn modality_lookup(source: Arc<dyn RemoteSource>, endpoints: &Endpoints) -> ModalityLookup {
    ModalityLookup::new(source, endpoints.ontology.clone())
}

struct Jitter {
    min: Duration,
    max: Duration,
    rng: Mutex<StdRng>,
}

impl Jitter {
    fn new(policy: &JitterPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            min: policy.min,
            max: policy.max.max(policy.min),
            rng: Mutex::new(rng),
        }
    }

    fn next_delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let millis = rng.random_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(millis as u64)
    }
}

/// Caps the number of lookups fetching at once.
struct Slots {
    limit: Option<usize>,
    used: Mutex<usize>,
    freed: Condvar,
}

impl Slots {
    fn acquire(&self) -> SlotGuard<'_> {
        if let Some(limit) = self.limit {
            let mut used = self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            while *used >= limit {
                used = self
                    .freed
                    .wait(used)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            *used += 1;
        }
        SlotGuard(self)
    }
}

struct SlotGuard<'a>(&'a Slots);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.0.limit.is_some() {
            let mut used = self.0.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *used = used.saturating_sub(1);
            self.0.freed.notify_one();
        }
    }
}

/// Lookups started by one `add_terms` call.
#[must_use = "dropping the handle detaches the lookups"]
pub struct PendingLookups {
    handles: Vec<JoinHandle<()>>,
}

impl PendingLookups {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Blocks until every lookup has written its final entry.
    pub fn wait(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

struct Inner<L> {
    lookup: L,
    entries: Mutex<HashMap<String, CacheEntry>>,
    jitter: Jitter,
    slots: Slots,
}

impl<L> Inner<L> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Memoizing single-flight resolver for external identifiers.
///
/// Each identifier goes absent -> pending -> resolved exactly once. The
/// pending entry is written before any lookup is scheduled, so repeated
/// requests for the same identifier never reach the service twice. Lookup
/// failures resolve to the identifier itself.
pub struct TermCache<L: TermLookup + 'static> {
    inner: Arc<Inner<L>>,
}

impl<L: TermLookup + 'static> Clone for TermCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: TermLookup + 'static> TermCache<L> {
    pub fn new(lookup: L, policy: JitterPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                lookup,
                entries: Mutex::new(HashMap::new()),
                jitter: Jitter::new(&policy),
                slots: Slots {
                    limit: policy.max_in_flight,
                    used: Mutex::new(0),
                    freed: Condvar::new(),
                },
            }),
        }
    }

    pub fn add_terms<I, T>(&self, identifiers: I) -> PendingLookups
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        {
            let mut entries = self.inner.entries();
            for identifier in identifiers {
                let identifier = identifier.as_ref().trim();
                if identifier.is_empty() || !seen.insert(identifier.to_string()) {
                    continue;
                }
                if entries.contains_key(identifier) {
                    continue;
                }
                entries.insert(identifier.to_string(), CacheEntry::Pending);
                fresh.push(identifier.to_string());
            }
        }

        let handles = fresh
            .into_iter()
            .map(|identifier| {
                let delay = self.inner.jitter.next_delay();
                let inner = Arc::clone(&self.inner);
                thread::spawn(move || {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    let label = {
                        let _slot = inner.slots.acquire();
                        resolve(&inner.lookup, &identifier)
                    };
                    inner
                        .entries()
                        .insert(identifier, CacheEntry::Resolved(label));
                })
            })
            .collect();
        PendingLookups { handles }
    }

    pub fn get(&self, identifier: &str) -> Option<CacheEntry> {
        self.inner.entries().get(identifier).cloned()
    }

    /// Display label: resolved label, the pending placeholder, or `None`
    /// for identifiers never added.
    pub fn label(&self, identifier: &str) -> Option<String> {
        self.get(identifier).map(|entry| entry.label().to_string())
    }

    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.inner
            .entries()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .entries()
            .values()
            .filter(|entry| entry.is_pending())
            .count()
    }
}

fn resolve<L: TermLookup>(lookup: &L, identifier: &str) -> String {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Some(key) = lookup.lookup_key(identifier) else {
            tracing::debug!(identifier, "unrecognized identifier prefix");
            return Ok(None);
        };
        lookup.fetch_label(&key)
    }));
    match outcome {
        Ok(Ok(Some(label))) => {
            tracing::debug!(identifier, %label, "term resolved");
            label
        }
        Ok(Ok(None)) => {
            tracing::info!(identifier, "no label returned");
            identifier.to_string()
        }
        Ok(Err(err)) => {
            tracing::warn!(identifier, error = %err, "term lookup failed");
            identifier.to_string()
        }
        Err(_) => {
            tracing::warn!(identifier, "term lookup panicked");
            identifier.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Freshness;

    struct NoSource;

    impl RemoteSource for NoSource {
        fn get_text(&self, url: &str, _: Freshness) -> Result<Option<String>, CatalogError> {
            Err(CatalogError::Http(format!("offline: {url}")))
        }
    }

    #[test]
    fn organism_prefixes() {
        let lookup = OrganismLookup::new(Arc::new(NoSource), "http://taxonomy");
        assert_eq!(lookup.lookup_key("NCBI:txid9606").as_deref(), Some("9606"));
        assert_eq!(lookup.lookup_key("obo:NCBITaxon_10090").as_deref(), Some("10090"));
        assert_eq!(lookup.lookup_key("NCBITaxon:7227").as_deref(), Some("7227"));
        assert_eq!(lookup.lookup_key("Homo sapiens"), None);
    }

    #[test]
    fn modality_prefixes() {
        let lookup = ModalityLookup::new(Arc::new(NoSource), "http://ols");
        assert_eq!(lookup.lookup_key("obo:FBbi_00000246").as_deref(), Some("FBbi_00000246"));
        assert_eq!(lookup.lookup_key("FBbi:00000369").as_deref(), Some("FBbi_00000369"));
        assert_eq!(lookup.lookup_key("obo:FBbi:00000369").as_deref(), Some("FBbi_00000369"));
        assert_eq!(lookup.lookup_key("NCIT_C17753").as_deref(), Some("NCIT_C17753"));
        assert_eq!(lookup.lookup_key("obo:MI_0410").as_deref(), Some("MI_0410"));
        assert_eq!(lookup.lookup_key("obo:OBI_0001501").as_deref(), Some("OBI_0001501"));
        assert_eq!(lookup.lookup_key("confocal"), None);
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let policy = JitterPolicy {
            min: Duration::from_millis(10),
            max: Duration::from_millis(500),
            seed: Some(7),
            max_in_flight: None,
        };
        let a = Jitter::new(&policy);
        let b = Jitter::new(&policy);
        for _ in 0..5 {
            let delay = a.next_delay();
            assert_eq!(delay, b.next_delay());
            assert!(delay >= policy.min && delay <= policy.max);
        }
    }

    #[test]
    fn network_failure_falls_back_to_identifier() {
        let cache = TermCache::new(
            OrganismLookup::new(Arc::new(NoSource), "http://taxonomy"),
            JitterPolicy::none(),
        );
        cache.add_terms(["NCBI:txid9606", "", "  "]).wait();
        assert_eq!(
            cache.get("NCBI:txid9606"),
            Some(CacheEntry::Resolved("NCBI:txid9606".to_string()))
        );
        assert_eq!(cache.snapshot().len(), 1);
    }
}
