use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ngff_catalog::config::JitterPolicy;
use ngff_catalog::error::CatalogError;
use ngff_catalog::remote::{Freshness, RemoteSource};
use ngff_catalog::terms::{CacheEntry, OrganismLookup, PENDING_LABEL, TermCache, TermLookup};

/// Lookup that answers only when the test releases it.
struct GatedLookup {
    calls: AtomicUsize,
    gate: Mutex<Receiver<()>>,
    reply: Result<Option<String>, String>,
}

impl GatedLookup {
    fn new(reply: Result<Option<String>, String>) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        (
            Self {
                calls: AtomicUsize::new(0),
                gate: Mutex::new(rx),
                reply,
            },
            tx,
        )
    }
}

impl TermLookup for GatedLookup {
    fn lookup_key(&self, identifier: &str) -> Option<String> {
        identifier
            .strip_prefix("NCBI:txid")
            .map(str::to_string)
    }

    fn fetch_label(&self, _key: &str) -> Result<Option<String>, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.gate.lock().unwrap().recv();
        self.reply.clone().map_err(CatalogError::Http)
    }
}

struct TaxonomySource {
    requests: Mutex<Vec<String>>,
}

impl RemoteSource for TaxonomySource {
    fn get_text(&self, url: &str, _: Freshness) -> Result<Option<String>, CatalogError> {
        self.requests.lock().unwrap().push(url.to_string());
        if url.contains("/9606?") {
            Ok(Some(r#"{"name": "Homo sapiens"}"#.to_string()))
        } else if url.contains("/10090?") {
            Ok(Some(r#"{"id": "10090"}"#.to_string()))
        } else {
            Ok(None)
        }
    }
}

#[test]
fn pending_until_resolved_then_label() {
    let (lookup, release) = GatedLookup::new(Ok(Some("Homo sapiens".to_string())));
    let cache = TermCache::new(lookup, JitterPolicy::none());

    let pending = cache.add_terms(["NCBI:txid9606"]);
    assert_eq!(cache.get("NCBI:txid9606"), Some(CacheEntry::Pending));
    assert_eq!(cache.label("NCBI:txid9606").as_deref(), Some(PENDING_LABEL));

    release.send(()).unwrap();
    pending.wait();
    assert_eq!(
        cache.get("NCBI:txid9606"),
        Some(CacheEntry::Resolved("Homo sapiens".to_string()))
    );
}

#[test]
fn repeated_identifier_is_fetched_once() {
    let (lookup, release) = GatedLookup::new(Ok(Some("Homo sapiens".to_string())));
    let lookup_calls = Arc::new(lookup);
    let cache = TermCache::new(Shared(Arc::clone(&lookup_calls)), JitterPolicy::none());

    let first = cache.add_terms(["NCBI:txid9606", "NCBI:txid9606", "NCBI:txid9606"]);
    let callers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || cache.add_terms(["NCBI:txid9606"]))
        })
        .collect();
    let later: Vec<_> = callers
        .into_iter()
        .map(|caller| caller.join().unwrap())
        .collect();

    assert_eq!(first.len(), 1);
    assert!(later.iter().all(|pending| pending.is_empty()));

    release.send(()).unwrap();
    first.wait();
    for pending in later {
        pending.wait();
    }
    assert_eq!(lookup_calls.calls.load(Ordering::SeqCst), 1);

    let again = cache.add_terms(["NCBI:txid9606"]);
    assert!(again.is_empty());
}

#[test]
fn service_error_falls_back_to_identifier() {
    let (lookup, release) = GatedLookup::new(Err("503".to_string()));
    let cache = TermCache::new(lookup, JitterPolicy::none());
    let pending = cache.add_terms(["NCBI:txid1"]);
    release.send(()).unwrap();
    pending.wait();
    assert_eq!(cache.label("NCBI:txid1").as_deref(), Some("NCBI:txid1"));
}

#[test]
fn missing_label_falls_back_to_identifier() {
    let source = Arc::new(TaxonomySource {
        requests: Mutex::new(Vec::new()),
    });
    let cache = TermCache::new(
        OrganismLookup::new(source.clone(), "https://taxonomy.test/id"),
        JitterPolicy::none(),
    );

    cache
        .add_terms(["NCBI:txid9606", "obo:NCBITaxon_10090", "NCBI:txid42", "mouse"])
        .wait();

    assert_eq!(cache.label("NCBI:txid9606").as_deref(), Some("Homo sapiens"));
    assert_eq!(
        cache.label("obo:NCBITaxon_10090").as_deref(),
        Some("obo:NCBITaxon_10090")
    );
    assert_eq!(cache.label("NCBI:txid42").as_deref(), Some("NCBI:txid42"));
    assert_eq!(cache.label("mouse").as_deref(), Some("mouse"));
    assert_eq!(cache.pending_count(), 0);

    let requests = source.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(
        requests.contains(&"https://taxonomy.test/id/9606?content-type=application/json".to_string())
    );
}

#[test]
fn jitter_delays_lookup_start() {
    let source = Arc::new(TaxonomySource {
        requests: Mutex::new(Vec::new()),
    });
    let policy = JitterPolicy {
        min: Duration::from_millis(40),
        max: Duration::from_millis(60),
        seed: Some(1),
        max_in_flight: Some(1),
    };
    let cache = TermCache::new(OrganismLookup::new(source, "https://taxonomy.test/id"), policy);

    let started = Instant::now();
    let pending = cache.add_terms(["NCBI:txid9606", "NCBI:txid10090"]);
    assert_eq!(cache.pending_count(), 2);
    pending.wait();
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(cache.pending_count(), 0);
}

struct Shared(Arc<GatedLookup>);

impl TermLookup for Shared {
    fn lookup_key(&self, identifier: &str) -> Option<String> {
        self.0.lookup_key(identifier)
    }

    fn fetch_label(&self, key: &str) -> Result<Option<String>, CatalogError> {
        self.0.fetch_label(key)
    }
}

struct PanickingKey;

impl TermLookup for PanickingKey {
    fn lookup_key(&self, identifier: &str) -> Option<String> {
        panic!("malformed identifier {identifier}");
    }

    fn fetch_label(&self, _key: &str) -> Result<Option<String>, CatalogError> {
        Ok(Some("unreachable".to_string()))
    }
}

#[test]
fn panicking_key_parse_still_settles() {
    let cache = TermCache::new(PanickingKey, JitterPolicy::none());
    cache.add_terms(["NCBI:txid9606"]).wait();
    assert_eq!(cache.label("NCBI:txid9606").as_deref(), Some("NCBI:txid9606"));
    assert_eq!(cache.pending_count(), 0);
}
