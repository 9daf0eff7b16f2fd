use std::time::Duration;

use assert_matches::assert_matches;

use ngff_catalog::config::{
    Config, ConfigLoader, DEFAULT_ONTOLOGY_ENDPOINT, EndpointsEntry, JitterEntry,
};
use ngff_catalog::error::CatalogError;

#[test]
fn reads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ngff-catalog.json");
    std::fs::write(
        &path,
        r#"{
            "manifest": "https://example.org/samples.csv",
            "batch_width": 3,
            "jitter": {"min_ms": 5, "max_ms": 50, "seed": 11},
            "endpoints": {"taxonomy": "https://taxonomy.test/id/"}
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(
        resolved.manifest.as_deref(),
        Some("https://example.org/samples.csv")
    );
    assert_eq!(resolved.batch_width, 3);
    assert_eq!(resolved.jitter.min, Duration::from_millis(5));
    assert_eq!(resolved.jitter.max, Duration::from_millis(50));
    assert_eq!(resolved.jitter.seed, Some(11));
    assert_eq!(resolved.endpoints.taxonomy, "https://taxonomy.test/id");
    assert_eq!(resolved.endpoints.ontology, DEFAULT_ONTOLOGY_ENDPOINT);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, CatalogError::MissingConfig(_));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ngff-catalog.json");
    std::fs::write(&path, "{ batch_width: ").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, CatalogError::ConfigParse(_));
}

#[test]
fn zero_in_flight_is_rejected() {
    let config = Config {
        jitter: Some(JitterEntry {
            max_in_flight: Some(0),
            ..JitterEntry::default()
        }),
        endpoints: Some(EndpointsEntry::default()),
        ..Config::default()
    };
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, CatalogError::InvalidConfig(_));
}
