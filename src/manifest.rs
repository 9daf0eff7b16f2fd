use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::domain::{DatasetRow, FIELD_CSV, FIELD_URL, ManifestRecord, is_manifest_url};
use crate::error::CatalogError;
use crate::hierarchy::{ChildRef, ManifestStats, SharedHierarchy};
use crate::remote::{Freshness, RemoteSource};
use crate::table::SharedTable;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub manifests_loaded: Vec<String>,
    pub manifests_failed: Vec<FailedManifest>,
    /// URLs newly appended to the table, in append order.
    pub dataset_urls: Vec<String>,
    /// Rows dropped because their URL was already listed, in the same
    /// manifest or an earlier one.
    pub duplicates_dropped: usize,
    /// Rows without a URL.
    pub rows_skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedManifest {
    pub url: String,
    pub reason: String,
}

/// A manifest split into its dataset rows and child manifest references.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedManifest {
    pub datasets: Vec<DatasetRow>,
    pub children: Vec<ChildRef>,
    pub duplicates: Vec<String>,
    pub skipped: usize,
}

/// Walks a manifest tree, feeding dataset rows to the table and manifest
/// nodes to the hierarchy.
pub struct ManifestLoader<'a, S: RemoteSource + ?Sized> {
    source: &'a S,
    table: &'a SharedTable,
    hierarchy: &'a SharedHierarchy,
}

impl<'a, S: RemoteSource + ?Sized> ManifestLoader<'a, S> {
    pub fn new(source: &'a S, table: &'a SharedTable, hierarchy: &'a SharedHierarchy) -> Self {
        Self {
            source,
            table,
            hierarchy,
        }
    }

    /// Loads `url` and every manifest below it. Only a failure of `url`
    /// itself is returned as an error; failed descendants are recorded in
    /// the report and marked in the hierarchy.
    pub fn load(
        &self,
        url: &str,
        inherited: BTreeMap<String, String>,
    ) -> Result<LoadReport, CatalogError> {
        let mut report = LoadReport::default();
        let children = self.load_one(url, None, inherited, &mut report)?;
        self.load_children(url, children, &mut report);
        Ok(report)
    }

    fn load_children(&self, parent: &str, children: Vec<ChildRef>, report: &mut LoadReport) {
        for child in children {
            match self.load_one(&child.url, Some(parent), child.inherited, report) {
                Ok(grandchildren) => self.load_children(&child.url, grandchildren, report),
                Err(err) => {
                    tracing::warn!(
                        manifest = %child.url,
                        parent,
                        error = %err,
                        "child manifest failed"
                    );
                    self.hierarchy.lock().mark_failed(&child.url);
                    report.manifests_failed.push(FailedManifest {
                        url: child.url,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn load_one(
        &self,
        url: &str,
        parent: Option<&str>,
        inherited: BTreeMap<String, String>,
        report: &mut LoadReport,
    ) -> Result<Vec<ChildRef>, CatalogError> {
        let body = self
            .source
            .get_text(url, Freshness::Revalidate)?
            .ok_or_else(|| CatalogError::ManifestNotFound(url.to_string()))?;
        let records = parse_manifest(&body, &inherited).map_err(|err| CatalogError::Csv {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let classified = classify(records);
        for duplicate in &classified.duplicates {
            tracing::warn!(manifest = url, dataset = %duplicate, "duplicate dataset row dropped");
        }
        if classified.skipped > 0 {
            tracing::warn!(
                manifest = url,
                rows = classified.skipped,
                "rows without a url skipped"
            );
        }

        let stats = ManifestStats::from_rows(&classified.datasets);
        let attached = self.hierarchy.lock().register(
            url,
            parent,
            inherited,
            stats,
            classified.children,
        );
        let offered = classified.datasets.len();
        let added = self.table.append(classified.datasets);

        tracing::info!(
            manifest = url,
            datasets = added.len(),
            children = attached.len(),
            "manifest loaded"
        );
        report.manifests_loaded.push(url.to_string());
        report.duplicates_dropped += classified.duplicates.len() + (offered - added.len());
        report.rows_skipped += classified.skipped;
        report.dataset_urls.extend(added);
        Ok(attached)
    }
}

/// Parses manifest text into records seeded with `inherited`.
///
/// A first line with a single field means the manifest is a bare list of
/// URLs; otherwise the first line is the header.
pub fn parse_manifest(
    text: &str,
    inherited: &BTreeMap<String, String>,
) -> Result<Vec<ManifestRecord>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut lines = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        lines.push(record);
    }

    let Some(first) = lines.first() else {
        return Ok(Vec::new());
    };

    let (columns, body) = if first.len() == 1 {
        let skip_header = first.get(0) == Some(FIELD_URL);
        (
            vec![FIELD_URL.to_string()],
            &lines[usize::from(skip_header)..],
        )
    } else {
        (
            first.iter().map(str::to_string).collect::<Vec<_>>(),
            &lines[1..],
        )
    };

    Ok(body
        .iter()
        .map(|line| {
            let mut record = inherited.clone();
            for (column, value) in columns.iter().zip(line.iter()) {
                record.insert(column.clone(), value.to_string());
            }
            record
        })
        .collect())
}

/// Splits records into deduplicated dataset rows and child manifests.
pub fn classify(records: Vec<ManifestRecord>) -> ClassifiedManifest {
    let mut classified = ClassifiedManifest::default();
    let mut seen = HashSet::new();

    for mut record in records {
        let url = record
            .get(FIELD_URL)
            .map(|url| url.trim().to_string())
            .unwrap_or_default();
        if url.is_empty() {
            classified.skipped += 1;
            continue;
        }

        if is_manifest_url(&url) {
            record.remove(FIELD_URL);
            record.insert(FIELD_CSV.to_string(), url.clone());
            classified.children.push(ChildRef {
                url,
                inherited: record,
            });
            continue;
        }

        if !seen.insert(url.clone()) {
            classified.duplicates.push(url);
            continue;
        }
        if let Some(row) = DatasetRow::from_record(&record) {
            classified.datasets.push(row);
        }
    }
    classified
}
