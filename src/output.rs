use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

use crate::catalog::CatalogReport;
use crate::domain::{DatasetRow, format_bytes};
use crate::hierarchy::{ManifestStats, TreeEntry};
use crate::table::{TableObserver, TableUpdate};

#[derive(Debug, Clone, Serialize)]
pub struct LoadOutput {
    pub report: CatalogReport,
    pub summary: Option<SummaryOutput>,
    pub rows: Vec<DatasetRow>,
    pub manifests: Vec<TreeEntry>,
    pub organisms: BTreeMap<String, String>,
    pub modalities: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryOutput {
    pub datasets: u64,
    pub images: u64,
    pub plates: u64,
    pub written: u64,
    pub written_human_readable: String,
}

impl From<ManifestStats> for SummaryOutput {
    fn from(totals: ManifestStats) -> Self {
        Self {
            datasets: totals.item_count,
            images: totals.image_count,
            plates: totals.group_count,
            written: totals.aggregate_bytes,
            written_human_readable: format_bytes(totals.aggregate_bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeOutput {
    pub summary: Option<SummaryOutput>,
    pub manifests: Vec<TreeEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TermsOutput {
    pub organisms: BTreeMap<String, String>,
    pub modalities: BTreeMap<String, String>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_load(result: &LoadOutput) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_tree(result: &TreeOutput) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_terms(result: &TermsOutput) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Reports table updates through `tracing`.
pub struct LogObserver;

impl TableObserver for LogObserver {
    fn table_changed(&self, update: &TableUpdate, _rows: &[DatasetRow]) {
        tracing::debug!(change = ?update.change, rows = update.row_count, "table updated");
    }
}
