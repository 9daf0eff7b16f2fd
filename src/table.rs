use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::domain::{DatasetRow, FIELD_AXES, FIELD_LOADED, RowPatch, parse_axes, shape_fields};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableChange {
    Appended { count: usize },
    Merged { url: String, found: bool },
    Sorted { column: String, ascending: bool },
    Reset,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableUpdate {
    pub change: TableChange,
    pub row_count: usize,
}

/// Receives one update per table operation, after the operation completed.
pub trait TableObserver: Send + Sync {
    fn table_changed(&self, update: &TableUpdate, rows: &[DatasetRow]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Numeric,
    Text,
}

#[derive(Default)]
pub struct TableStore {
    rows: Vec<DatasetRow>,
    urls: HashSet<String>,
    sort: Option<(String, bool)>,
    observers: Vec<Arc<dyn TableObserver>>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn TableObserver>) {
        self.observers.push(observer);
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&DatasetRow> {
        self.rows.iter().find(|row| row.url == url)
    }

    pub fn sort_key(&self) -> Option<(&str, bool)> {
        self.sort
            .as_ref()
            .map(|(column, ascending)| (column.as_str(), *ascending))
    }

    /// Normalizes and appends rows in input order. A row whose URL is already
    /// in the table is dropped. Returns the URLs that were added.
    pub fn append(&mut self, rows: Vec<DatasetRow>) -> Vec<String> {
        let mut added = Vec::with_capacity(rows.len());
        for row in rows {
            if self.urls.contains(&row.url) {
                tracing::warn!(url = %row.url, "dataset already in table, dropping");
                continue;
            }
            let row = normalize(row);
            self.urls.insert(row.url.clone());
            added.push(row.url.clone());
            self.rows.push(row);
        }
        self.publish(TableChange::Appended { count: added.len() });
        added
    }

    /// Shallow-merges `patch` over the row keyed by `url`, keeping its
    /// position. Unknown URLs are ignored.
    pub fn merge_update(&mut self, url: &str, patch: &RowPatch) -> bool {
        let found = match self.rows.iter_mut().find(|row| row.url == url) {
            Some(row) => {
                row.apply(patch);
                true
            }
            None => {
                tracing::debug!(url, "merge for unknown row ignored");
                false
            }
        };
        self.publish(TableChange::Merged {
            url: url.to_string(),
            found,
        });
        found
    }

    /// Stable sort by `column`.
    ///
    /// The column is numeric when the first non-empty value, in current row
    /// order, parses as a number; the decision holds for the whole pass.
    /// Missing values count as 0 in numeric columns and as "" in text
    /// columns, as do unparseable values in a numeric column.
    pub fn sort(&mut self, column: &str, ascending: bool) {
        let kind = self.column_kind(column);
        match kind {
            ColumnKind::Numeric => {
                let mut keyed: Vec<(f64, DatasetRow)> = self
                    .rows
                    .drain(..)
                    .map(|row| (numeric_key(&row, column), row))
                    .collect();
                keyed.sort_by(|a, b| directed(a.0.total_cmp(&b.0), ascending));
                self.rows = keyed.into_iter().map(|(_, row)| row).collect();
            }
            ColumnKind::Text => {
                let mut keyed: Vec<(String, DatasetRow)> = self
                    .rows
                    .drain(..)
                    .map(|row| (row.cell_text(column).unwrap_or_default(), row))
                    .collect();
                keyed.sort_by(|a, b| directed(a.0.cmp(&b.0), ascending));
                self.rows = keyed.into_iter().map(|(_, row)| row).collect();
            }
        }
        self.sort = Some((column.to_string(), ascending));
        self.publish(TableChange::Sorted {
            column: column.to_string(),
            ascending,
        });
    }

    pub fn reset(&mut self) {
        self.rows.clear();
        self.urls.clear();
        self.sort = None;
        self.publish(TableChange::Reset);
    }

    fn column_kind(&self, column: &str) -> ColumnKind {
        let first = self.rows.iter().find_map(|row| row.cell_text(column));
        match first {
            Some(text) if parse_number(&text).is_some() => ColumnKind::Numeric,
            _ => ColumnKind::Text,
        }
    }

    fn publish(&self, change: TableChange) {
        let update = TableUpdate {
            change,
            row_count: self.rows.len(),
        };
        for observer in &self.observers {
            observer.table_changed(&update, &self.rows);
        }
    }
}

fn normalize(mut row: DatasetRow) -> DatasetRow {
    if let Some(shape) = row.shape() {
        let axes = row.get(FIELD_AXES).and_then(parse_axes);
        row.apply(&shape_fields(&shape, axes.as_deref()));
    }
    row.fields
        .entry(FIELD_LOADED.to_string())
        .or_insert(serde_json::Value::Bool(false));
    row
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|value| !value.is_nan())
}

fn numeric_key(row: &DatasetRow, column: &str) -> f64 {
    row.cell_text(column)
        .and_then(|text| parse_number(&text))
        .unwrap_or(0.0)
}

fn directed(ordering: Ordering, ascending: bool) -> Ordering {
    if ascending { ordering } else { ordering.reverse() }
}

/// Handle shared between the loader, the batch driver and readers. Every
/// operation holds the lock for its full read-modify-write.
#[derive(Clone, Default)]
pub struct SharedTable(Arc<Mutex<TableStore>>);

impl SharedTable {
    pub fn new(store: TableStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn lock(&self) -> MutexGuard<'_, TableStore> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, observer: Arc<dyn TableObserver>) {
        self.lock().subscribe(observer);
    }

    pub fn append(&self, rows: Vec<DatasetRow>) -> Vec<String> {
        self.lock().append(rows)
    }

    pub fn merge_update(&self, url: &str, patch: &RowPatch) -> bool {
        self.lock().merge_update(url, patch)
    }

    pub fn sort(&self, column: &str, ascending: bool) {
        self.lock().sort(column, ascending);
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn snapshot(&self) -> Vec<DatasetRow> {
        self.lock().rows().to_vec()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
