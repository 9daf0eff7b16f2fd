use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MANIFEST_EXTENSION: &str = ".csv";
pub const DEFAULT_AXES: [&str; 5] = ["t", "c", "z", "y", "x"];
const CHANNEL_AXIS: &str = "c";

pub const FIELD_URL: &str = "url";
pub const FIELD_CSV: &str = "csv";
pub const FIELD_SHAPE: &str = "shape";
pub const FIELD_AXES: &str = "axes";
pub const FIELD_DIM_COUNT: &str = "dim_count";
pub const FIELD_WRITTEN: &str = "written";
pub const FIELD_WELLS: &str = "wells";
pub const FIELD_IMAGES: &str = "images";
pub const FIELD_WELL_COUNT: &str = "well_count";
pub const FIELD_FIELD_COUNT: &str = "field_count";
pub const FIELD_LOADED: &str = "loaded";
pub const FIELD_LOAD_FAILED: &str = "load_failed";

/// One parsed manifest line, keyed by column name.
pub type ManifestRecord = BTreeMap<String, String>;

/// A dataset reference in the catalog table.
///
/// `url` is the row key. Everything else (manifest columns, inherited
/// labels, resolved metadata) lives in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub url: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl DatasetRow {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builds a row from a manifest record. Records without a usable `url`
    /// yield `None`.
    pub fn from_record(record: &ManifestRecord) -> Option<Self> {
        let url = record.get(FIELD_URL).map(|url| url.trim())?;
        if url.is_empty() {
            return None;
        }
        let fields = record
            .iter()
            .filter(|(key, _)| key.as_str() != FIELD_URL)
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        Some(Self {
            url: url.to_string(),
            fields,
        })
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    /// Text form of a cell, `None` when the cell is absent, null or blank.
    pub fn cell_text(&self, column: &str) -> Option<String> {
        if column == FIELD_URL {
            return Some(self.url.clone());
        }
        let text = match self.fields.get(column)? {
            Value::Null => return None,
            Value::String(text) => text.clone(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            other => other.to_string(),
        };
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn shape(&self) -> Option<Vec<u64>> {
        self.fields.get(FIELD_SHAPE).and_then(parse_shape)
    }

    pub fn is_loaded(&self) -> bool {
        self.fields
            .get(FIELD_LOADED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn load_failed(&self) -> bool {
        self.fields
            .get(FIELD_LOAD_FAILED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Shallow merge: every key in `patch` replaces the current value.
    pub fn apply(&mut self, patch: &RowPatch) {
        for (key, value) in &patch.0 {
            if key == FIELD_URL {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

/// A partial update applied to an existing row by URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowPatch(pub BTreeMap<String, Value>);

impl RowPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn extend(&mut self, other: RowPatch) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parses a shape given either as a JSON array or as text such as
/// `"1,2,3"`, `"[1, 2, 3]"` or `"(1 x 2 x 3)"`.
pub fn parse_shape(value: &Value) -> Option<Vec<u64>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Number(n) => n.as_u64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .collect(),
        Value::String(text) => parse_shape_text(text),
        _ => None,
    }
}

fn parse_shape_text(text: &str) -> Option<Vec<u64>> {
    let inner = text
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    if inner.trim().is_empty() {
        return None;
    }
    inner
        .split(|ch: char| ch == ',' || ch == 'x' || ch.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect()
}

/// Parses an axis-name list: `"tczyx"`, `"t,c,z,y,x"` or a JSON array.
pub fn parse_axes(value: &Value) -> Option<Vec<String>> {
    let axes: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(name.clone()),
                Value::Object(map) => map
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Value::String(text) if text.contains([',', ' ']) => text
            .split([',', ' '])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(text) => text.trim().chars().map(|ch| ch.to_string()).collect(),
        _ => return None,
    };
    if axes.is_empty() { None } else { Some(axes) }
}

/// Derives `shape`, `size_<axis>` and `dim_count` fields.
///
/// Per-axis sizes need either explicit axis names of matching length or a
/// 5-entry shape, which follows the `t, c, z, y, x` convention. With named
/// axes `dim_count` counts the non-channel axes longer than 1, otherwise
/// every axis longer than 1.
pub fn shape_fields(shape: &[u64], axes: Option<&[String]>) -> RowPatch {
    let mut patch = RowPatch::new().set(
        FIELD_SHAPE,
        Value::Array(shape.iter().map(|&dim| Value::from(dim)).collect()),
    );

    let names: Option<Vec<String>> = match axes {
        Some(axes) if axes.len() == shape.len() => Some(axes.to_vec()),
        _ if shape.len() == DEFAULT_AXES.len() => {
            Some(DEFAULT_AXES.iter().map(|axis| axis.to_string()).collect())
        }
        _ => None,
    };
    let dim_count = match names {
        Some(names) => {
            for (name, &size) in names.iter().zip(shape) {
                patch.insert(&format!("size_{}", name.to_lowercase()), size);
            }
            names
                .iter()
                .zip(shape)
                .filter(|(name, size)| **size > 1 && !name.eq_ignore_ascii_case(CHANNEL_AXIS))
                .count()
        }
        None => shape.iter().filter(|&&size| size > 1).count(),
    };
    patch.insert(FIELD_DIM_COUNT, dim_count as u64);
    patch
}

pub fn is_manifest_url(url: &str) -> bool {
    url.trim().ends_with(MANIFEST_EXTENSION)
}

/// Lossy numeric read of a manifest cell: absent or unparseable is 0.
pub fn numeric_field(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Human readable byte count: `13.00 KB`, `4.10 MB`, `102 B`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes == 0 {
        return String::new();
    }
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Load status of a manifest node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Pending,
    Loaded,
    Failed,
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestStatus::Pending => write!(f, "pending"),
            ManifestStatus::Loaded => write!(f, "loaded"),
            ManifestStatus::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn shape_text_variants() {
        assert_eq!(parse_shape(&json!("1,2,3")), Some(vec![1, 2, 3]));
        assert_eq!(parse_shape(&json!("[1, 2, 3]")), Some(vec![1, 2, 3]));
        assert_eq!(parse_shape(&json!("(4 x 5)")), Some(vec![4, 5]));
        assert_eq!(parse_shape(&json!([7, 8])), Some(vec![7, 8]));
        assert_eq!(parse_shape(&json!("")), None);
        assert_eq!(parse_shape(&json!("a,b")), None);
    }

    #[test]
    fn five_dimensional_shape_uses_default_axes() {
        let patch = shape_fields(&[1, 2, 3, 256, 256], None);
        assert_eq!(patch.get("size_t"), Some(&json!(1)));
        assert_eq!(patch.get("size_c"), Some(&json!(2)));
        assert_eq!(patch.get("size_x"), Some(&json!(256)));
        assert_eq!(patch.get(FIELD_DIM_COUNT), Some(&json!(3)));
    }

    #[test]
    fn explicit_axes_override_default() {
        let axes = parse_axes(&json!("zyx")).unwrap();
        let patch = shape_fields(&[10, 1, 20], Some(&axes));
        assert_eq!(patch.get("size_z"), Some(&json!(10)));
        assert_eq!(patch.get("size_y"), Some(&json!(1)));
        assert_eq!(patch.get(FIELD_DIM_COUNT), Some(&json!(2)));
        assert!(patch.get("size_t").is_none());
    }

    #[test]
    fn mismatched_axes_without_default_skip_sizes() {
        let axes = vec!["y".to_string(), "x".to_string()];
        let patch = shape_fields(&[3, 4, 5], Some(&axes));
        assert!(patch.get("size_y").is_none());
        assert_eq!(patch.get(FIELD_DIM_COUNT), Some(&json!(3)));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "");
        assert_eq!(format_bytes(102), "102 B");
        assert_eq!(format_bytes(13 * 1024), "13.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn record_without_url_is_skipped() {
        let mut record = ManifestRecord::new();
        record.insert("source".to_string(), "lab".to_string());
        assert!(DatasetRow::from_record(&record).is_none());
        record.insert(FIELD_URL.to_string(), "  ".to_string());
        assert!(DatasetRow::from_record(&record).is_none());
    }
}
