use serde_json::Value;

use crate::config::DEFAULT_STATS_NAMESPACE;
use crate::domain::{
    FIELD_FIELD_COUNT, FIELD_LOAD_FAILED, FIELD_LOADED, FIELD_WELL_COUNT, FIELD_WRITTEN, RowPatch,
    parse_axes, shape_fields,
};
use crate::remote::RemoteSource;

/// Layout indirections followed before giving up on a dataset.
pub const MAX_LAYOUT_HOPS: usize = 4;

pub const FIELD_ORGANISM_ID: &str = "organism_id";
pub const FIELD_MODALITY_ID: &str = "modality_id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_LICENSE: &str = "license";

const ZARR_JSON: &str = "zarr.json";
const RO_CRATE_JSON: &str = "ro-crate-metadata.json";

/// Where the multiscale image of a dataset lives.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayLayout {
    Multiscale {
        descriptor: Value,
        resolved_url: String,
    },
    /// Only the first well is followed; its first image is assumed at `/0`.
    Plate {
        wells: Vec<String>,
        field_count: Option<u64>,
        delegate: Box<ArrayLayout>,
    },
    /// `bioformats2raw` output: the image sits under `/0`.
    ConverterNested { delegate: Box<ArrayLayout> },
    Unresolved,
}

impl ArrayLayout {
    /// The multiscale at the end of the chain, with its URL.
    pub fn multiscale(&self) -> Option<(&Value, &str)> {
        match self {
            ArrayLayout::Multiscale {
                descriptor,
                resolved_url,
            } => Some((descriptor, resolved_url)),
            ArrayLayout::Plate { delegate, .. } | ArrayLayout::ConverterNested { delegate } => {
                delegate.multiscale()
            }
            ArrayLayout::Unresolved => None,
        }
    }

    /// Well and field counts of the outermost plate, if any.
    pub fn plate_counts(&self) -> Option<(u64, Option<u64>)> {
        match self {
            ArrayLayout::Plate {
                wells, field_count, ..
            } => Some((wells.len() as u64, *field_count)),
            ArrayLayout::ConverterNested { delegate } => delegate.plate_counts(),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.multiscale().is_some()
    }
}

/// Array descriptor fields of the highest-resolution level.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMetadata {
    pub shape: Vec<u64>,
    pub axes: Option<Vec<String>>,
    pub written: Option<f64>,
}

pub struct MetadataResolver<'a, S: RemoteSource + ?Sized> {
    source: &'a S,
    stats_namespace: String,
}

impl<'a, S: RemoteSource + ?Sized> MetadataResolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            stats_namespace: DEFAULT_STATS_NAMESPACE.to_string(),
        }
    }

    pub fn with_stats_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.stats_namespace = namespace.into();
        self
    }

    pub fn resolve_array_layout(&self, dataset_url: &str) -> ArrayLayout {
        self.layout_at(dataset_url.trim_end_matches('/'), 0)
    }

    fn layout_at(&self, url: &str, hops: usize) -> ArrayLayout {
        if hops >= MAX_LAYOUT_HOPS {
            tracing::warn!(url, hops, "layout chain too deep");
            return ArrayLayout::Unresolved;
        }

        let Some(ome) = self.probe_ome(url) else {
            return ArrayLayout::Unresolved;
        };

        if let Some(multiscales) = ome.get("multiscales") {
            tracing::debug!(url, "multiscale image");
            return ArrayLayout::Multiscale {
                descriptor: multiscales.clone(),
                resolved_url: url.to_string(),
            };
        }

        if let Some(plate) = ome.get("plate") {
            let wells: Vec<String> = plate
                .get("wells")
                .and_then(Value::as_array)
                .map(|wells| {
                    wells
                        .iter()
                        .filter_map(|well| well.get("path").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let field_count = plate.get("field_count").and_then(Value::as_u64);
            let Some(first) = wells.first() else {
                tracing::warn!(url, "plate without wells");
                return ArrayLayout::Unresolved;
            };
            tracing::debug!(url, well = %first, "plate, following first well");
            let delegate = self.layout_at(&format!("{url}/{first}/0"), hops + 1);
            return ArrayLayout::Plate {
                wells,
                field_count,
                delegate: Box::new(delegate),
            };
        }

        if ome.get("bioformats2raw.layout").is_some() {
            tracing::debug!(url, "bioformats2raw layout");
            let delegate = self.layout_at(&format!("{url}/0"), hops + 1);
            return ArrayLayout::ConverterNested {
                delegate: Box::new(delegate),
            };
        }

        tracing::debug!(url, "no recognized layout marker");
        ArrayLayout::Unresolved
    }

    fn probe_ome(&self, url: &str) -> Option<Value> {
        let probe = format!("{url}/{ZARR_JSON}");
        match self.source.get_json(&probe) {
            Ok(Some(mut document)) => document
                .get_mut("attributes")
                .and_then(|attributes| attributes.get_mut("ome"))
                .map(Value::take),
            Ok(None) => {
                tracing::debug!(url = %probe, "not found");
                None
            }
            Err(err) => {
                tracing::warn!(url = %probe, error = %err, "array probe failed");
                None
            }
        }
    }

    /// Reads shape and stats of the first dataset of the first multiscale.
    pub fn read_array(&self, descriptor: &Value, resolved_url: &str) -> Option<ArrayMetadata> {
        let multiscale = descriptor.get(0)?;
        let path = multiscale
            .get("datasets")
            .and_then(|datasets| datasets.get(0))
            .and_then(|dataset| dataset.get("path"))
            .and_then(Value::as_str)?;
        let axes = multiscale.get("axes").and_then(parse_axes);

        let url = format!("{resolved_url}/{path}/{ZARR_JSON}");
        let array = match self.source.get_json(&url) {
            Ok(Some(array)) => array,
            Ok(None) => {
                tracing::warn!(url, "array descriptor missing");
                return None;
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "array descriptor failed");
                return None;
            }
        };

        let shape = array
            .get("shape")
            .and_then(Value::as_array)
            .map(|dims| dims.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        let written = array
            .get("attributes")
            .and_then(|attributes| attributes.get(&self.stats_namespace))
            .and_then(|stats| stats.get("written"))
            .and_then(Value::as_f64);

        Some(ArrayMetadata {
            shape,
            axes,
            written,
        })
    }

    /// Resolves a dataset into the fields merged onto its table row. Never
    /// fails: unreachable or unrecognized datasets come back as
    /// `load_failed: true, shape: [0]`.
    pub fn resolve_metadata(&self, dataset_url: &str) -> RowPatch {
        let layout = self.resolve_array_layout(dataset_url);
        let array = layout
            .multiscale()
            .and_then(|(descriptor, resolved_url)| self.read_array(descriptor, resolved_url));

        let Some(array) = array else {
            tracing::info!(url = dataset_url, "metadata unresolved");
            let mut patch = shape_fields(&[0], None);
            patch.insert(FIELD_LOAD_FAILED, true);
            patch.insert(FIELD_LOADED, true);
            return patch;
        };

        let mut patch = shape_fields(&array.shape, array.axes.as_deref());
        if let Some(written) = array.written {
            patch.insert(FIELD_WRITTEN, written);
        }
        if let Some((well_count, field_count)) = layout.plate_counts() {
            patch.insert(FIELD_WELL_COUNT, well_count);
            if let Some(field_count) = field_count {
                patch.insert(FIELD_FIELD_COUNT, field_count);
            }
        }
        patch.insert(FIELD_LOAD_FAILED, false);
        patch.insert(FIELD_LOADED, true);
        patch
    }

    /// Reads `ro-crate-metadata.json` next to the dataset. Only fields found
    /// in the document are returned; a missing document is `None`.
    pub fn resolve_provenance(&self, dataset_url: &str) -> Option<RowPatch> {
        let url = format!("{}/{RO_CRATE_JSON}", dataset_url.trim_end_matches('/'));
        let document = match self.source.get_json(&url) {
            Ok(Some(document)) => document,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(url, error = %err, "provenance probe failed");
                return None;
            }
        };
        let patch = provenance_fields(&document);
        if patch.is_empty() { None } else { Some(patch) }
    }
}

/// Extracts organism, imaging modality and dataset labels from an RO-Crate
/// `@graph`.
pub fn provenance_fields(document: &Value) -> RowPatch {
    let mut patch = RowPatch::new();
    let Some(graph) = document.get("@graph").and_then(Value::as_array) else {
        return patch;
    };

    for entity in graph {
        if has_type(entity, "biosample") {
            if let Some(id) = entity.get("organism_classification").and_then(reference) {
                patch.insert(FIELD_ORGANISM_ID, id);
            }
        }
        if has_type(entity, "image_acquisition") {
            if let Some(id) = entity.get("fbbi_id").and_then(reference) {
                patch.insert(FIELD_MODALITY_ID, id);
            }
        }
        if entity.get("@id").and_then(Value::as_str) == Some("./") {
            for key in [FIELD_NAME, FIELD_DESCRIPTION, FIELD_LICENSE] {
                if let Some(value) = entity.get(key).and_then(reference) {
                    patch.insert(key, value);
                }
            }
        }
    }
    patch
}

fn has_type(entity: &Value, wanted: &str) -> bool {
    match entity.get("@type") {
        Some(Value::String(kind)) => kind == wanted,
        Some(Value::Array(kinds)) => kinds.iter().any(|kind| kind.as_str() == Some(wanted)),
        _ => false,
    }
}

/// A plain string, or the `@id` of an inline reference. Blank is `None`.
fn reference(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(map) => map.get("@id").and_then(Value::as_str)?,
        _ => return None,
    };
    let text = text.trim();
    if text.is_empty() { None } else { Some(text.to_string()) }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn provenance_from_graph() {
        let document = json!({
            "@graph": [
                {"@id": "./", "@type": "Dataset", "name": "Fly brain", "license": {"@id": "https://creativecommons.org/licenses/by/4.0/"}},
                {"@id": "#bs", "@type": ["Thing", "biosample"], "organism_classification": {"@id": "NCBI:txid7227"}},
                {"@id": "#ia", "@type": "image_acquisition", "fbbi_id": {"@id": "obo:FBbi_00000246"}},
                {"@id": "#empty", "@type": "biosample", "organism_classification": ""}
            ]
        });
        let patch = provenance_fields(&document);
        assert_eq!(patch.get(FIELD_ORGANISM_ID), Some(&json!("NCBI:txid7227")));
        assert_eq!(patch.get(FIELD_MODALITY_ID), Some(&json!("obo:FBbi_00000246")));
        assert_eq!(patch.get(FIELD_NAME), Some(&json!("Fly brain")));
        assert_eq!(
            patch.get(FIELD_LICENSE),
            Some(&json!("https://creativecommons.org/licenses/by/4.0/"))
        );
        assert!(patch.get(FIELD_DESCRIPTION).is_none());
    }

    #[test]
    fn graph_missing_gives_empty_patch() {
        assert!(provenance_fields(&json!({"name": "x"})).is_empty());
    }

    #[test]
    fn plate_counts_look_through_converter() {
        let layout = ArrayLayout::ConverterNested {
            delegate: Box::new(ArrayLayout::Plate {
                wells: vec!["A/1".to_string(), "A/2".to_string()],
                field_count: Some(4),
                delegate: Box::new(ArrayLayout::Unresolved),
            }),
        };
        assert_eq!(layout.plate_counts(), Some((2, Some(4))));
        assert!(!layout.is_resolved());
    }
}
