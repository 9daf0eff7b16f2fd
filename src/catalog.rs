use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::batch::{BatchDriver, BatchSummary};
use crate::config::ResolvedConfig;
use crate::error::CatalogError;
use crate::hierarchy::SharedHierarchy;
use crate::manifest::{LoadReport, ManifestLoader};
use crate::remote::RemoteSource;
use crate::resolver::{FIELD_MODALITY_ID, FIELD_ORGANISM_ID, MetadataResolver};
use crate::table::SharedTable;
use crate::terms::{
    ModalityLookup, OrganismLookup, PendingLookups, TermCache, modality_lookup, organism_lookup,
};

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub metadata: bool,
    pub provenance: bool,
    pub terms: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            metadata: true,
            provenance: true,
            terms: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogReport {
    pub manifests: LoadReport,
    pub metadata: Option<BatchCounts>,
    pub provenance: Option<BatchCounts>,
    pub organism_lookups: usize,
    pub modality_lookups: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchCounts {
    pub batches: usize,
    pub completed: usize,
    pub failed: usize,
}

impl From<BatchSummary> for BatchCounts {
    fn from(summary: BatchSummary) -> Self {
        Self {
            batches: summary.batches,
            completed: summary.completed,
            failed: summary.failed,
        }
    }
}

/// Everything one browsing session shares: the table, the manifest tree and
/// the term caches. Built once and handed to whoever needs them.
pub struct Catalog {
    source: Arc<dyn RemoteSource>,
    config: ResolvedConfig,
    table: SharedTable,
    hierarchy: SharedHierarchy,
    organisms: TermCache<OrganismLookup>,
    modalities: TermCache<ModalityLookup>,
    lookups: Mutex<Vec<PendingLookups>>,
}

impl Catalog {
    pub fn new(source: Arc<dyn RemoteSource>, config: ResolvedConfig) -> Self {
        let organisms = TermCache::new(
            organism_lookup(Arc::clone(&source), &config.endpoints),
            config.jitter,
        );
        let modalities = TermCache::new(
            modality_lookup(Arc::clone(&source), &config.endpoints),
            config.jitter,
        );
        Self {
            source,
            config,
            table: SharedTable::default(),
            hierarchy: SharedHierarchy::default(),
            organisms,
            modalities,
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    pub fn hierarchy(&self) -> &SharedHierarchy {
        &self.hierarchy
    }

    pub fn organisms(&self) -> &TermCache<OrganismLookup> {
        &self.organisms
    }

    pub fn modalities(&self) -> &TermCache<ModalityLookup> {
        &self.modalities
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Loads the manifest tree under `root_url`, then resolves array
    /// metadata and provenance for every new row and schedules term lookups.
    ///
    /// Only a failure to load `root_url` itself is an error.
    pub fn load(
        &self,
        root_url: &str,
        options: LoadOptions,
    ) -> Result<CatalogReport, CatalogError> {
        let loader = ManifestLoader::new(self.source.as_ref(), &self.table, &self.hierarchy);
        let manifests = loader.load(root_url, BTreeMap::new())?;
        let urls = manifests.dataset_urls.clone();

        let mut report = CatalogReport {
            manifests,
            ..CatalogReport::default()
        };

        let driver = BatchDriver::new(self.config.batch_width);
        let resolver = MetadataResolver::new(self.source.as_ref())
            .with_stats_namespace(self.config.stats_namespace.clone());

        if options.metadata {
            let summary = driver.run(&urls, |url| -> Result<(), CatalogError> {
                let patch = resolver.resolve_metadata(url);
                self.table.merge_update(url, &patch);
                Ok(())
            });
            tracing::info!(rows = urls.len(), failed = summary.failed, "array metadata resolved");
            report.metadata = Some(summary.into());
        }

        if options.provenance {
            let summary = driver.run(&urls, |url| -> Result<(), CatalogError> {
                if let Some(patch) = resolver.resolve_provenance(url) {
                    self.table.merge_update(url, &patch);
                }
                Ok(())
            });
            tracing::info!(rows = urls.len(), "provenance resolved");
            report.provenance = Some(summary.into());
        }

        if options.terms {
            let (organisms, modalities) = self.term_ids(&urls);
            let organism_lookups = self.organisms.add_terms(&organisms);
            let modality_lookups = self.modalities.add_terms(&modalities);
            report.organism_lookups = organism_lookups.len();
            report.modality_lookups = modality_lookups.len();
            let mut lookups = self.lookups.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            lookups.push(organism_lookups);
            lookups.push(modality_lookups);
        }

        Ok(report)
    }

    /// Drops every row and manifest node and loads `root_url` again from
    /// the network. Resolved term labels are kept.
    pub fn reload(
        &self,
        root_url: &str,
        options: LoadOptions,
    ) -> Result<CatalogReport, CatalogError> {
        self.table.reset();
        self.hierarchy.lock().clear();
        self.load(root_url, options)
    }

    /// Blocks until every scheduled term lookup has settled.
    pub fn wait_for_terms(&self) {
        let pending: Vec<PendingLookups> = {
            let mut lookups = self.lookups.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            lookups.drain(..).collect()
        };
        for lookups in pending {
            lookups.wait();
        }
    }

    fn term_ids(&self, urls: &[String]) -> (BTreeSet<String>, BTreeSet<String>) {
        let table = self.table.lock();
        let mut organisms = BTreeSet::new();
        let mut modalities = BTreeSet::new();
        for url in urls {
            let Some(row) = table.get(url) else {
                continue;
            };
            if let Some(id) = row.get_str(FIELD_ORGANISM_ID) {
                organisms.insert(id.to_string());
            }
            if let Some(id) = row.get_str(FIELD_MODALITY_ID) {
                modalities.insert(id.to_string());
            }
        }
        (organisms, modalities)
    }
}
