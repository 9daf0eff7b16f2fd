use std::collections::{BTreeMap, HashMap};
use std::ops::{AddAssign, SubAssign};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    DatasetRow, FIELD_IMAGES, FIELD_WELLS, FIELD_WRITTEN, ManifestStatus, numeric_field,
};

/// Rollup counters for one manifest, or for a manifest and its descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManifestStats {
    pub item_count: u64,
    pub image_count: u64,
    pub group_count: u64,
    pub aggregate_bytes: u64,
}

impl ManifestStats {
    /// Rows with a `wells` column are plates: they count their `images`
    /// (default 1) and one group. Other rows count as a single image.
    pub fn from_rows(rows: &[DatasetRow]) -> Self {
        let mut stats = Self {
            item_count: rows.len() as u64,
            ..Self::default()
        };
        for row in rows {
            if row.get(FIELD_WELLS).is_some() {
                let images = numeric_field(row.get(FIELD_IMAGES));
                stats.image_count += if images >= 1.0 { images as u64 } else { 1 };
                stats.group_count += 1;
            } else {
                stats.image_count += 1;
            }
            let written = numeric_field(row.get(FIELD_WRITTEN));
            if written > 0.0 {
                stats.aggregate_bytes += written as u64;
            }
        }
        stats
    }
}

impl AddAssign for ManifestStats {
    fn add_assign(&mut self, other: Self) {
        self.item_count += other.item_count;
        self.image_count += other.image_count;
        self.group_count += other.group_count;
        self.aggregate_bytes += other.aggregate_bytes;
    }
}

impl SubAssign for ManifestStats {
    fn sub_assign(&mut self, other: Self) {
        self.item_count = self.item_count.saturating_sub(other.item_count);
        self.image_count = self.image_count.saturating_sub(other.image_count);
        self.group_count = self.group_count.saturating_sub(other.group_count);
        self.aggregate_bytes = self.aggregate_bytes.saturating_sub(other.aggregate_bytes);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestNode {
    pub url: String,
    pub parent_url: Option<String>,
    pub inherited: BTreeMap<String, String>,
    pub status: ManifestStatus,
    /// Counters over this manifest's own dataset rows.
    pub stats: ManifestStats,
    /// `stats` plus the totals of every descendant.
    pub totals: ManifestStats,
    pub children: Vec<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ManifestNode {
    fn pending(url: &str, parent_url: Option<&str>, inherited: BTreeMap<String, String>) -> Self {
        Self {
            url: url.to_string(),
            parent_url: parent_url.map(str::to_string),
            inherited,
            status: ManifestStatus::Pending,
            stats: ManifestStats::default(),
            totals: ManifestStats::default(),
            children: Vec::new(),
            loaded_at: None,
        }
    }
}

/// A child manifest reference discovered while loading its parent.
#[derive(Debug, Clone)]
pub struct ChildRef {
    pub url: String,
    pub inherited: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildSummary {
    pub url: String,
    pub status: ManifestStatus,
    pub inherited: BTreeMap<String, String>,
    pub totals: ManifestStats,
    pub child_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeEntry {
    pub depth: usize,
    pub url: String,
    pub status: ManifestStatus,
    pub totals: ManifestStats,
}

/// Tree of manifests indexed by URL. Nodes refer to each other only by key.
#[derive(Debug, Default)]
pub struct ManifestHierarchy {
    nodes: HashMap<String, ManifestNode>,
    root: Option<String>,
}

impl ManifestHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&ManifestNode> {
        self.root.as_ref().and_then(|url| self.nodes.get(url))
    }

    pub fn node(&self, url: &str) -> Option<&ManifestNode> {
        self.nodes.get(url)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records a fetched manifest with its own stats and attaches its child
    /// manifests as pending nodes. Re-registering a URL replaces its stats
    /// and corrects every ancestor's totals.
    ///
    /// Returns the children that were newly attached. A child URL already
    /// present anywhere in the tree is not attached twice.
    pub fn register(
        &mut self,
        url: &str,
        parent_url: Option<&str>,
        inherited: BTreeMap<String, String>,
        stats: ManifestStats,
        children: Vec<ChildRef>,
    ) -> Vec<ChildRef> {
        if self.root.is_none() && parent_url.is_none() {
            self.root = Some(url.to_string());
        }

        let previous = self.nodes.get(url).map(|node| node.stats);
        if let Some(previous) = previous {
            self.propagate(url, |totals| *totals -= previous);
        }

        let node = self
            .nodes
            .entry(url.to_string())
            .or_insert_with(|| ManifestNode::pending(url, parent_url, inherited.clone()));
        if node.parent_url.is_none() {
            node.parent_url = parent_url.map(str::to_string);
        }
        node.inherited = inherited;
        node.status = ManifestStatus::Loaded;
        node.stats = stats;
        node.loaded_at = Some(Utc::now());

        let mut attached: Vec<ChildRef> = Vec::new();
        for child in children {
            if attached.iter().any(|seen| seen.url == child.url) {
                tracing::warn!(parent = url, child = %child.url, "child manifest listed twice");
                continue;
            }
            if let Some(existing) = self.nodes.get(&child.url) {
                // Only an earlier registration of this parent may hand a
                // child back, and only if it never loaded.
                let is_own = existing.parent_url.as_deref() == Some(url);
                if !is_own || existing.status == ManifestStatus::Loaded {
                    tracing::warn!(
                        parent = url,
                        child = %child.url,
                        "manifest already in tree, skipping"
                    );
                    continue;
                }
            } else {
                self.nodes.insert(
                    child.url.clone(),
                    ManifestNode::pending(&child.url, Some(url), child.inherited.clone()),
                );
            }
            if let Some(node) = self.nodes.get_mut(url) {
                if !node.children.contains(&child.url) {
                    node.children.push(child.url.clone());
                }
            }
            attached.push(child);
        }

        self.propagate(url, |totals| *totals += stats);
        attached
    }

    /// Forgets every node, including the root.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    pub fn mark_failed(&mut self, url: &str) {
        if let Some(node) = self.nodes.get_mut(url) {
            node.status = ManifestStatus::Failed;
        }
    }

    /// Direct children of `url`, each with its recursive totals.
    pub fn children(&self, url: &str) -> Vec<ChildSummary> {
        let Some(node) = self.nodes.get(url) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|child| self.nodes.get(child))
            .map(|child| ChildSummary {
                url: child.url.clone(),
                status: child.status,
                inherited: child.inherited.clone(),
                totals: child.totals,
                child_count: child.children.len(),
            })
            .collect()
    }

    /// Depth-first listing from the root.
    pub fn flatten(&self) -> Vec<TreeEntry> {
        let mut entries = Vec::new();
        let mut stack: Vec<(usize, &str)> = self
            .root
            .as_deref()
            .map(|root| vec![(0, root)])
            .unwrap_or_default();
        while let Some((depth, url)) = stack.pop() {
            let Some(node) = self.nodes.get(url) else {
                continue;
            };
            entries.push(TreeEntry {
                depth,
                url: node.url.clone(),
                status: node.status,
                totals: node.totals,
            });
            for child in node.children.iter().rev() {
                stack.push((depth + 1, child));
            }
        }
        entries
    }

    /// Applies `update` to the totals of `url` and of every ancestor.
    fn propagate(&mut self, url: &str, update: impl Fn(&mut ManifestStats)) {
        let mut current = Some(url.to_string());
        let mut hops = 0;
        while let Some(key) = current {
            let Some(node) = self.nodes.get_mut(&key) else {
                break;
            };
            update(&mut node.totals);
            current = node.parent_url.clone();
            hops += 1;
            if hops > self.nodes.len() {
                break;
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct SharedHierarchy(Arc<Mutex<ManifestHierarchy>>);

impl SharedHierarchy {
    pub fn lock(&self) -> MutexGuard<'_, ManifestHierarchy> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(items: u64, bytes: u64) -> ManifestStats {
        ManifestStats {
            item_count: items,
            image_count: items,
            group_count: 0,
            aggregate_bytes: bytes,
        }
    }

    fn child(url: &str) -> ChildRef {
        ChildRef {
            url: url.to_string(),
            inherited: BTreeMap::new(),
        }
    }

    #[test]
    fn stats_from_rows() {
        let rows = vec![
            DatasetRow::new("a").with_field("written", "100"),
            DatasetRow::new("b")
                .with_field("wells", "96")
                .with_field("images", "192")
                .with_field("written", "oops"),
            DatasetRow::new("c").with_field("wells", "6"),
        ];
        let stats = ManifestStats::from_rows(&rows);
        assert_eq!(stats.item_count, 3);
        assert_eq!(stats.image_count, 1 + 192 + 1);
        assert_eq!(stats.group_count, 2);
        assert_eq!(stats.aggregate_bytes, 100);
    }

    #[test]
    fn rollups_push_to_ancestors() {
        let mut tree = ManifestHierarchy::new();
        let attached = tree.register(
            "root.csv",
            None,
            BTreeMap::new(),
            stats(1, 10),
            vec![child("a.csv"), child("b.csv")],
        );
        assert_eq!(attached.len(), 2);
        assert_eq!(tree.node("a.csv").unwrap().status, ManifestStatus::Pending);

        tree.register(
            "a.csv",
            Some("root.csv"),
            BTreeMap::new(),
            stats(2, 20),
            vec![child("c.csv")],
        );
        tree.register("c.csv", Some("a.csv"), BTreeMap::new(), stats(4, 40), vec![]);
        tree.mark_failed("b.csv");

        assert_eq!(tree.root().unwrap().totals, stats(7, 70));
        let children = tree.children("root.csv");
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].totals, stats(6, 60));
        assert_eq!(children[1].status, ManifestStatus::Failed);
    }

    #[test]
    fn reregister_replaces_stats() {
        let mut tree = ManifestHierarchy::new();
        tree.register("root.csv", None, BTreeMap::new(), stats(1, 0), vec![child("a.csv")]);
        tree.register("a.csv", Some("root.csv"), BTreeMap::new(), stats(5, 0), vec![]);
        tree.register("a.csv", Some("root.csv"), BTreeMap::new(), stats(2, 0), vec![]);
        assert_eq!(tree.root().unwrap().totals.item_count, 3);
        assert_eq!(tree.node("a.csv").unwrap().children.len(), 0);
    }

    #[test]
    fn repeated_child_is_attached_once() {
        let mut tree = ManifestHierarchy::new();
        let attached = tree.register(
            "root.csv",
            None,
            BTreeMap::new(),
            stats(1, 0),
            vec![child("a.csv"), child("a.csv")],
        );
        assert_eq!(attached.len(), 1);
        assert_eq!(tree.node("root.csv").unwrap().children, vec!["a.csv"]);

        tree.register("a.csv", Some("root.csv"), BTreeMap::new(), stats(1, 0), vec![]);
        let again = tree.register(
            "root.csv",
            None,
            BTreeMap::new(),
            stats(1, 0),
            vec![child("a.csv")],
        );
        assert!(again.is_empty());
    }

    #[test]
    fn failed_child_is_handed_back_on_reregister() {
        let mut tree = ManifestHierarchy::new();
        tree.register("root.csv", None, BTreeMap::new(), stats(1, 0), vec![child("a.csv")]);
        tree.mark_failed("a.csv");
        let again = tree.register(
            "root.csv",
            None,
            BTreeMap::new(),
            stats(1, 0),
            vec![child("a.csv")],
        );
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn clear_forgets_root() {
        let mut tree = ManifestHierarchy::new();
        tree.register("root.csv", None, BTreeMap::new(), stats(1, 0), vec![child("a.csv")]);
        tree.clear();
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
    }

    #[test]
    fn cyclic_reference_is_not_attached() {
        let mut tree = ManifestHierarchy::new();
        tree.register("root.csv", None, BTreeMap::new(), stats(1, 0), vec![child("a.csv")]);
        let attached = tree.register(
            "a.csv",
            Some("root.csv"),
            BTreeMap::new(),
            stats(1, 0),
            vec![child("root.csv")],
        );
        assert!(attached.is_empty());
        let flat = tree.flatten();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[1].depth, 1);
    }
}
