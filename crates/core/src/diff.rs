//! Scene diff computation
//!
//! A [`DiffSet`] lists Created, Updated and Deleted entries in an order that
//! can be applied front to back without ever referencing a missing proxy:
//! creations in topological order over their dependencies, then attribute
//! updates, then deletions with dependents ahead of what they depend on.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::{Attributes, DataProxy, ProxyId, ProxyTree};

/// One change to one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffEntry {
    /// Full proxy; replaces any existing proxy with the same id
    Created { proxy: DataProxy },
    /// Attribute-level change
    Updated {
        id: ProxyId,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        changed: Attributes,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dependencies: Option<Vec<ProxyId>>,
    },
    Deleted { id: ProxyId },
}

impl DiffEntry {
    pub fn id(&self) -> &str {
        match self {
            DiffEntry::Created { proxy } => &proxy.id,
            DiffEntry::Updated { id, .. } | DiffEntry::Deleted { id } => id,
        }
    }

    /// Attribute names written by this entry
    pub fn written_attributes(&self) -> Vec<&str> {
        match self {
            DiffEntry::Created { proxy } => proxy.attributes.keys().map(String::as_str).collect(),
            DiffEntry::Updated {
                changed, removed, ..
            } => changed
                .keys()
                .map(String::as_str)
                .chain(removed.iter().map(String::as_str))
                .collect(),
            DiffEntry::Deleted { .. } => Vec::new(),
        }
    }
}

/// Ordered set of proxy changes carried by one SCENE_DIFF command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffSet {
    pub entries: Vec<DiffEntry>,
}

impl DiffSet {
    pub fn new(entries: Vec<DiffEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter()
    }

    /// Identifiers touched by any entry
    pub fn touched_ids(&self) -> BTreeSet<&str> {
        self.entries.iter().map(DiffEntry::id).collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compute the minimal diff turning `prior` into `current`.
///
/// A proxy whose type tag changed is re-created rather than updated.
pub fn compute_diff(prior: &ProxyTree, current: &ProxyTree) -> Result<DiffSet> {
    let mut created: BTreeMap<&str, &DataProxy> = BTreeMap::new();
    let mut updated: Vec<DiffEntry> = Vec::new();

    for proxy in current.iter() {
        match prior.get(&proxy.id) {
            None => {
                created.insert(&proxy.id, proxy);
            }
            Some(old) if old.kind != proxy.kind => {
                created.insert(&proxy.id, proxy);
            }
            Some(old) => {
                if let Some(entry) = attribute_update(old, proxy) {
                    updated.push(entry);
                }
            }
        }
    }

    let deleted: BTreeSet<&str> = prior.ids().filter(|id| !current.contains(id)).collect();

    // A creation waits for the creations it depends on
    let creation_preds: BTreeMap<&str, Vec<&str>> = created
        .iter()
        .map(|(id, proxy)| (*id, proxy.dependencies.iter().map(String::as_str).collect()))
        .collect();

    // A deletion waits for the deletion of everything depending on it
    let mut deletion_preds: BTreeMap<&str, Vec<&str>> =
        deleted.iter().map(|id| (*id, Vec::new())).collect();
    for id in &deleted {
        if let Some(proxy) = prior.get(id) {
            for dep in &proxy.dependencies {
                if let Some(preds) = deletion_preds.get_mut(dep.as_str()) {
                    preds.push(*id);
                }
            }
        }
    }

    let mut entries = Vec::with_capacity(created.len() + updated.len() + deleted.len());
    for id in topological_order(&creation_preds)? {
        if let Some(proxy) = created.get(id) {
            entries.push(DiffEntry::Created {
                proxy: (*proxy).clone(),
            });
        }
    }
    entries.extend(updated);
    for id in topological_order(&deletion_preds)? {
        entries.push(DiffEntry::Deleted { id: id.to_string() });
    }

    Ok(DiffSet { entries })
}

fn attribute_update(old: &DataProxy, new: &DataProxy) -> Option<DiffEntry> {
    let changed: Attributes = new
        .attributes
        .iter()
        .filter(|(name, value)| old.attributes.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let removed: Vec<String> = old
        .attributes
        .keys()
        .filter(|name| !new.attributes.contains_key(*name))
        .cloned()
        .collect();
    let dependencies = (old.dependencies != new.dependencies).then(|| new.dependencies.clone());

    if changed.is_empty() && removed.is_empty() && dependencies.is_none() {
        return None;
    }

    Some(DiffEntry::Updated {
        id: new.id.clone(),
        changed,
        removed,
        dependencies,
    })
}

/// Kahn's algorithm over `node -> predecessors`; predecessors outside the
/// key set are ignored. Ties are broken by identifier for determinism.
fn topological_order<'a>(preds: &BTreeMap<&'a str, Vec<&'a str>>) -> Result<Vec<&'a str>> {
    let mut in_degree: BTreeMap<&str, usize> = preds.keys().map(|id| (*id, 0)).collect();
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (node, node_preds) in preds {
        let unique: BTreeSet<&str> = node_preds.iter().copied().collect();
        for pred in unique {
            if pred == *node || !preds.contains_key(pred) {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(node) {
                *degree += 1;
            }
            successors.entry(pred).or_default().push(*node);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(preds.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for succ in successors.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(succ) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*succ);
                }
            }
        }
    }

    if order.len() != preds.len() {
        let stuck = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(Error::CyclicDependency(stuck));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ids(diff: &DiffSet) -> Vec<String> {
        diff.iter()
            .map(|e| match e {
                DiffEntry::Created { proxy } => format!("+{}", proxy.id),
                DiffEntry::Updated { id, .. } => format!("~{}", id),
                DiffEntry::Deleted { id } => format!("-{}", id),
            })
            .collect()
    }

    #[test]
    fn test_creations_follow_dependencies() {
        let current = ProxyTree::from_proxies([
            DataProxy::new("a-instance", "object").depends_on("z-mesh"),
            DataProxy::new("z-mesh", "mesh").depends_on("m-material"),
            DataProxy::new("m-material", "material"),
        ]);

        let diff = compute_diff(&ProxyTree::new(), &current).unwrap();
        assert_eq!(ids(&diff), vec!["+m-material", "+z-mesh", "+a-instance"]);
    }

    #[test]
    fn test_deletions_remove_dependents_first() {
        let prior = ProxyTree::from_proxies([
            DataProxy::new("mesh-data-1", "mesh"),
            DataProxy::new("cube-1", "object").depends_on("mesh-data-1"),
        ]);

        let diff = compute_diff(&prior, &ProxyTree::new()).unwrap();
        assert_eq!(ids(&diff), vec!["-cube-1", "-mesh-data-1"]);
    }

    #[test]
    fn test_update_is_attribute_level() {
        let prior = ProxyTree::from_proxies([DataProxy::new("cube-1", "object")
            .with_attribute("color", "red")
            .with_attribute("size", 2)
            .with_attribute("hidden", false)]);
        let current = ProxyTree::from_proxies([DataProxy::new("cube-1", "object")
            .with_attribute("color", "blue")
            .with_attribute("size", 2)]);

        let diff = compute_diff(&prior, &current).unwrap();
        assert_eq!(
            diff.entries,
            vec![DiffEntry::Updated {
                id: "cube-1".into(),
                changed: [("color".to_string(), json!("blue"))].into_iter().collect(),
                removed: vec!["hidden".into()],
                dependencies: None,
            }]
        );
    }

    #[test]
    fn test_kind_change_recreates() {
        let prior = ProxyTree::from_proxies([DataProxy::new("thing", "empty")]);
        let current = ProxyTree::from_proxies([DataProxy::new("thing", "light")]);

        let diff = compute_diff(&prior, &current).unwrap();
        assert_eq!(ids(&diff), vec!["+thing"]);
    }

    #[test]
    fn test_phases_ordered() {
        let prior = ProxyTree::from_proxies([
            DataProxy::new("old-mesh", "mesh"),
            DataProxy::new("cube-1", "object").depends_on("old-mesh"),
        ]);
        let current = ProxyTree::from_proxies([
            DataProxy::new("new-mesh", "mesh"),
            DataProxy::new("cube-1", "object").depends_on("new-mesh"),
        ]);

        let diff = compute_diff(&prior, &current).unwrap();
        assert_eq!(ids(&diff), vec!["+new-mesh", "~cube-1", "-old-mesh"]);
    }

    #[test]
    fn test_identical_trees_produce_empty_diff() {
        let tree = ProxyTree::from_proxies([DataProxy::new("cube-1", "object")]);
        assert!(compute_diff(&tree, &tree).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_rejected() {
        let current = ProxyTree::from_proxies([
            DataProxy::new("a", "object").depends_on("b"),
            DataProxy::new("b", "object").depends_on("a"),
            DataProxy::new("c", "object"),
        ]);

        match compute_diff(&ProxyTree::new(), &current) {
            Err(Error::CyclicDependency(stuck)) => assert_eq!(stuck, vec!["a", "b"]),
            other => panic!("Expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_wire_shape() {
        let diff = DiffSet::new(vec![DiffEntry::Deleted {
            id: "cube-1".into(),
        }]);
        let bytes = diff.to_bytes().unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(),
            json!({"entries": [{"op": "deleted", "id": "cube-1"}]})
        );
        assert_eq!(DiffSet::from_bytes(&bytes).unwrap(), diff);
    }
}
