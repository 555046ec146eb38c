//! Data Proxy model
//!
//! A Data Proxy is the shadow of one host scene entity: a stable identifier,
//! a type tag, attribute values, and the identifiers of the proxies it
//! depends on (a mesh instance depends on its mesh data, for example).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier of a Data Proxy
pub type ProxyId = String;

/// Attribute name to value mapping
pub type Attributes = BTreeMap<String, Value>;

/// Shadow representation of one scene entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProxy {
    pub id: ProxyId,
    /// Type tag (e.g. "object", "mesh", "collection")
    pub kind: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub dependencies: Vec<ProxyId>,
}

impl DataProxy {
    pub fn new(id: impl Into<ProxyId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            attributes: Attributes::new(),
            dependencies: Vec::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder-style dependency declaration
    pub fn depends_on(mut self, id: impl Into<ProxyId>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }
}

/// In-memory shadow tree of every synchronized proxy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyTree {
    proxies: BTreeMap<ProxyId, DataProxy>,
}

impl ProxyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_proxies(proxies: impl IntoIterator<Item = DataProxy>) -> Self {
        Self {
            proxies: proxies.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DataProxy> {
        self.proxies.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DataProxy> {
        self.proxies.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.proxies.contains_key(id)
    }

    /// Insert or replace a proxy, returning the previous version
    pub fn insert(&mut self, proxy: DataProxy) -> Option<DataProxy> {
        self.proxies.insert(proxy.id.clone(), proxy)
    }

    pub fn remove(&mut self, id: &str) -> Option<DataProxy> {
        self.proxies.remove(id)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataProxy> {
        self.proxies.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.proxies.keys().map(String::as_str)
    }

    /// Live proxies that list `id` among their dependencies
    pub fn dependents_of(&self, id: &str) -> Vec<ProxyId> {
        self.proxies
            .values()
            .filter(|p| p.id != id && p.dependencies.iter().any(|d| d == id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Dependencies of `proxy` that do not resolve in this tree
    pub fn missing_dependencies(&self, proxy: &DataProxy) -> Vec<ProxyId> {
        proxy
            .dependencies
            .iter()
            .filter(|d| **d != proxy.id && !self.proxies.contains_key(d.as_str()))
            .cloned()
            .collect()
    }

    pub fn to_vec(&self) -> Vec<DataProxy> {
        self.proxies.values().cloned().collect()
    }
}

impl FromIterator<DataProxy> for ProxyTree {
    fn from_iter<I: IntoIterator<Item = DataProxy>>(iter: I) -> Self {
        Self::from_proxies(iter)
    }
}
