//! Host scene-graph adapter
//!
//! The synchronization core never touches host application objects. It reads
//! the scene through [`SceneAdapter::snapshot_scene`] and writes it through
//! [`SceneAdapter::apply_proxy_change`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proxy::{DataProxy, ProxyId};

/// Kind of change pushed into the host scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// The two capabilities a host editor must provide
pub trait SceneAdapter {
    /// Capture every synchronized entity of the live scene
    fn snapshot_scene(&self) -> Vec<DataProxy>;

    /// Push one proxy change into the live scene. For `Deleted`, `proxy` is
    /// the last known state of the removed entity.
    fn apply_proxy_change(&mut self, kind: ChangeKind, proxy: &DataProxy) -> Result<()>;
}

/// Scene that has no entities and ignores every change
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScene;

impl SceneAdapter for NullScene {
    fn snapshot_scene(&self) -> Vec<DataProxy> {
        Vec::new()
    }

    fn apply_proxy_change(&mut self, _kind: ChangeKind, _proxy: &DataProxy) -> Result<()> {
        Ok(())
    }
}

/// In-memory host scene, used headless and in tests
#[derive(Debug, Default, Clone)]
pub struct MemoryScene {
    objects: BTreeMap<ProxyId, DataProxy>,
    history: Vec<(ChangeKind, ProxyId)>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local edit: create or replace an entity
    pub fn upsert(&mut self, proxy: DataProxy) {
        self.objects.insert(proxy.id.clone(), proxy);
    }

    /// Local edit: mutate an existing entity in place
    pub fn edit(&mut self, id: &str, f: impl FnOnce(&mut DataProxy)) -> bool {
        match self.objects.get_mut(id) {
            Some(proxy) => {
                f(proxy);
                true
            }
            None => false,
        }
    }

    /// Local edit: delete an entity
    pub fn remove(&mut self, id: &str) -> Option<DataProxy> {
        self.objects.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&DataProxy> {
        self.objects.get(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Changes received through the adapter, oldest first
    pub fn history(&self) -> &[(ChangeKind, ProxyId)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

impl SceneAdapter for MemoryScene {
    fn snapshot_scene(&self) -> Vec<DataProxy> {
        self.objects.values().cloned().collect()
    }

    fn apply_proxy_change(&mut self, kind: ChangeKind, proxy: &DataProxy) -> Result<()> {
        match kind {
            ChangeKind::Created | ChangeKind::Updated => {
                self.objects.insert(proxy.id.clone(), proxy.clone());
            }
            ChangeKind::Deleted => {
                self.objects.remove(&proxy.id);
            }
        }
        self.history.push((kind, proxy.id.clone()));
        Ok(())
    }
}
