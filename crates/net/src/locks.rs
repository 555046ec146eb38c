//! Advisory lock table
//!
//! Locks are per-resource and non-nested. The first committed request wins;
//! later requests for a held resource are ignored until it is released.
//! Both the server and every client fold the same committed commands into a
//! table, so all of them agree on the holder.

use std::collections::BTreeMap;

use crate::protocol::{ClientId, LockHolder};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockTable {
    holders: BTreeMap<String, ClientId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_holders(holders: &[LockHolder]) -> Self {
        Self {
            holders: holders
                .iter()
                .map(|h| (h.resource.clone(), h.holder))
                .collect(),
        }
    }

    /// Apply a committed request; returns true if `client` now holds it
    pub fn request(&mut self, resource: &str, client: ClientId) -> bool {
        match self.holders.get(resource) {
            Some(holder) => *holder == client,
            None => {
                self.holders.insert(resource.to_string(), client);
                true
            }
        }
    }

    /// Apply a committed release; only the holder can release
    pub fn release(&mut self, resource: &str, client: ClientId) -> bool {
        if self.holders.get(resource) == Some(&client) {
            self.holders.remove(resource);
            true
        } else {
            false
        }
    }

    /// Drop every lock held by `client`, returning the freed resources
    pub fn release_all(&mut self, client: ClientId) -> Vec<String> {
        let freed: Vec<String> = self
            .holders
            .iter()
            .filter(|(_, holder)| **holder == client)
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in &freed {
            self.holders.remove(resource);
        }
        freed
    }

    pub fn holder(&self, resource: &str) -> Option<ClientId> {
        self.holders.get(resource).copied()
    }

    /// True if someone other than `client` holds `resource`
    pub fn is_held_by_other(&self, resource: &str, client: ClientId) -> bool {
        self.holder(resource).is_some_and(|h| h != client)
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn clear(&mut self) {
        self.holders.clear();
    }

    pub fn holders(&self) -> Vec<LockHolder> {
        self.holders
            .iter()
            .map(|(resource, holder)| LockHolder {
                resource: resource.clone(),
                holder: *holder,
            })
            .collect()
    }
}
