//! Remote-role services that share an id across connections.
//!
//! # Responsibilities
//! - Track every plugged remote-role [`Service`] by id
//! - Hand out snapshots for broadcast and multicast fan-out
//!
//! # Design Decisions
//! - An entry is added on plug and removed on unplug, nothing else mutates it
//! - One registry is shared by all tunnels of a server; tests build their own

use std::sync::Arc;

use dashmap::DashMap;

use crate::service::Service;

/// Service id → plugged remote-role services with that id.
#[derive(Clone, Default)]
pub struct BroadcastRegistry {
    services: Arc<DashMap<String, Vec<Service>>>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, service: &Service) {
        let mut members = self.services.entry(service.id().to_string()).or_default();
        if !members.iter().any(|member| member.ptr_eq(service)) {
            members.push(service.clone());
        }
    }

    pub(crate) fn remove(&self, service: &Service) {
        let now_empty = match self.services.get_mut(service.id()) {
            Some(mut members) => {
                members.retain(|member| !member.ptr_eq(service));
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.services.remove_if(service.id(), |_, members| members.is_empty());
        }
    }

    /// Snapshot of the services plugged under `id`.
    pub fn members(&self, id: &str) -> Vec<Service> {
        self.services
            .get(id)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, id: &str) -> usize {
        self.services.get(id).map_or(0, |members| members.len())
    }

    pub fn contains(&self, service: &Service) -> bool {
        self.services
            .get(service.id())
            .is_some_and(|members| members.iter().any(|member| member.ptr_eq(service)))
    }

    /// Ids with at least one plugged service.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for BroadcastRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRegistry").field("ids", &self.ids()).finish()
    }
}
