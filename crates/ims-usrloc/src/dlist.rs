// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::udomain::UDomain;
use crate::Shared;

/// Registered domains, newest first.
#[derive(Default)]
pub struct DomainList {
    domains: RwLock<Vec<Arc<UDomain>>>,
}

impl DomainList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the domain called `name`, creating it on first use.
    pub(crate) fn register_or_get(&self, name: &str, shared: &Arc<Shared>) -> Result<Arc<UDomain>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let mut domains = self.domains.write();
        // Another thread may have won the race between the read and write lock.
        if let Some(existing) = domains.iter().find(|d| d.name() == name) {
            return Ok(Arc::clone(existing));
        }
        let domain = Arc::new(UDomain::new(name, Arc::clone(shared))?);
        domains.try_reserve(1)?;
        domains.insert(0, Arc::clone(&domain));
        debug!(domain = name, total = domains.len(), "domain registered");
        Ok(domain)
    }

    pub fn get(&self, name: &str) -> Option<Arc<UDomain>> {
        self.domains
            .read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Snapshot of the current list, newest first.
    pub fn all(&self) -> Vec<Arc<UDomain>> {
        self.domains.read().clone()
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }

    pub fn total_users(&self) -> usize {
        self.domains.read().iter().map(|d| d.users()).sum()
    }

    pub(crate) fn clear(&self) -> Vec<Arc<UDomain>> {
        std::mem::take(&mut *self.domains.write())
    }
}
