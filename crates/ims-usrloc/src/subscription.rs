// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared subscription documents.
//!
//! All IMPUs of an implicit registration set point at one
//! [`SubscriptionCell`]. Holders own an `Arc`; the registry only keeps a
//! `Weak` so a document is freed when its last record lets go. Re-attaching
//! goes through `Weak::upgrade`, which fails once the count has reached zero,
//! so a dying document is never handed out again.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use ims_subscription::ImsSubscription;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smol_str::SmolStr;
use tracing::debug;

/// A subscription document plus its lock.
#[derive(Debug)]
pub struct SubscriptionCell {
    private_identity: SmolStr,
    document: RwLock<ImsSubscription>,
}

impl SubscriptionCell {
    pub fn new(document: ImsSubscription) -> Arc<Self> {
        Arc::new(Self {
            private_identity: SmolStr::new(&document.private_identity),
            document: RwLock::new(document),
        })
    }

    pub fn private_identity(&self) -> &str {
        &self.private_identity
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ImsSubscription> {
        self.document.read()
    }

    /// Writes must keep the private identity unchanged.
    pub fn write(&self) -> RwLockWriteGuard<'_, ImsSubscription> {
        self.document.write()
    }
}

/// Live documents indexed by private identity.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_impi: DashMap<SmolStr, Weak<SubscriptionCell>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live document for `impi`, if any record still holds it.
    pub fn get(&self, impi: &str) -> Option<Arc<SubscriptionCell>> {
        self.by_impi.get(impi).and_then(|weak| weak.upgrade())
    }

    /// Registers `cell` under its private identity, replacing any entry.
    pub fn add(&self, cell: &Arc<SubscriptionCell>) {
        self.by_impi
            .insert(SmolStr::new(cell.private_identity()), Arc::downgrade(cell));
    }

    /// Returns the live document for the same implicit set as `document`, or
    /// registers `document` as a new one.
    ///
    /// An existing document is reused when its private identity matches and
    /// it shares at least one public identity with `document`; its contents are
    /// then replaced by `document`.
    pub fn get_or_add(&self, document: ImsSubscription) -> Arc<SubscriptionCell> {
        let key = SmolStr::new(&document.private_identity);
        let mut entry = self.by_impi.entry(key).or_default();
        if let Some(existing) = entry.upgrade() {
            let overlaps = existing.read().overlaps(&document);
            if overlaps {
                debug!(impi = %existing.private_identity(), "reusing shared subscription");
                *existing.write() = document;
                return existing;
            }
        }
        let cell = SubscriptionCell::new(document);
        *entry = Arc::downgrade(&cell);
        cell
    }

    /// Resolves a cell supplied by a caller against the registry.
    ///
    /// A registered cell comes back as is. A cell the registry has not seen
    /// hands its contents to the live document of the same implicit set, which
    /// is returned in its place; with no such document the cell is registered.
    pub fn resolve(&self, cell: &Arc<SubscriptionCell>) -> Arc<SubscriptionCell> {
        let key = SmolStr::new(cell.private_identity());
        let mut entry = self.by_impi.entry(key).or_default();
        if let Some(existing) = entry.upgrade() {
            if Arc::ptr_eq(&existing, cell) {
                return existing;
            }
            let document = cell.read().clone();
            let overlaps = existing.read().overlaps(&document);
            if overlaps {
                debug!(impi = %existing.private_identity(), "adopting caller document into shared subscription");
                *existing.write() = document;
                return existing;
            }
        }
        *entry = Arc::downgrade(cell);
        Arc::clone(cell)
    }

    /// Drops entries whose document has been freed. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.by_impi.len();
        self.by_impi.retain(|_, weak| weak.strong_count() > 0);
        before - self.by_impi.len()
    }

    pub fn len(&self) -> usize {
        self.by_impi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_impi.is_empty()
    }
}

/// Number of holders of a document, registry excluded.
pub fn holders(cell: &Arc<SubscriptionCell>) -> usize {
    Arc::strong_count(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ims_subscription::{PublicIdentity, ServiceProfile};

    fn doc(impi: &str, ids: &[&str]) -> ImsSubscription {
        let mut profile = ServiceProfile::new();
        for id in ids {
            profile = profile.with_identity(PublicIdentity::new(*id));
        }
        ImsSubscription::new(impi).with_profile(profile)
    }

    #[test]
    fn shares_document_for_overlapping_set() {
        let registry = SubscriptionRegistry::new();
        let a = registry.get_or_add(doc("alice", &["sip:alice@ims", "tel:+1"]));
        let b = registry.get_or_add(doc("alice", &["tel:+1", "sip:alice2@ims"]));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(b.read().contains_identity("sip:alice2@ims"));
        assert_eq!(holders(&a), 2);
    }

    #[test]
    fn disjoint_set_gets_new_document() {
        let registry = SubscriptionRegistry::new();
        let a = registry.get_or_add(doc("alice", &["sip:alice@ims"]));
        let b = registry.get_or_add(doc("alice", &["sip:other@ims"]));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&registry.get("alice").unwrap(), &b));
    }

    #[test]
    fn freed_document_is_not_resurrected() {
        let registry = SubscriptionRegistry::new();
        let a = registry.get_or_add(doc("alice", &["sip:alice@ims"]));
        drop(a);
        assert!(registry.get("alice").is_none());
        assert_eq!(registry.purge(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn resolve_registers_unknown_cell() {
        let registry = SubscriptionRegistry::new();
        let a = SubscriptionCell::new(doc("carol", &["sip:carol@ims"]));
        let resolved = registry.resolve(&a);
        assert!(Arc::ptr_eq(&resolved, &a));
        assert!(Arc::ptr_eq(&registry.resolve(&a), &a));
        assert!(Arc::ptr_eq(&registry.get("carol").unwrap(), &a));
    }

    #[test]
    fn resolve_folds_fresh_cell_into_live_set() {
        let registry = SubscriptionRegistry::new();
        let live = registry.get_or_add(doc("alice", &["sip:alice@ims", "tel:+1"]));
        let fresh = SubscriptionCell::new(doc("alice", &["tel:+1", "sip:alice2@ims"]));
        let resolved = registry.resolve(&fresh);
        assert!(Arc::ptr_eq(&resolved, &live));
        assert!(live.read().contains_identity("sip:alice2@ims"));
        assert_eq!(holders(&fresh), 1);
    }

    #[test]
    fn add_replaces_entry() {
        let registry = SubscriptionRegistry::new();
        let a = SubscriptionCell::new(doc("bob", &["sip:bob@ims"]));
        registry.add(&a);
        assert!(Arc::ptr_eq(&registry.get("bob").unwrap(), &a));
        assert_eq!(registry.len(), 1);
    }
}
