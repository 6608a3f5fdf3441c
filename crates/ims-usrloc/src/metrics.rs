// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// Store-level counters (records, contacts, sweeps, persistence failures).
#[derive(Debug, Clone, Default)]
pub struct UsrlocMetrics {
    inner: Arc<RwLock<MetricsData>>,
}

#[derive(Debug, Default)]
struct MetricsData {
    impus_inserted: u64,
    impus_deleted: u64,
    contacts_linked: u64,
    contacts_unlinked: u64,
    contacts_evicted: u64,
    contacts_reclaimed: u64,
    subscribers_expired: u64,
    sweeps: u64,
    db_errors: u64,
    last_sweep: Option<Instant>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsrlocMetricsSnapshot {
    pub impus_inserted: u64,
    pub impus_deleted: u64,
    pub contacts_linked: u64,
    pub contacts_unlinked: u64,
    pub contacts_evicted: u64,
    pub contacts_reclaimed: u64,
    pub subscribers_expired: u64,
    pub sweeps: u64,
    pub db_errors: u64,
    pub last_sweep: Option<Instant>,
}

impl UsrlocMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_impu_inserted(&self) {
        self.inner.write().impus_inserted += 1;
    }

    pub fn record_impu_deleted(&self) {
        self.inner.write().impus_deleted += 1;
    }

    pub fn record_contact_linked(&self) {
        self.inner.write().contacts_linked += 1;
    }

    pub fn record_contact_unlinked(&self) {
        self.inner.write().contacts_unlinked += 1;
    }

    pub fn record_contact_evicted(&self) {
        self.inner.write().contacts_evicted += 1;
    }

    pub fn record_db_error(&self) {
        self.inner.write().db_errors += 1;
    }

    pub fn record_sweep(&self, reclaimed: usize, subscribers_expired: usize) {
        let mut data = self.inner.write();
        data.sweeps += 1;
        data.contacts_reclaimed += reclaimed as u64;
        data.subscribers_expired += subscribers_expired as u64;
        data.last_sweep = Some(Instant::now());
    }

    pub fn snapshot(&self) -> UsrlocMetricsSnapshot {
        let data = self.inner.read();
        UsrlocMetricsSnapshot {
            impus_inserted: data.impus_inserted,
            impus_deleted: data.impus_deleted,
            contacts_linked: data.contacts_linked,
            contacts_unlinked: data.contacts_unlinked,
            contacts_evicted: data.contacts_evicted,
            contacts_reclaimed: data.contacts_reclaimed,
            subscribers_expired: data.subscribers_expired,
            sweeps: data.sweeps,
            db_errors: data.db_errors,
            last_sweep: data.last_sweep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = UsrlocMetrics::new();
        let other = metrics.clone();
        other.record_impu_inserted();
        other.record_sweep(3, 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.impus_inserted, 1);
        assert_eq!(snap.contacts_reclaimed, 3);
        assert_eq!(snap.subscribers_expired, 1);
        assert!(snap.last_sweep.is_some());
    }
}
