// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Periodic expiry sweep.
//!
//! One sweep runs the contact pass (reclaim unreferenced contacts) and then
//! walks every IMPU bucket of every domain: expired subscribers are dropped,
//! invalid contacts unlinked, and records without contacts move through
//! REGISTERED -> UNREGISTERED -> deleted. Database work for one record is
//! grouped in a transaction that is only opened if the record needed any.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::callbacks::{EventType, UsrlocEvent};
use crate::impurecord::{ImpuRecord, RegState};
use crate::persist::RecordTxn;
use crate::udomain::UDomain;
use crate::Usrloc;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub contacts_deleted: usize,
    pub contacts_expired: usize,
    pub contacts_unlinked: usize,
    pub subscribers_expired: usize,
    pub impus_unregistered: usize,
    pub impus_deleted: usize,
    pub subscriptions_purged: usize,
    pub max_contact_depth: usize,
    pub max_impu_depth: usize,
}

enum Verdict {
    Keep,
    Delete,
}

pub(crate) fn sweep_domain(domain: &UDomain, now: i64, report: &mut SweepReport) {
    let persistence = domain.shared.persistence.as_ref();
    let mut depth = 0;
    for (_, slot) in domain.slots().iter() {
        let mut bucket = slot.lock();
        depth = depth.max(bucket.records.len());
        let mut i = 0;
        while i < bucket.records.len() {
            let mut txn = persistence.map(RecordTxn::new);
            let verdict = sweep_record(domain, &mut bucket.records[i], now, &mut txn, report);
            match verdict {
                Verdict::Keep => i += 1,
                Verdict::Delete => {
                    let db = txn.as_mut().map(|t| t.db());
                    domain.remove_at(&mut bucket, i, db);
                    report.impus_deleted += 1;
                }
            }
            if let Some(txn) = txn {
                txn.finish();
            }
        }
    }
    domain.reset_depth(depth);
    report.max_impu_depth = report.max_impu_depth.max(depth);
}

fn sweep_record(
    domain: &UDomain,
    record: &mut ImpuRecord,
    now: i64,
    txn: &mut Option<RecordTxn<'_>>,
    report: &mut SweepReport,
) -> Verdict {
    let before = record.subscribers.len();
    record.subscribers.retain(|s| s.expires > now);
    report.subscribers_expired += before - record.subscribers.len();

    let contacts = &domain.shared.contacts;
    let mut i = 0;
    while let Some(handle) = record.contacts.get(i) {
        let valid = contacts
            .with_contact(handle, |c| c.is_valid(now))
            .unwrap_or(false);
        if valid {
            i += 1;
            continue;
        }
        debug!(impu = %record.public_identity, contact = %handle, "unlinking expired contact");
        let db = txn.as_mut().map(|t| t.db());
        domain.unlink_at(record, i, db, EventType::IMPU_EXPIRE_CONTACT);
        report.contacts_unlinked += 1;
    }

    if !record.contacts.is_empty() {
        return Verdict::Keep;
    }

    match record.reg_state {
        RegState::Registered => {
            record.reg_state = RegState::Unregistered;
            record.expires = now + domain.shared.config.unreg_validity;
            report.impus_unregistered += 1;
            debug!(impu = %record.public_identity, expires = record.expires, "no contacts left, now unregistered");
            record
                .callbacks
                .fire(&UsrlocEvent::impu(EventType::IMPU_REG_NC_DELETE, record));
            store(record, txn);
            Verdict::Keep
        }
        RegState::Unregistered if record.expires <= now => {
            record
                .callbacks
                .fire(&UsrlocEvent::impu(EventType::IMPU_UNREG_EXPIRED, record));
            if record.subscribers.is_empty() {
                Verdict::Delete
            } else {
                record.reg_state = RegState::NotRegistered;
                record.expires = 0;
                store(record, txn);
                Verdict::Keep
            }
        }
        RegState::Unregistered => Verdict::Keep,
        RegState::NotRegistered if record.subscribers.is_empty() => {
            record
                .callbacks
                .fire(&UsrlocEvent::impu(EventType::IMPU_NOT_REG_DELETE, record));
            Verdict::Delete
        }
        RegState::NotRegistered => Verdict::Keep,
    }
}

fn store(record: &ImpuRecord, txn: &mut Option<RecordTxn<'_>>) {
    if let Some(db) = txn.as_mut().map(|t| t.db()) {
        if let Err(err) = db.store_impu(record) {
            db.degraded("impu update", &record.public_identity, &err);
        }
    }
}

/// Background task running [`Usrloc::sweep`] on a fixed period.
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Starts the task on the current tokio runtime. The first sweep runs one
    /// period after the call.
    pub fn spawn(usrloc: Arc<Usrloc>, period: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs_f64(), "usrloc sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ul = Arc::clone(&usrloc);
                        match tokio::task::spawn_blocking(move || ul.sweep()).await {
                            Ok(report) => debug!(?report, "sweep finished"),
                            Err(err) => warn!(error = %err, "sweep task failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("usrloc sweeper stopped");
        });
        Self { shutdown, handle }
    }

    /// Stops the task and waits for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
    }
}
