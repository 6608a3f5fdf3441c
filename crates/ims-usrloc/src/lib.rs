// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! S-CSCF user location store.
//!
//! [`Usrloc`] bundles everything a registrar needs: the process-wide
//! [`ContactStore`], the directory of IMPU domains ([`UDomain`]), global
//! listeners, the subscription-document registry and, when configured,
//! write-through persistence. Share it between threads behind an `Arc`.
//!
//! # Example
//!
//! ```
//! use ims_usrloc::{ContactInfo, ImpuInfo, RegState, Usrloc, UsrlocConfig};
//!
//! let ul = Usrloc::init(UsrlocConfig::small()).unwrap();
//! let location = ul.register_udomain("location").unwrap();
//! location
//!     .insert("sip:alice@example.com", &ImpuInfo::new(RegState::Registered))
//!     .unwrap();
//! location
//!     .add_contact("sip:alice@example.com", "sip:alice@192.0.2.1:5060", &ContactInfo::new(0))
//!     .unwrap();
//! assert_eq!(ul.total_users(), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

pub mod callbacks;
pub mod clock;
pub mod config;
pub mod contact;
pub mod contact_store;
pub mod dialog;
pub mod dlist;
mod error;
pub mod hash;
pub mod impurecord;
pub mod inspect;
pub mod metrics;
pub mod persist;
pub mod slot;
pub mod subscription;
pub mod timer;
pub mod udomain;

pub use callbacks::{EventType, GlobalCallbacks, UsrlocEvent, UsrlocListener};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DbMode, MatchingMode, MaxContactBehaviour, UsrlocConfig};
pub use contact::{parse_params, Contact, ContactHandle, ContactInfo, ContactParam};
pub use contact_store::{ContactStore, Snapshot, SnapshotEntry, SnapshotIter};
pub use dialog::{DialogApi, DialogEvents, DialogRef, NoopDialogApi};
pub use dlist::DomainList;
pub use error::{Result, UsrlocError};
pub use impurecord::{
    BarringFilter, ChargingAddresses, IdentityList, ImpuInfo, ImpuRecord, RegState,
    RegSubscriber, SubscriberKey, SubscriberUpdate,
};
pub use inspect::{DomainStats, ImpuDump};
pub use metrics::{UsrlocMetrics, UsrlocMetricsSnapshot};
pub use persist::{DbError, DbRow, DbValue, MemoryUsrlocDb, Persistence, UsrlocDb};
pub use subscription::{SubscriptionCell, SubscriptionRegistry};
pub use timer::{SweepReport, Sweeper};
pub use udomain::{ImpuSlotGuard, UDomain};

/// State every domain shares.
pub(crate) struct Shared {
    pub(crate) config: UsrlocConfig,
    pub(crate) contacts: Arc<ContactStore>,
    pub(crate) global: Arc<GlobalCallbacks>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) persistence: Option<Persistence>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: UsrlocMetrics,
}

/// Where a listener is attached.
#[derive(Debug, Clone, Copy)]
pub enum CallbackTarget<'a> {
    /// Process-wide list; only `CONTACT_INSERT` and `IMPU_INSERT`.
    Global,
    Impu { domain: &'a str, identity: &'a str },
    Contact(ContactHandle),
}

/// Counts from [`Usrloc::preload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub impus: usize,
    pub contacts: usize,
    pub links: usize,
    pub skipped: usize,
}

pub struct UsrlocBuilder {
    config: UsrlocConfig,
    clock: Arc<dyn Clock>,
    dialogs: Arc<dyn DialogApi>,
    db: Option<Arc<dyn UsrlocDb>>,
}

impl UsrlocBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dialogs(mut self, dialogs: Arc<dyn DialogApi>) -> Self {
        self.dialogs = dialogs;
        self
    }

    /// Database used when `db_mode` is write-through.
    pub fn with_db(mut self, db: Arc<dyn UsrlocDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn build(self) -> Result<Usrloc> {
        let config = self.config;
        config.validate()?;

        let persistence = match (config.write_through(), self.db) {
            (true, Some(db)) => Some(db),
            (true, None) => {
                return Err(UsrlocError::Invalid(
                    "write-through mode needs a database".into(),
                ))
            }
            (false, _) => None,
        };

        let metrics = UsrlocMetrics::new();
        let global = Arc::new(GlobalCallbacks::new());
        let contacts = Arc::new(ContactStore::new(
            config.contact_slots(),
            config.matching_mode,
            self.dialogs,
            Arc::clone(&global),
            Arc::clone(&self.clock),
        )?);
        info!(
            impu_slots = config.impu_slots(),
            contact_slots = config.contact_slots(),
            matching = ?config.matching_mode,
            contact_limit = config.contact_limit(),
            write_through = persistence.is_some(),
            "usrloc initialised"
        );

        Ok(Usrloc {
            shared: Arc::new(Shared {
                persistence: persistence.map(|db| Persistence::new(db, metrics.clone())),
                config,
                contacts,
                global,
                subscriptions: SubscriptionRegistry::new(),
                clock: self.clock,
                metrics,
            }),
            domains: DomainList::new(),
        })
    }
}

/// The user location state aggregate.
pub struct Usrloc {
    shared: Arc<Shared>,
    domains: DomainList,
}

impl Usrloc {
    /// Memory-only store on the system clock with no dialog integration.
    pub fn init(config: UsrlocConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: UsrlocConfig) -> UsrlocBuilder {
        UsrlocBuilder {
            config,
            clock: Arc::new(SystemClock),
            dialogs: Arc::new(NoopDialogApi),
            db: None,
        }
    }

    /// Drops every domain. Contacts still referenced elsewhere stay alive
    /// until their handles are gone.
    pub fn destroy(self) {
        let domains = self.domains.clear();
        info!(
            domains = domains.len(),
            contacts = self.shared.contacts.len(),
            "usrloc destroyed"
        );
    }

    pub fn config(&self) -> &UsrlocConfig {
        &self.shared.config
    }

    pub fn now(&self) -> i64 {
        self.shared.clock.now()
    }

    pub fn contacts(&self) -> &Arc<ContactStore> {
        &self.shared.contacts
    }

    pub fn callbacks(&self) -> &Arc<GlobalCallbacks> {
        &self.shared.global
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.shared.subscriptions
    }

    pub fn persistence(&self) -> Option<&Persistence> {
        self.shared.persistence.as_ref()
    }

    pub fn metrics(&self) -> &UsrlocMetrics {
        &self.shared.metrics
    }

    pub fn domains(&self) -> &DomainList {
        &self.domains
    }

    /// Returns the domain called `name`, creating it on first use.
    pub fn register_udomain(&self, name: &str) -> Result<Arc<UDomain>> {
        self.domains.register_or_get(name, &self.shared)
    }

    pub fn get_udomain(&self, name: &str) -> Option<Arc<UDomain>> {
        self.domains.get(name)
    }

    fn domain(&self, name: &str) -> Result<Arc<UDomain>> {
        self.get_udomain(name).ok_or(UsrlocError::NotFound("domain"))
    }

    pub fn total_users(&self) -> usize {
        self.domains.total_users()
    }

    pub fn register_callback(
        &self,
        target: CallbackTarget<'_>,
        mask: EventType,
        listener: Arc<dyn UsrlocListener>,
    ) -> Result<()> {
        match target {
            CallbackTarget::Global => self.shared.global.register(mask, listener),
            CallbackTarget::Impu { domain, identity } => {
                self.domain(domain)?.register_callback(identity, mask, listener)
            }
            CallbackTarget::Contact(handle) => {
                self.shared.contacts.register_callback(handle, mask, listener)
            }
        }
    }

    /// Runs one sweep at the current time.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(self.shared.clock.now())
    }

    /// Contact pass, then the IMPU pass of every domain, all against `now`.
    pub fn sweep_at(&self, now: i64) -> SweepReport {
        let pass = self
            .shared
            .contacts
            .sweep(now, self.shared.persistence.as_ref());
        let mut report = SweepReport {
            contacts_deleted: pass.deleted,
            contacts_expired: pass.expired,
            max_contact_depth: pass.max_depth,
            ..SweepReport::default()
        };
        for domain in self.domains.all() {
            timer::sweep_domain(&domain, now, &mut report);
        }
        report.subscriptions_purged = self.shared.subscriptions.purge();
        self.shared
            .metrics
            .record_sweep(report.contacts_deleted, report.subscribers_expired);
        report
    }

    /// Rebuilds `domain` from the database without writing anything back.
    pub fn preload(&self, domain: &str) -> Result<PreloadReport> {
        let db = self
            .shared
            .persistence
            .as_ref()
            .ok_or_else(|| UsrlocError::Invalid("no database configured".into()))?;
        let udomain = self.register_udomain(domain)?;
        let mut report = PreloadReport::default();

        for row in db.db().select_all(persist::IMPU_TABLE)? {
            match self.preload_impu(&udomain, &row) {
                Ok(()) => report.impus += 1,
                Err(err) => {
                    warn!(domain, error = %err, "skipping impu row");
                    report.skipped += 1;
                }
            }
        }

        let mut by_uri = HashMap::new();
        for row in db.db().select_all(persist::CONTACT_TABLE)? {
            match preload_contact(&self.shared.contacts, &row) {
                Ok((uri, handle)) => {
                    by_uri.insert(uri, handle);
                    report.contacts += 1;
                }
                Err(err) => {
                    warn!(domain, error = %err, "skipping contact row");
                    report.skipped += 1;
                }
            }
        }

        for row in db.db().select_all(persist::IMPU_CONTACT_TABLE)? {
            let identity = row.get(persist::columns::IMPU).and_then(DbValue::as_str);
            let uri = row.get(persist::columns::CONTACT).and_then(DbValue::as_str);
            let (Some(identity), Some(handle)) = (identity, uri.and_then(|u| by_uri.get(u))) else {
                report.skipped += 1;
                continue;
            };
            match udomain.link_contact(identity, *handle, false) {
                Ok(()) => report.links += 1,
                Err(err) => {
                    warn!(impu = identity, error = %err, "skipping impu_contact row");
                    report.skipped += 1;
                }
            }
        }

        // Drop the loader's reference; unlinked rows fall to the next sweep.
        for handle in by_uri.values() {
            self.shared.contacts.release(*handle)?;
        }
        info!(
            domain,
            impus = report.impus,
            contacts = report.contacts,
            links = report.links,
            skipped = report.skipped,
            "preload finished"
        );
        Ok(report)
    }

    fn preload_impu(&self, domain: &UDomain, row: &DbRow) -> Result<()> {
        use persist::columns;

        let text = |name: &str| row.get(name).and_then(DbValue::as_str);
        let identity = text(columns::IMPU)
            .ok_or_else(|| DbError::Malformed("impu row without identity".into()))?;
        let reg_state = row
            .get(columns::REG_STATE)
            .and_then(DbValue::as_int)
            .and_then(RegState::from_i64)
            .unwrap_or_default();
        let barring = row
            .get(columns::BARRING)
            .and_then(DbValue::as_int)
            .unwrap_or(0);
        let charging = ChargingAddresses {
            ccf1: text(columns::CCF1).map(str::to_owned),
            ccf2: text(columns::CCF2).map(str::to_owned),
            ecf1: text(columns::ECF1).map(str::to_owned),
            ecf2: text(columns::ECF2).map(str::to_owned),
        };

        let mut info = ImpuInfo::new(reg_state)
            .with_barring(i32::try_from(barring).unwrap_or(0))
            .with_charging(charging);
        if let Some(blob) = row.get(columns::SUBSCRIPTION).and_then(DbValue::as_blob) {
            let document = ims_subscription::decode(blob)?;
            info = info.with_subscription(self.shared.subscriptions.get_or_add(document));
        }
        domain.lock(identity).load(identity, &info)
    }
}

fn preload_contact(contacts: &ContactStore, row: &DbRow) -> Result<(String, ContactHandle)> {
    use persist::columns;

    let text = |name: &str| row.get(name).and_then(DbValue::as_str);
    let uri = text(columns::CONTACT)
        .ok_or_else(|| DbError::Malformed("contact row without uri".into()))?;
    let mut info = ContactInfo::new(
        row.get(columns::EXPIRES)
            .and_then(DbValue::as_int)
            .unwrap_or(0),
    );
    if let Some(call_id) = text(columns::CALLID) {
        info = info.with_call_id(call_id, 0);
    }
    if let Some(ua) = text(columns::USER_AGENT) {
        info = info.with_user_agent(ua);
    }
    if let Some(path) = text(columns::PATH) {
        info = info.with_path(path);
    }
    if let Some(received) = text(columns::RECEIVED) {
        info = info.with_received(received);
    }
    if let Some(params) = text(columns::PARAMS) {
        info.params = parse_params(params);
    }
    let handle = contacts.insert(uri, &info)?;
    Ok((uri.to_owned(), handle))
}

/// The store's operations as one object-safe table, for collaborators that
/// bind to the store at runtime.
pub trait UsrlocApi: Send + Sync {
    fn register_udomain(&self, name: &str) -> Result<Arc<UDomain>>;
    fn get_udomain(&self, name: &str) -> Option<Arc<UDomain>>;

    fn insert_impu(&self, domain: &str, identity: &str, info: &ImpuInfo) -> Result<()>;
    fn get_impu(&self, domain: &str, identity: &str) -> Result<ImpuDump>;
    fn update_impu(&self, domain: &str, identity: &str, info: &ImpuInfo) -> Result<()>;
    fn delete_impu(&self, domain: &str, identity: &str) -> Result<()>;

    fn insert_contact(&self, uri: &str, info: &ContactInfo) -> Result<ContactHandle>;
    fn get_contact(&self, uri: &str, discriminator: Option<&str>) -> Option<ContactHandle>;
    fn release_contact(&self, contact: ContactHandle) -> Result<i32>;
    fn update_contact(&self, contact: ContactHandle, info: &ContactInfo) -> Result<()>;
    fn expire_contact(&self, contact: ContactHandle) -> Result<()>;
    fn delete_contact(&self, contact: ContactHandle) -> Result<()>;

    fn link_contact(&self, domain: &str, identity: &str, contact: ContactHandle, persist: bool) -> Result<()>;
    fn unlink_contact(&self, domain: &str, identity: &str, contact: ContactHandle, persist: bool) -> Result<()>;
    fn linked_identities(&self, domain: &str, identity: &str, filter: BarringFilter) -> Result<IdentityList>;

    fn snapshot_contacts(&self, buf: &mut [u8], flags: u32, shard: usize, shards: usize) -> Result<Snapshot>;
    fn register_callback(
        &self,
        target: CallbackTarget<'_>,
        mask: EventType,
        listener: Arc<dyn UsrlocListener>,
    ) -> Result<()>;
    fn total_users(&self) -> usize;
}

impl UsrlocApi for Usrloc {
    fn register_udomain(&self, name: &str) -> Result<Arc<UDomain>> {
        Usrloc::register_udomain(self, name)
    }

    fn get_udomain(&self, name: &str) -> Option<Arc<UDomain>> {
        Usrloc::get_udomain(self, name)
    }

    fn insert_impu(&self, domain: &str, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.domain(domain)?.insert(identity, info)
    }

    fn get_impu(&self, domain: &str, identity: &str) -> Result<ImpuDump> {
        let now = self.now();
        self.domain(domain)?
            .with_impu(identity, |r| ImpuDump::build(r, &self.shared.contacts, now))
    }

    fn update_impu(&self, domain: &str, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.domain(domain)?.update(identity, info)
    }

    fn delete_impu(&self, domain: &str, identity: &str) -> Result<()> {
        self.domain(domain)?.delete(identity)
    }

    fn insert_contact(&self, uri: &str, info: &ContactInfo) -> Result<ContactHandle> {
        self.shared.contacts.insert(uri, info)
    }

    fn get_contact(&self, uri: &str, discriminator: Option<&str>) -> Option<ContactHandle> {
        self.shared.contacts.find(uri, discriminator)
    }

    fn release_contact(&self, contact: ContactHandle) -> Result<i32> {
        self.shared.contacts.release(contact)
    }

    fn update_contact(&self, contact: ContactHandle, info: &ContactInfo) -> Result<()> {
        self.shared.contacts.update(contact, info)
    }

    fn expire_contact(&self, contact: ContactHandle) -> Result<()> {
        self.shared.contacts.mark_expired(contact)
    }

    fn delete_contact(&self, contact: ContactHandle) -> Result<()> {
        self.shared
            .contacts
            .delete(contact, self.shared.persistence.as_ref())
    }

    fn link_contact(&self, domain: &str, identity: &str, contact: ContactHandle, persist: bool) -> Result<()> {
        self.domain(domain)?.link_contact(identity, contact, persist)
    }

    fn unlink_contact(&self, domain: &str, identity: &str, contact: ContactHandle, persist: bool) -> Result<()> {
        self.domain(domain)?.unlink_contact(identity, contact, persist)
    }

    fn linked_identities(&self, domain: &str, identity: &str, filter: BarringFilter) -> Result<IdentityList> {
        self.domain(domain)?.linked_identities(identity, filter)
    }

    fn snapshot_contacts(&self, buf: &mut [u8], flags: u32, shard: usize, shards: usize) -> Result<Snapshot> {
        self.shared.contacts.snapshot(buf, flags, shard, shards)
    }

    fn register_callback(
        &self,
        target: CallbackTarget<'_>,
        mask: EventType,
        listener: Arc<dyn UsrlocListener>,
    ) -> Result<()> {
        Usrloc::register_callback(self, target, mask, listener)
    }

    fn total_users(&self) -> usize {
        Usrloc::total_users(self)
    }
}

impl Usrloc {
    /// Full state of one IMPU.
    pub fn dump_impu(&self, domain: &str, identity: &str) -> Result<ImpuDump> {
        UsrlocApi::get_impu(self, domain, identity)
    }

    /// Per-domain occupancy, newest domain first.
    pub fn domain_stats(&self) -> Vec<DomainStats> {
        self.domains
            .all()
            .iter()
            .map(|d| DomainStats::build(d, &self.shared.contacts))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_through_requires_db() {
        let cfg = UsrlocConfig::small().with_db_mode(DbMode::WriteThrough);
        assert!(matches!(Usrloc::init(cfg.clone()), Err(UsrlocError::Invalid(_))));
        let ul = Usrloc::builder(cfg)
            .with_db(Arc::new(MemoryUsrlocDb::new()))
            .build()
            .unwrap();
        assert!(ul.persistence().is_some());
    }

    #[test]
    fn invalid_config_is_fatal() {
        let cfg = UsrlocConfig::small().with_contacts_per_impu_cap(0);
        assert!(Usrloc::init(cfg).is_err());
    }

    #[test]
    fn usrloc_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Usrloc>();
        assert_send_sync::<UDomain>();
        assert_send_sync::<ContactStore>();
    }

    #[test]
    fn callback_targets_route() {
        let ul = Usrloc::init(UsrlocConfig::small()).unwrap();
        let domain = ul.register_udomain("location").unwrap();
        domain
            .insert("sip:a@x", &ImpuInfo::new(RegState::Registered))
            .unwrap();
        let listener: Arc<dyn UsrlocListener> = Arc::new(|_: &UsrlocEvent<'_>| {});

        ul.register_callback(CallbackTarget::Global, EventType::IMPU_INSERT, listener.clone())
            .unwrap();
        ul.register_callback(
            CallbackTarget::Impu {
                domain: "location",
                identity: "sip:a@x",
            },
            EventType::IMPU_UPDATE,
            listener.clone(),
        )
        .unwrap();
        assert_eq!(
            ul.register_callback(
                CallbackTarget::Impu {
                    domain: "nowhere",
                    identity: "sip:a@x",
                },
                EventType::IMPU_UPDATE,
                listener,
            ),
            Err(UsrlocError::NotFound("domain"))
        );
    }
}
