// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-domain IMPU table.
//!
//! Records live in hash buckets addressed by `hash(identity) & (size - 1)`;
//! each bucket has its own mutex and keeps records in insertion order. All
//! mutation goes through an [`ImpuSlotGuard`], which holds the bucket lock for
//! its lifetime. When a record operation needs a contact it takes the contact
//! slot lock while already holding the IMPU bucket lock, never the other way
//! round.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::MutexGuard;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use crate::callbacks::{is_contact_mask, EventType, UsrlocEvent, UsrlocListener};
use crate::config::MaxContactBehaviour;
use crate::contact::{Contact, ContactHandle, ContactInfo};
use crate::error::{Result, UsrlocError};
use crate::hash::hash_str;
use crate::impurecord::{
    BarringFilter, IdentityList, ImpuInfo, ImpuRecord, RegState, RegSubscriber, SubscriberKey,
    SubscriberUpdate,
};
use crate::persist::Persistence;
use crate::slot::{Slot, SlotTable};
use crate::Shared;

#[derive(Default)]
pub struct ImpuBucket {
    pub(crate) records: Vec<ImpuRecord>,
}

impl ImpuBucket {
    fn position(&self, identity: &str) -> Option<usize> {
        let hash = hash_str(identity);
        self.records
            .iter()
            .position(|r| r.aorhash == hash && r.public_identity == identity)
    }

    pub fn records(&self) -> &[ImpuRecord] {
        &self.records
    }
}

/// A named IMPU table.
pub struct UDomain {
    name: SmolStr,
    slots: SlotTable<Slot<ImpuBucket>>,
    users: AtomicUsize,
    max_depth: AtomicUsize,
    pub(crate) shared: Arc<Shared>,
}

impl UDomain {
    pub(crate) fn new(name: &str, shared: Arc<Shared>) -> Result<Self> {
        let size = shared.config.impu_slots();
        info!(domain = name, slots = size, "creating IMPU domain");
        Ok(Self {
            name: SmolStr::new(name),
            slots: SlotTable::new(size, |_| Slot::default())?,
            users: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            shared,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Records currently held.
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Relaxed)
    }

    /// Deepest bucket seen by the last insert or sweep.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    pub fn slot_of(&self, identity: &str) -> usize {
        self.slots.index_of(hash_str(identity))
    }

    /// Times the bucket holding `identity` has been locked.
    pub fn slot_acquisitions(&self, identity: &str) -> u64 {
        self.slots.slot_for(hash_str(identity)).acquisitions()
    }

    /// Locks the bucket `identity` hashes to.
    pub fn lock(&self, identity: &str) -> ImpuSlotGuard<'_> {
        let hash = hash_str(identity);
        ImpuSlotGuard {
            domain: self,
            index: self.slots.index_of(hash),
            bucket: self.slots.slot_for(hash).lock(),
        }
    }

    /// Locks a bucket by index.
    pub fn lock_slot(&self, index: usize) -> Option<ImpuSlotGuard<'_>> {
        let slot = self.slots.slot(index)?;
        Some(ImpuSlotGuard {
            domain: self,
            index,
            bucket: slot.lock(),
        })
    }

    pub(crate) fn note_depth(&self, depth: usize) {
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub(crate) fn reset_depth(&self, depth: usize) {
        self.max_depth.store(depth, Ordering::Relaxed);
    }

    fn write_through(&self) -> Option<&Persistence> {
        self.shared.persistence.as_ref()
    }

    pub fn insert(&self, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.lock(identity).insert(identity, info)
    }

    /// Runs `f` on the record under its bucket lock.
    pub fn with_impu<R>(&self, identity: &str, f: impl FnOnce(&ImpuRecord) -> R) -> Result<R> {
        let guard = self.lock(identity);
        let record = guard.get(identity).ok_or(UsrlocError::NotFound("impu"))?;
        Ok(f(record))
    }

    pub fn exists(&self, identity: &str) -> bool {
        self.lock(identity).get(identity).is_some()
    }

    pub fn update(&self, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.lock(identity).update(identity, info)
    }

    pub fn delete(&self, identity: &str) -> Result<()> {
        self.lock(identity).delete(identity)
    }

    pub fn link_contact(&self, identity: &str, contact: ContactHandle, persist: bool) -> Result<()> {
        self.lock(identity).link_contact(identity, contact, persist)
    }

    pub fn unlink_contact(&self, identity: &str, contact: ContactHandle, persist: bool) -> Result<()> {
        self.lock(identity).unlink_contact(identity, contact, persist)
    }

    pub fn add_contact(&self, identity: &str, uri: &str, info: &ContactInfo) -> Result<ContactHandle> {
        self.lock(identity).add_contact(identity, uri, info)
    }

    pub fn update_contact(&self, identity: &str, contact: ContactHandle, info: &ContactInfo) -> Result<()> {
        self.lock(identity).update_contact(identity, contact, info)
    }

    pub fn linked_identities(&self, identity: &str, filter: BarringFilter) -> Result<IdentityList> {
        self.lock(identity).linked_identities(identity, filter)
    }

    pub fn add_subscriber(&self, identity: &str, subscriber: RegSubscriber) -> Result<()> {
        self.lock(identity).add_subscriber(identity, subscriber)
    }

    pub fn get_subscriber(&self, identity: &str, key: &SubscriberKey<'_>) -> Option<RegSubscriber> {
        self.lock(identity).get_subscriber(identity, key).cloned()
    }

    pub fn update_subscriber(
        &self,
        identity: &str,
        key: &SubscriberKey<'_>,
        update: &SubscriberUpdate,
    ) -> Result<()> {
        self.lock(identity).update_subscriber(identity, key, update)
    }

    pub fn delete_subscriber(&self, identity: &str, key: &SubscriberKey<'_>) -> Result<RegSubscriber> {
        self.lock(identity).delete_subscriber(identity, key)
    }

    pub fn register_callback(
        &self,
        identity: &str,
        mask: EventType,
        listener: Arc<dyn UsrlocListener>,
    ) -> Result<()> {
        self.lock(identity).register_callback(identity, mask, listener)
    }

    /// Visits every bucket in order under its lock.
    pub fn for_each_slot(&self, mut f: impl FnMut(usize, &[ImpuRecord])) {
        for (index, slot) in self.slots.iter() {
            let bucket = slot.lock();
            f(index, &bucket.records);
        }
    }

    pub(crate) fn slots(&self) -> &SlotTable<Slot<ImpuBucket>> {
        &self.slots
    }

    /// Removes the record at `index`, firing `IMPU_DELETE` first.
    pub(crate) fn remove_at(
        &self,
        bucket: &mut ImpuBucket,
        index: usize,
        db: Option<&Persistence>,
    ) -> Option<ImpuRecord> {
        let record = bucket.records.get(index)?;
        record
            .callbacks
            .fire(&UsrlocEvent::impu(EventType::IMPU_DELETE, record));
        if let Some(db) = db {
            if let Err(err) = db.delete_impu(&record.public_identity) {
                db.degraded("impu delete", &record.public_identity, &err);
            }
        }
        let record = bucket.records.remove(index);
        for handle in record.contacts.as_slice() {
            if let Err(err) = self.shared.contacts.release(*handle) {
                warn!(impu = %record.public_identity, contact = %handle, error = %err, "linked contact vanished");
            }
        }
        self.users.fetch_sub(1, Ordering::Relaxed);
        self.shared.metrics.record_impu_deleted();
        debug!(impu = %record.public_identity, domain = %self.name, "impu deleted");
        Some(record)
    }

    /// Unlinks the contact at `index`, firing `kind` on the record first.
    pub(crate) fn unlink_at(
        &self,
        record: &mut ImpuRecord,
        index: usize,
        db: Option<&Persistence>,
        kind: EventType,
    ) -> Option<ContactHandle> {
        let handle = record.contacts.get(index)?;
        let snapshot = if record.callbacks.wants(kind) || db.is_some() {
            self.shared.contacts.get(handle).ok()
        } else {
            None
        };
        fire_with_contact(record, kind, snapshot.as_ref());
        record.contacts.remove_at(index);

        if let Err(err) = self.shared.contacts.release(handle) {
            warn!(impu = %record.public_identity, contact = %handle, error = %err, "unlinked contact vanished");
        }
        if let (Some(db), Some(contact)) = (db, snapshot.as_ref()) {
            if let Err(err) = db.unlink(&record.public_identity, contact.uri()) {
                db.degraded("impu_contact delete", &record.public_identity, &err);
            }
        }
        self.shared.metrics.record_contact_unlinked();
        Some(handle)
    }
}

fn fire_with_contact(record: &ImpuRecord, kind: EventType, contact: Option<&Contact>) {
    let event = UsrlocEvent {
        kind,
        impu: Some(record),
        contact,
    };
    record.callbacks.fire(&event);
}

/// Exclusive access to one IMPU bucket.
pub struct ImpuSlotGuard<'a> {
    domain: &'a UDomain,
    index: usize,
    bucket: MutexGuard<'a, ImpuBucket>,
}

impl<'a> ImpuSlotGuard<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn records(&self) -> &[ImpuRecord] {
        &self.bucket.records
    }

    fn check(&self, identity: &str) -> Result<()> {
        if self.domain.slot_of(identity) != self.index {
            return Err(UsrlocError::Invalid(format!(
                "{} does not belong to locked slot {}",
                identity, self.index
            )));
        }
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<&ImpuRecord> {
        let pos = self.bucket.position(identity)?;
        self.bucket.records.get(pos)
    }

    fn record_mut(&mut self, identity: &str) -> Result<&mut ImpuRecord> {
        self.check(identity)?;
        let pos = self
            .bucket
            .position(identity)
            .ok_or(UsrlocError::NotFound("impu"))?;
        Ok(&mut self.bucket.records[pos])
    }

    fn persistence(&self) -> Option<&'a Persistence> {
        self.domain.write_through()
    }

    /// Creates a record. Fails with `Invalid` if the identity already exists.
    pub fn insert(&mut self, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.insert_inner(identity, info, true)
    }

    /// Inserts a record read back from the database without writing it again.
    pub(crate) fn load(&mut self, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.insert_inner(identity, info, false)
    }

    fn insert_inner(&mut self, identity: &str, info: &ImpuInfo, persist: bool) -> Result<()> {
        self.check(identity)?;
        if self.bucket.position(identity).is_some() {
            return Err(UsrlocError::Invalid(format!("{} already exists", identity)));
        }
        let shared = &self.domain.shared;
        let mut record = ImpuRecord::new(
            self.domain.name.clone(),
            identity,
            info,
            shared.config.contacts_per_impu_cap,
        )?;
        if record.reg_state == RegState::Unregistered {
            record.expires = shared.clock.now() + shared.config.unreg_validity;
        }
        if let Some(cell) = &info.subscription {
            record.subscription = Some(shared.subscriptions.resolve(cell));
        }
        self.bucket.records.try_reserve(1)?;
        self.bucket.records.push(record);
        self.domain.users.fetch_add(1, Ordering::Relaxed);
        self.domain.note_depth(self.bucket.records.len());
        shared.metrics.record_impu_inserted();

        let record = &self.bucket.records[self.bucket.records.len() - 1];
        debug!(impu = %identity, state = %record.reg_state, domain = %self.domain.name, "impu inserted");
        if let Some(db) = self.persistence().filter(|_| persist) {
            if let Err(err) = db.store_impu(record) {
                db.degraded("impu insert", identity, &err);
            }
        }
        shared
            .global
            .fire(&UsrlocEvent::impu(EventType::IMPU_INSERT, record));
        Ok(())
    }

    /// Updates a record, creating it when absent if the new state is a
    /// registration and a subscription is supplied.
    pub fn update(&mut self, identity: &str, info: &ImpuInfo) -> Result<()> {
        self.check(identity)?;
        if self.bucket.position(identity).is_none() {
            if info.reg_state != RegState::NotRegistered && info.subscription.is_some() {
                return self.insert(identity, info);
            }
            return Err(UsrlocError::NotFound("impu"));
        }

        let shared = Arc::clone(&self.domain.shared);
        let db = self.persistence();
        let now = shared.clock.now();
        let record = self.record_mut(identity)?;

        record.reg_state = info.reg_state;
        record.expires = match info.reg_state {
            RegState::Unregistered => now + shared.config.unreg_validity,
            _ => 0,
        };
        if let Some(barring) = info.barring {
            record.barring = barring;
        }
        if info.is_primary {
            record.is_primary = true;
        }
        if let Some(charging) = &info.charging {
            record.charging.clone_from(charging);
        }
        if let Some(new) = &info.subscription {
            let new = shared.subscriptions.resolve(new);
            let same = record
                .subscription
                .as_ref()
                .is_some_and(|old| Arc::ptr_eq(old, &new));
            if !same {
                // Dropping the old Arc releases this record's hold on it.
                record.subscription = Some(new);
            }
        }

        record
            .callbacks
            .fire(&UsrlocEvent::impu(EventType::IMPU_UPDATE, record));
        if let Some(db) = db {
            if let Err(err) = db.store_impu(record) {
                db.degraded("impu update", identity, &err);
            }
        }
        Ok(())
    }

    /// Deletes a record and releases every contact it links.
    pub fn delete(&mut self, identity: &str) -> Result<()> {
        self.check(identity)?;
        let pos = self
            .bucket
            .position(identity)
            .ok_or(UsrlocError::NotFound("impu"))?;
        let db = self.persistence();
        self.domain.remove_at(&mut self.bucket, pos, db);
        Ok(())
    }

    /// Links an existing contact to the record, taking a reference on it.
    pub fn link_contact(&mut self, identity: &str, contact: ContactHandle, persist: bool) -> Result<()> {
        let domain = self.domain;
        let shared = Arc::clone(&domain.shared);
        let db = self.persistence().filter(|_| persist);
        let record = self.record_mut(identity)?;
        if record.contacts.contains(contact) {
            return Ok(());
        }

        let limit = shared.config.contact_limit();
        let evict = record.contacts.len() >= limit;
        if evict {
            match shared.config.max_contact_behaviour {
                MaxContactBehaviour::OverwriteOldest if !record.contacts.is_empty() => {}
                _ => {
                    debug!(impu = %identity, limit, "contact limit reached, rejecting");
                    return Err(UsrlocError::TooManyContacts { limit });
                }
            }
        }

        // Take the reference first so a stale handle fails before eviction.
        shared.contacts.adjust_ref(contact, 1)?;
        if evict {
            debug!(impu = %identity, limit, "contact limit reached, evicting oldest");
            domain.unlink_at(record, 0, db, EventType::IMPU_DELETE_CONTACT);
            shared.metrics.record_contact_evicted();
        }
        if let Err(err) = record.contacts.push(contact) {
            if let Err(release) = shared.contacts.release(contact) {
                warn!(impu = %identity, error = %release, "failed to drop reference after link failure");
            }
            return Err(err);
        }
        shared.metrics.record_contact_linked();

        if let Some(db) = db {
            match shared.contacts.with_contact(contact, |c| db.link(identity, c.uri())) {
                Ok(Err(err)) => db.degraded("impu_contact insert", identity, &err),
                Ok(Ok(())) | Err(_) => {}
            }
        }
        Ok(())
    }

    /// Unlinks a contact from the record and drops the record's reference.
    pub fn unlink_contact(&mut self, identity: &str, contact: ContactHandle, persist: bool) -> Result<()> {
        let domain = self.domain;
        let db = self.persistence().filter(|_| persist);
        let record = self.record_mut(identity)?;
        let index = record
            .contacts
            .position(contact)
            .ok_or(UsrlocError::NotFound("linked contact"))?;
        domain.unlink_at(record, index, db, EventType::IMPU_DELETE_CONTACT);
        Ok(())
    }

    /// Creates a contact and links it to the record in one step.
    ///
    /// On success the record holds the only reference to the new contact.
    pub fn add_contact(&mut self, identity: &str, uri: &str, info: &ContactInfo) -> Result<ContactHandle> {
        let shared = Arc::clone(&self.domain.shared);
        let db = self.persistence();
        self.record_mut(identity)?;

        let handle = shared.contacts.insert(uri, info)?;
        if let Err(err) = self.link_contact(identity, handle, false) {
            if let Err(cleanup) = shared.contacts.delete(handle, None) {
                warn!(impu = %identity, contact = %uri, error = %cleanup, "failed to roll back contact after link failure");
            }
            return Err(err);
        }
        shared.contacts.release(handle)?;

        let snapshot = shared.contacts.get(handle).ok();
        if let (Some(db), Some(contact)) = (db, snapshot.as_ref()) {
            if let Err(err) = db.store_contact(contact) {
                db.degraded("contact insert", uri, &err);
            }
            if let Err(err) = db.link(identity, uri) {
                db.degraded("impu_contact insert", identity, &err);
            }
        }
        let record = self.record_mut(identity)?;
        fire_with_contact(record, EventType::IMPU_NEW_CONTACT, snapshot.as_ref());
        Ok(handle)
    }

    /// Updates a linked contact in place.
    pub fn update_contact(&mut self, identity: &str, contact: ContactHandle, info: &ContactInfo) -> Result<()> {
        let shared = Arc::clone(&self.domain.shared);
        let db = self.persistence();
        let record = self.record_mut(identity)?;
        if !record.contacts.contains(contact) {
            return Err(UsrlocError::NotFound("linked contact"));
        }
        shared.contacts.update(contact, info)?;
        let snapshot = shared.contacts.get(contact).ok();
        if let (Some(db), Some(c)) = (db, snapshot.as_ref()) {
            if let Err(err) = db.store_contact(c) {
                db.degraded("contact update", c.uri(), &err);
            }
        }
        fire_with_contact(record, EventType::IMPU_UPDATE_CONTACT, snapshot.as_ref());
        Ok(())
    }

    pub fn linked_identities(&self, identity: &str, filter: BarringFilter) -> Result<IdentityList> {
        self.get(identity)
            .ok_or(UsrlocError::NotFound("impu"))?
            .linked_identities(filter)
    }

    /// Adds a reg-event subscriber, replacing one with the same key.
    pub fn add_subscriber(&mut self, identity: &str, subscriber: RegSubscriber) -> Result<()> {
        let record = self.record_mut(identity)?;
        match record.find_subscriber(&subscriber.key()) {
            Some(pos) => record.subscribers[pos] = subscriber,
            None => {
                record.subscribers.try_reserve(1)?;
                record.subscribers.push(subscriber);
            }
        }
        Ok(())
    }

    pub fn get_subscriber(&self, identity: &str, key: &SubscriberKey<'_>) -> Option<&RegSubscriber> {
        let record = self.get(identity)?;
        let pos = record.find_subscriber(key)?;
        record.subscribers.get(pos)
    }

    pub fn update_subscriber(
        &mut self,
        identity: &str,
        key: &SubscriberKey<'_>,
        update: &SubscriberUpdate,
    ) -> Result<()> {
        let record = self.record_mut(identity)?;
        let pos = record
            .find_subscriber(key)
            .ok_or(UsrlocError::NotFound("subscriber"))?;
        let sub = &mut record.subscribers[pos];
        if let Some(expires) = update.expires {
            sub.expires = expires;
        }
        if let Some(version) = update.version {
            sub.version = version;
        }
        if let Some(cseq) = update.local_cseq {
            sub.local_cseq = cseq;
        }
        if let Some(tag) = &update.to_tag {
            sub.to_tag.clone_from(tag);
        }
        Ok(())
    }

    pub fn delete_subscriber(&mut self, identity: &str, key: &SubscriberKey<'_>) -> Result<RegSubscriber> {
        let record = self.record_mut(identity)?;
        let pos = record
            .find_subscriber(key)
            .ok_or(UsrlocError::NotFound("subscriber"))?;
        Ok(record.subscribers.remove(pos))
    }

    /// Attaches a listener to the record. The mask must hold IMPU events
    /// other than `IMPU_INSERT`.
    pub fn register_callback(
        &mut self,
        identity: &str,
        mask: EventType,
        listener: Arc<dyn UsrlocListener>,
    ) -> Result<()> {
        if is_contact_mask(mask) {
            return Err(UsrlocError::Invalid(format!(
                "{:?} is not an IMPU event mask",
                mask
            )));
        }
        self.record_mut(identity)?.callbacks.register(mask, listener)
    }
}
