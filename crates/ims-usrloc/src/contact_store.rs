// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide contact table.
//!
//! The store is the single owner of every [`Contact`]. IMPU records hold
//! [`ContactHandle`]s and account for them through the contact's reference
//! count, which is only touched under the owning slot's lock. Contacts are
//! physically removed by [`ContactStore::sweep`] once the count drops to zero,
//! or by an explicit [`ContactStore::delete`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut};
use tracing::{debug, error, warn};

use crate::callbacks::{is_contact_mask, EventType, GlobalCallbacks, UsrlocEvent, UsrlocListener};
use crate::clock::Clock;
use crate::config::MatchingMode;
use crate::contact::{Contact, ContactHandle, ContactInfo};
use crate::dialog::{DialogApi, DialogEvents, DialogRef};
use crate::error::{Result, UsrlocError};
use crate::hash::hash_str;
use crate::persist::Persistence;
use crate::slot::{RecursiveSlot, SlotTable};

#[derive(Default)]
pub(crate) struct ContactBucket {
    entries: VecDeque<Contact>,
}

impl ContactBucket {
    fn get(&self, id: u64) -> Option<&Contact> {
        self.entries.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: u64) -> Option<&mut Contact> {
        self.entries.iter_mut().find(|c| c.id == id)
    }

    fn remove(&mut self, id: u64) -> Option<Contact> {
        let pos = self.entries.iter().position(|c| c.id == id)?;
        self.entries.remove(pos)
    }
}

type ContactSlot = RecursiveSlot<ContactBucket>;

/// Outcome of a bulk export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    /// Every matching contact was written, followed by the end marker.
    Complete { written: usize, contacts: usize },
    /// The buffer was this many bytes too small; retry with a larger one.
    Shortage(usize),
}

/// Contacts removed by one contact pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactPassReport {
    pub deleted: usize,
    pub expired: usize,
    pub max_depth: usize,
}

pub struct ContactStore {
    slots: SlotTable<ContactSlot>,
    matching: MatchingMode,
    next_id: AtomicU64,
    count: AtomicUsize,
    max_depth: AtomicUsize,
    dialogs: Arc<dyn DialogApi>,
    global: Arc<GlobalCallbacks>,
    clock: Arc<dyn Clock>,
}

impl ContactStore {
    pub fn new(
        size: usize,
        matching: MatchingMode,
        dialogs: Arc<dyn DialogApi>,
        global: Arc<GlobalCallbacks>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            slots: SlotTable::new(size, |_| RecursiveSlot::default())?,
            matching,
            next_id: AtomicU64::new(1),
            count: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            dialogs,
            global,
            clock,
        })
    }

    pub fn matching_mode(&self) -> MatchingMode {
        self.matching
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of contacts currently in the table, including unreferenced ones.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deepest bucket seen by the last insert or sweep.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    /// Slot index a URI hashes to under the configured matching mode.
    pub fn slot_of(&self, uri: &str) -> usize {
        self.slots.index_of(hash_str(self.bucket_key(uri)))
    }

    /// Times the slot holding `uri` has been locked.
    pub fn slot_acquisitions(&self, uri: &str) -> u64 {
        self.slots.slot_for(hash_str(self.bucket_key(uri))).acquisitions()
    }

    fn bucket_key<'a>(&self, uri: &'a str) -> &'a str {
        match self.matching {
            MatchingMode::ContactPortIpOnly => host_port(uri),
            _ => uri,
        }
    }

    fn slot(&self, handle: ContactHandle) -> Result<&ContactSlot> {
        self.slots
            .slot(handle.slot)
            .ok_or(UsrlocError::NotFound("contact"))
    }

    /// Creates a contact with one reference held by the caller.
    pub fn insert(&self, uri: &str, info: &ContactInfo) -> Result<ContactHandle> {
        if uri.is_empty() {
            return Err(UsrlocError::Invalid("empty contact uri".into()));
        }
        let hash = hash_str(self.bucket_key(uri));
        let index = self.slots.index_of(hash);
        let slot = self.slots.slot_for(hash);
        let guard = slot.lock();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let contact = Contact::create(id, index, hash, uri, info)?;
        let handle = contact.handle();
        {
            let mut bucket = guard.borrow_mut();
            bucket.entries.try_reserve(1)?;
            bucket.entries.push_front(contact);
            self.max_depth
                .fetch_max(bucket.entries.len(), Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        debug!(contact = %uri, slot = index, "contact inserted");

        if self.global.wants(EventType::CONTACT_INSERT) {
            let snapshot = guard.borrow().get(id).cloned();
            if let Some(contact) = snapshot {
                self.global
                    .fire(&UsrlocEvent::contact(EventType::CONTACT_INSERT, &contact));
            }
        }
        Ok(handle)
    }

    /// Finds a live contact and takes a reference on it.
    ///
    /// `discriminator` is the Call-ID or Path depending on the matching mode.
    pub fn find(&self, uri: &str, discriminator: Option<&str>) -> Option<ContactHandle> {
        let now = self.clock.now();
        let key = self.bucket_key(uri);
        let slot = self.slots.slot_for(hash_str(key));
        let guard = slot.lock();
        let mut bucket = guard.borrow_mut();
        let contact = bucket
            .entries
            .iter_mut()
            .filter(|c| c.is_valid(now))
            .find(|c| self.matches(c, uri, key, discriminator))?;
        contact.ref_count += 1;
        Some(contact.handle())
    }

    fn matches(&self, c: &Contact, uri: &str, key: &str, discriminator: Option<&str>) -> bool {
        match self.matching {
            MatchingMode::ContactOnly => c.uri == uri,
            MatchingMode::ContactCallid => {
                c.uri == uri && c.call_id == discriminator.unwrap_or_default()
            }
            MatchingMode::ContactPath => match discriminator {
                Some(path) if !path.is_empty() => {
                    c.uri == uri && c.path.as_deref().unwrap_or_default() == path
                }
                _ => c.uri == uri,
            },
            MatchingMode::ContactPortIpOnly => host_port(&c.uri) == key,
        }
    }

    /// Drops a reference taken by `insert`, `find` or a link.
    pub fn release(&self, handle: ContactHandle) -> Result<i32> {
        self.adjust_ref(handle, -1)
    }

    pub(crate) fn adjust_ref(&self, handle: ContactHandle, delta: i32) -> Result<i32> {
        let guard = self.slot(handle)?.lock();
        let mut bucket = guard.borrow_mut();
        let contact = bucket
            .get_mut(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?;
        contact.ref_count += delta;
        if contact.ref_count < 0 {
            warn!(contact = %contact.uri, refs = contact.ref_count, "contact reference count went negative");
        }
        Ok(contact.ref_count)
    }

    /// Runs `f` on the contact under its slot lock. `f` must not call back
    /// into the store.
    pub(crate) fn with_contact<R>(&self, handle: ContactHandle, f: impl FnOnce(&Contact) -> R) -> Result<R> {
        let guard = self.slot(handle)?.lock();
        let bucket = guard.borrow();
        let contact = bucket
            .get(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?;
        Ok(f(contact))
    }

    /// Copy of the contact's current state.
    pub fn get(&self, handle: ContactHandle) -> Result<Contact> {
        self.with_contact(handle, Contact::clone)
    }

    /// Updates the contact in place and fires `CONTACT_UPDATE`.
    pub fn update(&self, handle: ContactHandle, info: &ContactInfo) -> Result<()> {
        let guard = self.slot(handle)?.lock();
        guard
            .borrow_mut()
            .get_mut(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?
            .apply(info)?;
        fire_contact(&guard, handle.id, EventType::CONTACT_UPDATE);
        Ok(())
    }

    /// Marks the contact expired as of now without removing it.
    pub fn mark_expired(&self, handle: ContactHandle) -> Result<()> {
        let now = self.clock.now();
        let guard = self.slot(handle)?.lock();
        guard
            .borrow_mut()
            .get_mut(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?
            .expires = now;
        fire_contact(&guard, handle.id, EventType::CONTACT_EXPIRE);
        Ok(())
    }

    /// Removes the contact regardless of its reference count, tearing down
    /// any dialogs recorded on it. With `db` the contact row goes too.
    pub fn delete(&self, handle: ContactHandle, db: Option<&Persistence>) -> Result<()> {
        let guard = self.slot(handle)?.lock();
        let removed = guard
            .borrow_mut()
            .remove(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        if removed.ref_count > 0 {
            debug!(contact = %removed.uri, refs = removed.ref_count, "deleting referenced contact");
        }
        let db = db.filter(|_| !row_still_used(&guard, &removed.uri));
        self.dispose(removed, EventType::CONTACT_DELETE, db);
        drop(guard);
        Ok(())
    }

    // Called with the slot lock held and no RefCell borrow outstanding.
    fn dispose(&self, contact: Contact, kind: EventType, db: Option<&Persistence>) {
        if let Some(db) = db {
            if let Err(err) = db.delete_contact(&contact.uri) {
                db.degraded("contact delete", &contact.uri, &err);
            }
        }
        for dialog in &contact.dialogs {
            if !self.dialogs.terminate_dialog(*dialog) {
                debug!(contact = %contact.uri, dialog = %dialog, "dialog already gone");
            }
        }
        contact
            .callbacks
            .fire(&UsrlocEvent::contact(kind, &contact));
    }

    /// Attaches a listener to one contact. The mask must be contact-class and
    /// must not include `CONTACT_INSERT`.
    pub fn register_callback(
        &self,
        handle: ContactHandle,
        mask: EventType,
        listener: Arc<dyn UsrlocListener>,
    ) -> Result<()> {
        if !is_contact_mask(mask) {
            return Err(UsrlocError::Invalid(format!(
                "{:?} is not a contact event mask",
                mask
            )));
        }
        let guard = self.slot(handle)?.lock();
        let mut bucket = guard.borrow_mut();
        bucket
            .get_mut(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?
            .callbacks
            .register(mask, listener)
    }

    /// Records a confirmed dialog on the contact and asks the dialog module to
    /// tell us when it ends.
    pub fn track_dialog(self: &Arc<Self>, handle: ContactHandle, dialog: DialogRef) -> Result<()> {
        {
            let guard = self.slot(handle)?.lock();
            let mut bucket = guard.borrow_mut();
            let contact = bucket
                .get_mut(handle.id)
                .ok_or(UsrlocError::NotFound("contact"))?;
            if contact.dialogs.contains(&dialog) {
                return Ok(());
            }
            contact.dialogs.try_reserve(1)?;
            contact.dialogs.push(dialog);
        }

        let store: Weak<ContactStore> = Arc::downgrade(self);
        let registered = self.dialogs.register_dialog_callback(
            dialog,
            DialogEvents::TERMINATED | DialogEvents::FAILED | DialogEvents::EXPIRED,
            Arc::new(move |dialog, _events| {
                if let Some(store) = store.upgrade() {
                    match store.untrack_dialog(handle, dialog) {
                        Ok(_) => {}
                        Err(UsrlocError::NotFound(_)) => {
                            debug!(dialog = %dialog, "dialog ended after its contact was removed")
                        }
                        Err(err) => warn!(dialog = %dialog, error = %err, "failed to untrack dialog"),
                    }
                }
            }),
        );
        if !registered {
            debug!(dialog = %dialog, "dialog callback not registered");
        }
        Ok(())
    }

    /// Forgets a dialog; returns whether it was recorded.
    pub fn untrack_dialog(&self, handle: ContactHandle, dialog: DialogRef) -> Result<bool> {
        let guard = self.slot(handle)?.lock();
        let mut bucket = guard.borrow_mut();
        let contact = bucket
            .get_mut(handle.id)
            .ok_or(UsrlocError::NotFound("contact"))?;
        let before = contact.dialogs.len();
        contact.dialogs.retain(|d| *d != dialog);
        Ok(contact.dialogs.len() != before)
    }

    /// Visits every contact, one slot lock at a time.
    pub fn for_each(&self, mut f: impl FnMut(&Contact)) {
        for (_, slot) in self.slots.iter() {
            let guard = slot.lock();
            let bucket = guard.borrow();
            bucket.entries.iter().for_each(&mut f);
        }
    }

    /// Contact pass of the periodic sweep: deletes every contact no IMPU
    /// references any more, and its row when `db` is given.
    pub fn sweep(&self, now: i64, db: Option<&Persistence>) -> ContactPassReport {
        let mut report = ContactPassReport::default();
        for (index, slot) in self.slots.iter() {
            let guard = slot.lock();
            let dead: Vec<Contact> = {
                let mut bucket = guard.borrow_mut();
                report.max_depth = report.max_depth.max(bucket.entries.len());
                if bucket.entries.iter().all(|c| c.ref_count > 0) {
                    continue;
                }
                let (dead, live): (Vec<_>, Vec<_>) =
                    bucket.entries.drain(..).partition(|c| c.ref_count <= 0);
                bucket.entries.extend(live);
                dead
            };
            for contact in dead {
                self.count.fetch_sub(1, Ordering::Relaxed);
                let kind = if contact.is_valid(now) {
                    EventType::CONTACT_DELETE
                } else {
                    report.expired += 1;
                    EventType::CONTACT_EXPIRE
                };
                debug!(contact = %contact.uri, slot = index, "reclaiming unreferenced contact");
                let db = db.filter(|_| !row_still_used(&guard, &contact.uri));
                self.dispose(contact, kind, db);
                report.deleted += 1;
            }
        }
        self.max_depth.store(report.max_depth, Ordering::Relaxed);
        report
    }

    /// Exports contacts of one shard into `buf`.
    ///
    /// Each entry is `u32 len, uri, u16 len, socket, u32 cflags, u32 len,
    /// path` (little-endian) and the list ends with a zero `u32`. Only
    /// contacts whose cflags contain every bit of `flags` are exported. If the
    /// buffer is too small nothing partial is written and the shortfall is
    /// returned instead.
    pub fn snapshot(
        &self,
        buf: &mut [u8],
        flags: u32,
        shard: usize,
        shards: usize,
    ) -> Result<Snapshot> {
        if shards == 0 || shard >= shards {
            return Err(UsrlocError::Invalid(format!(
                "shard {} of {} is out of range",
                shard, shards
            )));
        }
        let capacity = buf.len();
        let mut out = &mut buf[..];
        let mut required = 0usize;
        let mut contacts = 0usize;
        let mut full = false;

        for (_, slot) in self.slots.iter().filter(|(i, _)| i % shards == shard) {
            let guard = slot.lock();
            let bucket = guard.borrow();
            for contact in bucket.entries.iter() {
                if contact.cflags & flags != flags {
                    continue;
                }
                let sock = contact.sock.map(|s| s.to_string()).unwrap_or_default();
                let path = contact.path.as_deref().unwrap_or_default();
                let need = 4 + contact.uri.len() + 2 + sock.len() + 4 + 4 + path.len();
                required += need;
                if full || out.remaining_mut() < need + END_MARKER_LEN {
                    full = true;
                    continue;
                }
                out.put_u32_le(contact.uri.len() as u32);
                out.put_slice(contact.uri.as_bytes());
                out.put_u16_le(sock.len() as u16);
                out.put_slice(sock.as_bytes());
                out.put_u32_le(contact.cflags);
                out.put_u32_le(path.len() as u32);
                out.put_slice(path.as_bytes());
                contacts += 1;
            }
        }
        required += END_MARKER_LEN;
        if out.remaining_mut() < END_MARKER_LEN {
            full = true;
        }

        if full {
            return match required.checked_sub(capacity) {
                Some(short) if short > 0 => Ok(Snapshot::Shortage(short)),
                _ => {
                    error!(required, capacity, "contact snapshot shortage accounting is inconsistent");
                    Err(UsrlocError::Invalid("snapshot shortage accounting".into()))
                }
            };
        }
        out.put_u32_le(0);
        Ok(Snapshot::Complete {
            written: required,
            contacts,
        })
    }
}

const END_MARKER_LEN: usize = 4;

// Rows are keyed by URI; another contact with the same URI keeps the row.
fn row_still_used(bucket: &RefCell<ContactBucket>, uri: &str) -> bool {
    bucket.borrow().entries.iter().any(|c| c.uri == uri)
}

// Fires the contact's own listeners on a copy so they may re-enter the store.
fn fire_contact(bucket: &RefCell<ContactBucket>, id: u64, kind: EventType) {
    let snapshot = match bucket.borrow().get(id) {
        Some(c) if c.callbacks.wants(kind) => c.clone(),
        _ => return,
    };
    snapshot
        .callbacks
        .fire(&UsrlocEvent::contact(kind, &snapshot));
}

/// `host[:port]` part of a contact URI, ignoring scheme, user and parameters.
pub fn host_port(uri: &str) -> &str {
    let s = uri.trim_start_matches('<');
    let s = s
        .strip_prefix("sips:")
        .or_else(|| s.strip_prefix("sip:"))
        .unwrap_or(s);
    let s = match s.find('@') {
        Some(at) => &s[at + 1..],
        None => s,
    };
    match s.find([';', '>']) {
        Some(end) => &s[..end],
        None => s,
    }
}

/// One exported contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry<'a> {
    pub uri: &'a str,
    pub sock: &'a str,
    pub cflags: u32,
    pub path: &'a str,
}

/// Reads entries back out of a buffer filled by [`ContactStore::snapshot`].
pub struct SnapshotIter<'a> {
    src: &'a [u8],
}

impl<'a> SnapshotIter<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src }
    }

    fn take_str(&mut self, len: usize) -> Option<&'a str> {
        if self.src.remaining() < len {
            return None;
        }
        let src: &'a [u8] = self.src;
        let (head, tail) = src.split_at(len);
        self.src = tail;
        std::str::from_utf8(head).ok()
    }
}

impl<'a> Iterator for SnapshotIter<'a> {
    type Item = SnapshotEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.src.remaining() < 4 {
            return None;
        }
        let uri_len = self.src.get_u32_le() as usize;
        if uri_len == 0 {
            self.src = &[];
            return None;
        }
        let uri = self.take_str(uri_len)?;
        if self.src.remaining() < 2 {
            return None;
        }
        let sock_len = self.src.get_u16_le() as usize;
        let sock = self.take_str(sock_len)?;
        if self.src.remaining() < 8 {
            return None;
        }
        let cflags = self.src.get_u32_le();
        let path_len = self.src.get_u32_le() as usize;
        let path = self.take_str(path_len)?;
        Some(SnapshotEntry {
            uri,
            sock,
            cflags,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dialog::{DialogCallback, NoopDialogApi};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const NOW: i64 = 1_000_000;

    fn store_with(mode: MatchingMode) -> (ContactStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = ContactStore::new(
            16,
            mode,
            Arc::new(NoopDialogApi),
            Arc::new(GlobalCallbacks::new()),
            clock.clone(),
        )
        .unwrap();
        (store, clock)
    }

    fn store() -> ContactStore {
        store_with(MatchingMode::ContactOnly).0
    }

    #[test]
    fn insert_then_find_bumps_reference() {
        let store = store();
        let h = store
            .insert("sip:alice@192.0.2.1:5060", &ContactInfo::new(NOW + 60))
            .unwrap();
        let found = store.find("sip:alice@192.0.2.1:5060", None).unwrap();
        assert_eq!(found, h);
        assert_eq!(store.get(h).unwrap().ref_count(), 2);
        assert_eq!(store.release(h).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn find_skips_expired_contacts() {
        let store = store();
        store
            .insert("sip:alice@192.0.2.1", &ContactInfo::new(NOW - 1))
            .unwrap();
        assert!(store.find("sip:alice@192.0.2.1", None).is_none());
        store
            .insert("sip:perm@192.0.2.1", &ContactInfo::new(0))
            .unwrap();
        assert!(store.find("sip:perm@192.0.2.1", None).is_some());
    }

    #[test]
    fn callid_matching_requires_same_call_id() {
        let (store, _) = store_with(MatchingMode::ContactCallid);
        store
            .insert(
                "sip:alice@192.0.2.1",
                &ContactInfo::new(NOW + 60).with_call_id("call-1", 1),
            )
            .unwrap();
        assert!(store.find("sip:alice@192.0.2.1", Some("call-2")).is_none());
        assert!(store.find("sip:alice@192.0.2.1", Some("call-1")).is_some());
    }

    #[test]
    fn path_matching_falls_back_without_path() {
        let (store, _) = store_with(MatchingMode::ContactPath);
        store
            .insert(
                "sip:alice@192.0.2.1",
                &ContactInfo::new(NOW + 60).with_path("<sip:pcscf1;lr>"),
            )
            .unwrap();
        assert!(store
            .find("sip:alice@192.0.2.1", Some("<sip:pcscf2;lr>"))
            .is_none());
        assert!(store
            .find("sip:alice@192.0.2.1", Some("<sip:pcscf1;lr>"))
            .is_some());
        assert!(store.find("sip:alice@192.0.2.1", None).is_some());
    }

    #[test]
    fn port_ip_matching_ignores_user_and_params() {
        let (store, _) = store_with(MatchingMode::ContactPortIpOnly);
        let h = store
            .insert(
                "sip:alice@192.0.2.1:5060;transport=udp",
                &ContactInfo::new(NOW + 60),
            )
            .unwrap();
        assert_eq!(store.find("<sip:bob@192.0.2.1:5060>", None), Some(h));
        assert!(store.find("sip:alice@192.0.2.1:5062", None).is_none());
    }

    #[test]
    fn host_port_strips_decorations() {
        assert_eq!(host_port("sip:alice@192.0.2.1:5060;ob"), "192.0.2.1:5060");
        assert_eq!(host_port("<sips:bob@[2001:db8::1]:5061>"), "[2001:db8::1]:5061");
        assert_eq!(host_port("sip:192.0.2.9"), "192.0.2.9");
    }

    #[test]
    fn update_reuses_buffers_and_fires_listener() {
        let store = store();
        let h = store
            .insert(
                "sip:alice@192.0.2.1",
                &ContactInfo::new(NOW + 60).with_user_agent("a much longer user agent/1.0"),
            )
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        store
            .register_callback(
                h,
                EventType::CONTACT_UPDATE,
                Arc::new(move |e: &UsrlocEvent<'_>| {
                    assert_eq!(e.contact.map(|c| c.user_agent()), Some("ua/2"));
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        store
            .update(h, &ContactInfo::new(NOW + 120).with_user_agent("ua/2"))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let c = store.get(h).unwrap();
        assert_eq!(c.expires(), NOW + 120);
        assert!(c.user_agent.capacity() >= "a much longer user agent/1.0".len());
    }

    #[test]
    fn listener_may_reenter_the_same_slot() {
        let store = Arc::new(store());
        let h = store
            .insert("sip:alice@192.0.2.1", &ContactInfo::new(NOW + 60))
            .unwrap();
        let inner = Arc::downgrade(&store);
        store
            .register_callback(
                h,
                EventType::CONTACT_EXPIRE,
                Arc::new(move |e: &UsrlocEvent<'_>| {
                    let store = inner.upgrade().unwrap();
                    let handle = e.contact.unwrap().handle();
                    store.release(handle).unwrap();
                }),
            )
            .unwrap();
        store.mark_expired(h).unwrap();
        assert_eq!(store.get(h).unwrap().ref_count(), 0);
        assert_eq!(store.get(h).unwrap().expires(), NOW);
    }

    #[test]
    fn callback_mask_must_be_contact_class() {
        let store = store();
        let h = store.insert("sip:a@b", &ContactInfo::new(0)).unwrap();
        let listener: Arc<dyn UsrlocListener> = Arc::new(|_: &UsrlocEvent<'_>| {});
        assert!(store
            .register_callback(h, EventType::IMPU_UPDATE, listener.clone())
            .is_err());
        assert!(store
            .register_callback(h, EventType::CONTACT_INSERT, listener)
            .is_err());
    }

    #[test]
    fn sweep_reclaims_only_unreferenced() {
        let store = store();
        let keep = store.insert("sip:keep@h", &ContactInfo::new(NOW + 60)).unwrap();
        let drop_me = store.insert("sip:drop@h", &ContactInfo::new(NOW - 5)).unwrap();
        store.release(drop_me).unwrap();

        let report = store.sweep(NOW, None);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.expired, 1);
        assert!(store.get(keep).is_ok());
        assert_eq!(store.get(drop_me).unwrap_err(), UsrlocError::NotFound("contact"));
        assert_eq!(store.len(), 1);
    }

    #[derive(Default)]
    struct RecordingDialogs {
        terminated: Mutex<Vec<DialogRef>>,
        callbacks: Mutex<Vec<(DialogRef, DialogCallback)>>,
    }

    impl DialogApi for RecordingDialogs {
        fn terminate_dialog(&self, dialog: DialogRef) -> bool {
            self.terminated.lock().push(dialog);
            let callbacks: Vec<_> = self
                .callbacks
                .lock()
                .iter()
                .filter(|(d, _)| *d == dialog)
                .map(|(_, cb)| cb.clone())
                .collect();
            for cb in callbacks {
                cb(dialog, DialogEvents::TERMINATED);
            }
            true
        }

        fn lookup_dialog(&self, h_entry: u32, h_id: u32) -> Option<DialogRef> {
            Some(DialogRef::new(h_entry, h_id))
        }

        fn register_dialog_callback(
            &self,
            dialog: DialogRef,
            _events: DialogEvents,
            callback: DialogCallback,
        ) -> bool {
            self.callbacks.lock().push((dialog, callback));
            true
        }
    }

    #[test]
    fn delete_terminates_tracked_dialogs() {
        let dialogs = Arc::new(RecordingDialogs::default());
        let store = Arc::new(
            ContactStore::new(
                8,
                MatchingMode::ContactOnly,
                dialogs.clone(),
                Arc::new(GlobalCallbacks::new()),
                Arc::new(ManualClock::new(NOW)),
            )
            .unwrap(),
        );
        let h = store.insert("sip:a@h", &ContactInfo::new(0)).unwrap();
        store.track_dialog(h, DialogRef::new(1, 2)).unwrap();
        store.track_dialog(h, DialogRef::new(1, 2)).unwrap();
        store.track_dialog(h, DialogRef::new(3, 4)).unwrap();
        assert_eq!(store.get(h).unwrap().dialogs().len(), 2);

        store.delete(h, None).unwrap();
        assert_eq!(
            *dialogs.terminated.lock(),
            vec![DialogRef::new(1, 2), DialogRef::new(3, 4)]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn dialog_end_untracks_from_contact() {
        let dialogs = Arc::new(RecordingDialogs::default());
        let store = Arc::new(
            ContactStore::new(
                8,
                MatchingMode::ContactOnly,
                dialogs.clone(),
                Arc::new(GlobalCallbacks::new()),
                Arc::new(ManualClock::new(NOW)),
            )
            .unwrap(),
        );
        let h = store.insert("sip:a@h", &ContactInfo::new(0)).unwrap();
        store.track_dialog(h, DialogRef::new(9, 9)).unwrap();
        dialogs.terminate_dialog(DialogRef::new(9, 9));
        assert!(store.get(h).unwrap().dialogs().is_empty());
    }

    #[test]
    fn snapshot_reports_shortage_then_fits() {
        let store = store();
        store
            .insert(
                "sip:a@192.0.2.1",
                &ContactInfo::new(0)
                    .with_cflags(0b11)
                    .with_sock("192.0.2.10:5060".parse().unwrap())
                    .with_path("<sip:p;lr>"),
            )
            .unwrap();
        store
            .insert("sip:b@192.0.2.2", &ContactInfo::new(0).with_cflags(0b01))
            .unwrap();

        let mut small = [0u8; 16];
        let short = match store.snapshot(&mut small, 0, 0, 1).unwrap() {
            Snapshot::Shortage(n) => n,
            other => panic!("expected shortage, got {:?}", other),
        };
        assert!(short > 0);

        let mut buf = vec![0u8; 16 + short];
        let written = match store.snapshot(&mut buf, 0, 0, 1).unwrap() {
            Snapshot::Complete { written, contacts } => {
                assert_eq!(contacts, 2);
                written
            }
            other => panic!("expected complete, got {:?}", other),
        };
        assert_eq!(written, buf.len());
        let entries: Vec<_> = SnapshotIter::new(&buf).collect();
        assert_eq!(entries.len(), 2);

        let mut buf = vec![0u8; 256];
        store.snapshot(&mut buf, 0b10, 0, 1).unwrap();
        let entries: Vec<_> = SnapshotIter::new(&buf).collect();
        assert_eq!(
            entries,
            vec![SnapshotEntry {
                uri: "sip:a@192.0.2.1",
                sock: "192.0.2.10:5060",
                cflags: 0b11,
                path: "<sip:p;lr>",
            }]
        );
    }

    #[test]
    fn snapshot_shards_partition_contacts() {
        let store = store();
        for i in 0..20 {
            store
                .insert(&format!("sip:u{}@192.0.2.1", i), &ContactInfo::new(0))
                .unwrap();
        }
        let mut total = 0;
        for shard in 0..3 {
            let mut buf = vec![0u8; 4096];
            match store.snapshot(&mut buf, 0, shard, 3).unwrap() {
                Snapshot::Complete { contacts, .. } => total += contacts,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(total, 20);
        assert!(store.snapshot(&mut [0u8; 8], 0, 3, 3).is_err());
    }
}
