// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Synchronous event listeners for contact and IMPU transitions.
//!
//! Listeners run on the calling thread while the relevant bucket lock is held.
//! A listener may read other buckets but must not mutate the bucket it was
//! fired under. Invocation order within a list is unspecified.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::contact::Contact;
use crate::error::{Result, UsrlocError};
use crate::impurecord::ImpuRecord;

bitflags! {
    /// Event kinds a listener can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventType: u32 {
        const CONTACT_INSERT = 1 << 0;
        const CONTACT_UPDATE = 1 << 1;
        const CONTACT_DELETE = 1 << 2;
        const CONTACT_EXPIRE = 1 << 3;
        const IMPU_INSERT = 1 << 4;
        const IMPU_UPDATE = 1 << 5;
        const IMPU_DELETE = 1 << 6;
        const IMPU_NEW_CONTACT = 1 << 7;
        const IMPU_UPDATE_CONTACT = 1 << 8;
        const IMPU_DELETE_CONTACT = 1 << 9;
        const IMPU_EXPIRE_CONTACT = 1 << 10;
        /// A registered IMPU lost its last contact.
        const IMPU_REG_NC_DELETE = 1 << 11;
        /// A not-registered IMPU was removed by the sweep.
        const IMPU_NOT_REG_DELETE = 1 << 12;
        /// An unregistered IMPU outlived its validity.
        const IMPU_UNREG_EXPIRED = 1 << 13;
    }
}

impl EventType {
    pub const CONTACT_CLASS: Self = Self::CONTACT_INSERT
        .union(Self::CONTACT_UPDATE)
        .union(Self::CONTACT_DELETE)
        .union(Self::CONTACT_EXPIRE);

    pub const IMPU_CLASS: Self = Self::IMPU_INSERT
        .union(Self::IMPU_UPDATE)
        .union(Self::IMPU_DELETE)
        .union(Self::IMPU_NEW_CONTACT)
        .union(Self::IMPU_UPDATE_CONTACT)
        .union(Self::IMPU_DELETE_CONTACT)
        .union(Self::IMPU_EXPIRE_CONTACT)
        .union(Self::IMPU_REG_NC_DELETE)
        .union(Self::IMPU_NOT_REG_DELETE)
        .union(Self::IMPU_UNREG_EXPIRED);

    /// Events that fire before their target exists and so can only be global.
    pub const GLOBAL_ONLY: Self = Self::CONTACT_INSERT.union(Self::IMPU_INSERT);
}

/// Payload handed to listeners.
#[derive(Clone, Copy)]
pub struct UsrlocEvent<'a> {
    pub kind: EventType,
    pub impu: Option<&'a ImpuRecord>,
    pub contact: Option<&'a Contact>,
}

impl<'a> UsrlocEvent<'a> {
    pub fn impu(kind: EventType, impu: &'a ImpuRecord) -> Self {
        Self {
            kind,
            impu: Some(impu),
            contact: None,
        }
    }

    pub fn contact(kind: EventType, contact: &'a Contact) -> Self {
        Self {
            kind,
            impu: None,
            contact: Some(contact),
        }
    }

    pub fn both(kind: EventType, impu: &'a ImpuRecord, contact: &'a Contact) -> Self {
        Self {
            kind,
            impu: Some(impu),
            contact: Some(contact),
        }
    }
}

/// Receives usrloc events. Context lives in the implementing value.
pub trait UsrlocListener: Send + Sync {
    fn on_event(&self, event: &UsrlocEvent<'_>);
}

impl<F> UsrlocListener for F
where
    F: Fn(&UsrlocEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &UsrlocEvent<'_>) {
        self(event)
    }
}

#[derive(Clone)]
struct CallbackEntry {
    mask: EventType,
    listener: Arc<dyn UsrlocListener>,
}

/// Listener list owned by one record or contact.
#[derive(Clone, Default)]
pub struct CallbackList {
    entries: Vec<CallbackEntry>,
    types: EventType,
}

impl fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.entries.len())
            .field("types", &self.types)
            .finish()
    }
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mask: EventType, listener: Arc<dyn UsrlocListener>) -> Result<()> {
        self.entries.try_reserve(1)?;
        self.entries.insert(0, CallbackEntry { mask, listener });
        self.types |= mask;
        Ok(())
    }

    /// Attaches a listener for record- or contact-scoped events.
    pub fn register(&mut self, mask: EventType, listener: Arc<dyn UsrlocListener>) -> Result<()> {
        check_entity_mask(mask)?;
        self.push(mask, listener)
    }

    /// True if any listener wants one of `mask`.
    pub fn wants(&self, mask: EventType) -> bool {
        self.types.intersects(mask)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fire(&self, event: &UsrlocEvent<'_>) {
        if !self.types.intersects(event.kind) {
            return;
        }
        for entry in &self.entries {
            if entry.mask.intersects(event.kind) {
                entry.listener.on_event(event);
            }
        }
    }
}

/// Process-wide listeners for events whose target does not exist yet.
#[derive(Default)]
pub struct GlobalCallbacks {
    list: RwLock<CallbackList>,
}

impl GlobalCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a global listener. `kind` must be exactly
    /// [`EventType::CONTACT_INSERT`] or [`EventType::IMPU_INSERT`].
    pub fn register(&self, kind: EventType, listener: Arc<dyn UsrlocListener>) -> Result<()> {
        if kind != EventType::CONTACT_INSERT && kind != EventType::IMPU_INSERT {
            return Err(UsrlocError::Invalid(format!(
                "{:?} cannot be registered globally",
                kind
            )));
        }
        self.list.write().push(kind, listener)
    }

    pub fn wants(&self, kind: EventType) -> bool {
        self.list.read().wants(kind)
    }

    pub fn fire(&self, event: &UsrlocEvent<'_>) {
        // Listeners may register more listeners; run them outside the lock.
        let list = {
            let guard = self.list.read();
            if !guard.wants(event.kind) {
                return;
            }
            guard.clone()
        };
        list.fire(event);
    }
}

fn check_entity_mask(mask: EventType) -> Result<()> {
    if mask.is_empty() {
        return Err(UsrlocError::Invalid("empty callback mask".into()));
    }
    if mask.intersects(EventType::GLOBAL_ONLY) {
        return Err(UsrlocError::Invalid(
            "insert events can only be registered globally".into(),
        ));
    }
    if mask.intersects(EventType::CONTACT_CLASS) && mask.intersects(EventType::IMPU_CLASS) {
        return Err(UsrlocError::Invalid(
            "contact and IMPU events cannot share a registration".into(),
        ));
    }
    Ok(())
}

/// Which list a registration is attached to.
pub(crate) fn is_contact_mask(mask: EventType) -> bool {
    EventType::CONTACT_CLASS.contains(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn UsrlocListener>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let listener: Arc<dyn UsrlocListener> = Arc::new(move |_: &UsrlocEvent<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, listener)
    }

    fn event(kind: EventType) -> UsrlocEvent<'static> {
        UsrlocEvent {
            kind,
            impu: None,
            contact: None,
        }
    }

    #[test]
    fn fires_only_matching_masks() {
        let mut list = CallbackList::new();
        let (hits, listener) = counter();
        list.register(EventType::IMPU_UPDATE | EventType::IMPU_DELETE, listener)
            .unwrap();

        list.fire(&event(EventType::IMPU_UPDATE));
        list.fire(&event(EventType::IMPU_NEW_CONTACT));
        list.fire(&event(EventType::IMPU_DELETE));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_mixed_classes() {
        let mut list = CallbackList::new();
        let (_, listener) = counter();
        let err = list
            .register(EventType::CONTACT_UPDATE | EventType::IMPU_UPDATE, listener)
            .unwrap_err();
        assert!(matches!(err, UsrlocError::Invalid(_)));
        assert!(list.is_empty());
    }

    #[test]
    fn insert_events_are_global_only() {
        let mut list = CallbackList::new();
        let (_, listener) = counter();
        assert!(list
            .register(EventType::IMPU_INSERT, Arc::clone(&listener))
            .is_err());

        let global = GlobalCallbacks::new();
        assert!(global
            .register(EventType::IMPU_INSERT | EventType::CONTACT_INSERT, Arc::clone(&listener))
            .is_err());
        assert!(global
            .register(EventType::IMPU_UPDATE, Arc::clone(&listener))
            .is_err());
        assert!(global.register(EventType::IMPU_INSERT, listener).is_ok());
        assert!(global.wants(EventType::IMPU_INSERT));
        assert!(!global.wants(EventType::CONTACT_INSERT));
    }

    #[test]
    fn global_fire_reaches_every_listener() {
        let global = GlobalCallbacks::new();
        let (a, la) = counter();
        let (b, lb) = counter();
        global.register(EventType::CONTACT_INSERT, la).unwrap();
        global.register(EventType::CONTACT_INSERT, lb).unwrap();
        global.fire(&event(EventType::CONTACT_INSERT));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classifies_masks() {
        assert!(is_contact_mask(EventType::CONTACT_DELETE | EventType::CONTACT_EXPIRE));
        assert!(!is_contact_mask(EventType::IMPU_DELETE_CONTACT));
    }
}
