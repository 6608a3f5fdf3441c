// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! IMPU records: one public identity's registration state.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;

use crate::callbacks::CallbackList;
use crate::contact::ContactHandle;
use crate::error::{try_copy, Result, UsrlocError};
use crate::hash::hash_str;
use crate::subscription::SubscriptionCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegState {
    #[default]
    NotRegistered,
    Registered,
    Unregistered,
}

impl RegState {
    /// Value stored in the `reg_state` column.
    pub fn as_i64(self) -> i64 {
        match self {
            RegState::NotRegistered => 0,
            RegState::Registered => 1,
            RegState::Unregistered => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(RegState::NotRegistered),
            1 => Some(RegState::Registered),
            2 => Some(RegState::Unregistered),
            _ => None,
        }
    }
}

impl fmt::Display for RegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegState::NotRegistered => "NOT_REGISTERED",
            RegState::Registered => "REGISTERED",
            RegState::Unregistered => "UNREGISTERED",
        };
        f.write_str(s)
    }
}

/// Charging collection and event charging function addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChargingAddresses {
    pub ccf1: Option<String>,
    pub ccf2: Option<String>,
    pub ecf1: Option<String>,
    pub ecf2: Option<String>,
}

impl ChargingAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ccf(mut self, primary: impl Into<String>, secondary: Option<&str>) -> Self {
        self.ccf1 = Some(primary.into());
        self.ccf2 = secondary.map(str::to_owned);
        self
    }

    pub fn with_ecf(mut self, primary: impl Into<String>, secondary: Option<&str>) -> Self {
        self.ecf1 = Some(primary.into());
        self.ecf2 = secondary.map(str::to_owned);
        self
    }
}

/// Which identities `linked_identities` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarringFilter {
    All,
    Barred,
    Unbarred,
}

impl BarringFilter {
    /// Legacy values: -1 all, 1 barred only, 0 unbarred only.
    pub fn from_legacy(value: i32) -> Self {
        match value {
            1 => BarringFilter::Barred,
            0 => BarringFilter::Unbarred,
            _ => BarringFilter::All,
        }
    }

    fn accepts(self, barred: bool) -> bool {
        match self {
            BarringFilter::All => true,
            BarringFilter::Barred => barred,
            BarringFilter::Unbarred => !barred,
        }
    }
}

/// Identity strings packed into one text buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityList {
    text: String,
    ends: Vec<usize>,
}

impl IdentityList {
    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        let end = *self.ends.get(index)?;
        let start = if index == 0 { 0 } else { self.ends[index - 1] };
        self.text.get(start..end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Total bytes of identity text.
    pub fn text_len(&self) -> usize {
        self.text.len()
    }
}

/// Bounded, insertion-ordered list of linked contacts.
///
/// Index 0 is the oldest link. Removal shifts later entries down so there are
/// never gaps.
#[derive(Debug, Clone)]
pub struct ContactLinks {
    handles: Vec<ContactHandle>,
    capacity: usize,
}

impl ContactLinks {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, handle: ContactHandle) -> bool {
        self.handles.contains(&handle)
    }

    pub fn position(&self, handle: ContactHandle) -> Option<usize> {
        self.handles.iter().position(|h| *h == handle)
    }

    pub fn get(&self, index: usize) -> Option<ContactHandle> {
        self.handles.get(index).copied()
    }

    pub fn as_slice(&self) -> &[ContactHandle] {
        &self.handles
    }

    pub(crate) fn push(&mut self, handle: ContactHandle) -> Result<()> {
        if self.handles.len() >= self.capacity {
            return Err(UsrlocError::TooManyContacts {
                limit: self.capacity,
            });
        }
        self.handles.try_reserve(1)?;
        self.handles.push(handle);
        Ok(())
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Option<ContactHandle> {
        (index < self.handles.len()).then(|| self.handles.remove(index))
    }
}

/// A reg-event subscription watching this IMPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegSubscriber {
    pub event: i32,
    pub watcher_uri: String,
    pub watcher_contact: String,
    pub presentity_uri: String,
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub record_route: String,
    pub sockinfo: Option<String>,
    pub expires: i64,
    pub version: i32,
    pub local_cseq: i32,
}

impl RegSubscriber {
    pub fn new(
        event: i32,
        watcher_contact: impl Into<String>,
        presentity_uri: impl Into<String>,
        expires: i64,
    ) -> Self {
        Self {
            event,
            watcher_uri: String::new(),
            watcher_contact: watcher_contact.into(),
            presentity_uri: presentity_uri.into(),
            call_id: String::new(),
            from_tag: String::new(),
            to_tag: String::new(),
            record_route: String::new(),
            sockinfo: None,
            expires,
            version: 0,
            local_cseq: 0,
        }
    }

    pub fn with_watcher_uri(mut self, uri: impl Into<String>) -> Self {
        self.watcher_uri = uri.into();
        self
    }

    pub fn with_dialog(
        mut self,
        call_id: impl Into<String>,
        from_tag: impl Into<String>,
        to_tag: impl Into<String>,
    ) -> Self {
        self.call_id = call_id.into();
        self.from_tag = from_tag.into();
        self.to_tag = to_tag.into();
        self
    }

    pub fn with_record_route(mut self, rr: impl Into<String>) -> Self {
        self.record_route = rr.into();
        self
    }

    pub fn with_sockinfo(mut self, sock: impl Into<String>) -> Self {
        self.sockinfo = Some(sock.into());
        self
    }

    pub fn key(&self) -> SubscriberKey<'_> {
        SubscriberKey {
            watcher_contact: &self.watcher_contact,
            presentity_uri: &self.presentity_uri,
            event: self.event,
        }
    }
}

/// Identifies a subscriber within one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberKey<'a> {
    pub watcher_contact: &'a str,
    pub presentity_uri: &'a str,
    pub event: i32,
}

/// Fields a refresh may change.
#[derive(Debug, Clone, Default)]
pub struct SubscriberUpdate {
    pub expires: Option<i64>,
    pub version: Option<i32>,
    pub local_cseq: Option<i32>,
    pub to_tag: Option<String>,
}

/// Values for insert and update of an IMPU record.
#[derive(Debug, Clone, Default)]
pub struct ImpuInfo {
    pub reg_state: RegState,
    /// `None` leaves barring untouched on update (0 on insert).
    pub barring: Option<i32>,
    pub is_primary: bool,
    pub subscription: Option<Arc<SubscriptionCell>>,
    /// `None` leaves charging addresses untouched on update.
    pub charging: Option<ChargingAddresses>,
}

impl ImpuInfo {
    pub fn new(reg_state: RegState) -> Self {
        Self {
            reg_state,
            ..Self::default()
        }
    }

    pub fn with_barring(mut self, barring: i32) -> Self {
        self.barring = Some(barring);
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn with_subscription(mut self, cell: Arc<SubscriptionCell>) -> Self {
        self.subscription = Some(cell);
        self
    }

    pub fn with_charging(mut self, charging: ChargingAddresses) -> Self {
        self.charging = Some(charging);
        self
    }
}

/// One public identity and everything registered against it.
#[derive(Debug)]
pub struct ImpuRecord {
    pub(crate) domain: SmolStr,
    pub(crate) public_identity: String,
    pub(crate) aorhash: u32,
    pub(crate) reg_state: RegState,
    pub(crate) barring: i32,
    pub(crate) is_primary: bool,
    pub(crate) charging: ChargingAddresses,
    pub(crate) subscription: Option<Arc<SubscriptionCell>>,
    pub(crate) contacts: ContactLinks,
    pub(crate) subscribers: Vec<RegSubscriber>,
    pub(crate) expires: i64,
    pub(crate) callbacks: CallbackList,
}

impl ImpuRecord {
    pub(crate) fn new(
        domain: SmolStr,
        identity: &str,
        info: &ImpuInfo,
        contact_capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            domain,
            public_identity: try_copy(identity)?,
            aorhash: hash_str(identity),
            reg_state: info.reg_state,
            barring: info.barring.unwrap_or(0),
            is_primary: info.is_primary,
            charging: info.charging.clone().unwrap_or_default(),
            subscription: info.subscription.clone(),
            contacts: ContactLinks::new(contact_capacity),
            subscribers: Vec::new(),
            expires: 0,
            callbacks: CallbackList::new(),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn public_identity(&self) -> &str {
        &self.public_identity
    }

    pub fn aorhash(&self) -> u32 {
        self.aorhash
    }

    pub fn reg_state(&self) -> RegState {
        self.reg_state
    }

    pub fn barring(&self) -> i32 {
        self.barring
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn charging(&self) -> &ChargingAddresses {
        &self.charging
    }

    pub fn subscription(&self) -> Option<&Arc<SubscriptionCell>> {
        self.subscription.as_ref()
    }

    pub fn contacts(&self) -> &ContactLinks {
        &self.contacts
    }

    pub fn num_contacts(&self) -> usize {
        self.contacts.len()
    }

    pub fn subscribers(&self) -> &[RegSubscriber] {
        &self.subscribers
    }

    /// Expiry of an UNREGISTERED record; 0 otherwise.
    pub fn expires(&self) -> i64 {
        self.expires
    }

    /// An UNREGISTERED record whose grace period has not run out.
    pub fn is_live_tombstone(&self, now: i64) -> bool {
        self.reg_state == RegState::Unregistered && self.expires > now
    }

    /// Public identities of the record's subscription document that pass
    /// `filter`, read under the document's lock.
    pub fn linked_identities(&self, filter: BarringFilter) -> Result<IdentityList> {
        let Some(cell) = &self.subscription else {
            return Ok(IdentityList::default());
        };
        let doc = cell.read();
        let selected = || {
            doc.public_identities()
                .filter(move |pi| filter.accepts(pi.barring))
        };
        let count = selected().count();
        let total: usize = selected().map(|pi| pi.identity.len()).sum();

        let mut list = IdentityList::default();
        list.text.try_reserve_exact(total)?;
        list.ends.try_reserve_exact(count)?;
        for pi in selected() {
            list.text.push_str(&pi.identity);
            list.ends.push(list.text.len());
        }
        Ok(list)
    }

    pub(crate) fn find_subscriber(&self, key: &SubscriberKey<'_>) -> Option<usize> {
        self.subscribers.iter().position(|s| s.key() == *key)
    }
}
