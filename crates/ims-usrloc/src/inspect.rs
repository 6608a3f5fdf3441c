// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Read-only views of the store for operators.

use std::fmt;
use std::sync::Arc;

use ims_subscription::ImsSubscription;
use serde::Serialize;

use crate::contact_store::ContactStore;
use crate::impurecord::{ChargingAddresses, ImpuRecord, RegState};
use crate::udomain::UDomain;

#[derive(Debug, Clone, Serialize)]
pub struct ContactDump {
    pub uri: String,
    pub expires: i64,
    /// Seconds left, negative once expired; `None` for permanent contacts.
    pub expires_in: Option<i64>,
    pub q: i32,
    pub call_id: String,
    pub user_agent: String,
    pub path: Option<String>,
    pub received: Option<String>,
    pub ref_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberDump {
    pub event: i32,
    pub watcher_contact: String,
    pub presentity_uri: String,
    pub expires: i64,
    pub version: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDump {
    pub holders: usize,
    pub document: ImsSubscription,
}

/// Everything known about one IMPU.
#[derive(Debug, Clone, Serialize)]
pub struct ImpuDump {
    pub identity: String,
    pub state: RegState,
    pub barring: i32,
    pub is_primary: bool,
    pub expires: i64,
    pub charging: ChargingAddresses,
    pub subscription: Option<SubscriptionDump>,
    pub contacts: Vec<ContactDump>,
    pub subscribers: Vec<SubscriberDump>,
}

impl ImpuDump {
    pub(crate) fn build(record: &ImpuRecord, contacts: &ContactStore, now: i64) -> Self {
        let contacts = record
            .contacts()
            .as_slice()
            .iter()
            .filter_map(|h| contacts.get(*h).ok())
            .map(|c| ContactDump {
                uri: c.uri().to_owned(),
                expires: c.expires(),
                expires_in: (c.expires() != 0).then(|| c.expires() - now),
                q: c.q(),
                call_id: c.call_id().to_owned(),
                user_agent: c.user_agent().to_owned(),
                path: c.path().map(str::to_owned),
                received: c.received().map(str::to_owned),
                ref_count: c.ref_count(),
            })
            .collect();
        Self {
            identity: record.public_identity().to_owned(),
            state: record.reg_state(),
            barring: record.barring(),
            is_primary: record.is_primary(),
            expires: record.expires(),
            charging: record.charging().clone(),
            subscription: record.subscription().map(|cell| SubscriptionDump {
                holders: Arc::strong_count(cell),
                document: cell.read().clone(),
            }),
            contacts,
            subscribers: record
                .subscribers()
                .iter()
                .map(|s| SubscriberDump {
                    event: s.event,
                    watcher_contact: s.watcher_contact.clone(),
                    presentity_uri: s.presentity_uri.clone(),
                    expires: s.expires,
                    version: s.version,
                })
                .collect(),
        }
    }
}

impl fmt::Display for ImpuDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IMPU: {}", self.identity)?;
        writeln!(f, "  state: {}  barring: {}  primary: {}", self.state, self.barring, self.is_primary)?;
        if self.state == RegState::Unregistered {
            writeln!(f, "  unregistered until: {}", self.expires)?;
        }
        if let Some(ccf1) = &self.charging.ccf1 {
            writeln!(f, "  ccf1: {}", ccf1)?;
        }
        if let Some(ecf1) = &self.charging.ecf1 {
            writeln!(f, "  ecf1: {}", ecf1)?;
        }
        if let Some(sub) = &self.subscription {
            writeln!(
                f,
                "  subscription: {} ({} holders)",
                sub.document.private_identity, sub.holders
            )?;
            for (i, profile) in sub.document.service_profiles.iter().enumerate() {
                writeln!(f, "    profile {}:", i)?;
                for pi in &profile.public_identities {
                    let barred = if pi.barring { " [barred]" } else { "" };
                    writeln!(f, "      {}{}", pi.identity, barred)?;
                }
                for ifc in &profile.filter_criteria {
                    writeln!(
                        f,
                        "      ifc priority {} -> {}",
                        ifc.priority, ifc.application_server.server_name
                    )?;
                }
            }
        }
        for c in &self.contacts {
            let left = c
                .expires_in
                .map_or_else(|| "permanent".to_owned(), |s| format!("{}s", s));
            writeln!(f, "  contact: {} expires: {} ref: {} ua: {}", c.uri, left, c.ref_count, c.user_agent)?;
        }
        for s in &self.subscribers {
            writeln!(
                f,
                "  subscriber: {} event: {} expires: {}",
                s.watcher_contact, s.event, s.expires
            )?;
        }
        Ok(())
    }
}

/// Occupancy of one domain and of the shared contact table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainStats {
    pub name: String,
    pub slots: usize,
    pub records: usize,
    pub users: usize,
    pub max_bucket_depth: usize,
    pub contacts: usize,
    pub contact_slots: usize,
    pub max_contact_depth: usize,
}

impl DomainStats {
    pub(crate) fn build(domain: &UDomain, contacts: &ContactStore) -> Self {
        let mut stats = Self {
            name: domain.name().to_owned(),
            slots: domain.slot_count(),
            users: domain.users(),
            contacts: contacts.len(),
            contact_slots: contacts.slot_count(),
            max_contact_depth: contacts.max_depth(),
            ..Self::default()
        };
        domain.for_each_slot(|_, records| {
            stats.records += records.len();
            stats.max_bucket_depth = stats.max_bucket_depth.max(records.len());
        });
        stats
    }
}

impl fmt::Display for DomainStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} records in {} slots (deepest {}), {} contacts in {} slots (deepest {})",
            self.name,
            self.records,
            self.slots,
            self.max_bucket_depth,
            self.contacts,
            self.contact_slots,
            self.max_contact_depth
        )
    }
}
