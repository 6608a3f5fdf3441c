// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Startup configuration for the user location store.
//!
//! Values are read once by [`Usrloc::init`](crate::Usrloc::init) and never
//! reparsed. [`UsrlocConfig::validate`] rejects out-of-range values there, which
//! makes bad configuration fatal to initialization.

use serde::Deserialize;

use crate::error::{Result, UsrlocError};

/// Default number of slots when the configured size is 1 or less.
pub const DEFAULT_TABLE_SIZE: usize = 512;
/// Hard bound on the linked-contact array of one IMPU record.
pub const DEFAULT_CONTACTS_PER_IMPU: usize = 100;
const MAX_HASH_SIZE_LOG2: u32 = 24;

/// How a contact lookup decides two contacts are the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingMode {
    /// Compare the contact URI only.
    #[default]
    ContactOnly,
    /// Contact URI and Call-ID.
    ContactCallid,
    /// Contact URI and Path; contacts without a path fall back to URI only.
    ContactPath,
    /// host:port only, user part and parameters ignored (NAT traversal).
    ContactPortIpOnly,
}

impl MatchingMode {
    /// Maps the legacy integer setting (0..=3).
    pub fn from_legacy(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::ContactOnly),
            1 => Ok(Self::ContactCallid),
            2 => Ok(Self::ContactPath),
            3 => Ok(Self::ContactPortIpOnly),
            other => Err(UsrlocError::Invalid(format!(
                "unknown contact matching mode {}",
                other
            ))),
        }
    }
}

/// What `link_contact` does when an IMPU already holds the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxContactBehaviour {
    /// No configured maximum; only the hard array bound applies.
    #[default]
    Disabled,
    /// Refuse the new contact.
    Reject,
    /// Unlink the oldest contact to make room.
    OverwriteOldest,
}

impl MaxContactBehaviour {
    /// Maps the legacy integer setting (0..=2).
    pub fn from_legacy(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Reject),
            2 => Ok(Self::OverwriteOldest),
            other => Err(UsrlocError::Invalid(format!(
                "unknown max contact behaviour {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbMode {
    /// Memory only.
    #[default]
    NoDb,
    /// Mirror every mutation to the database synchronously.
    WriteThrough,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsrlocConfig {
    /// log2 of the IMPU table size; 1 or less selects 512 slots.
    pub hash_size: u32,
    /// log2 of the contact table size; same rule as `hash_size`.
    pub contact_hash_size: u32,
    pub matching_mode: MatchingMode,
    /// Configured maximum contacts per IMPU; 0 means none.
    pub max_contacts: usize,
    pub max_contact_behaviour: MaxContactBehaviour,
    /// Capacity of each record's linked-contact array.
    pub contacts_per_impu_cap: usize,
    /// Seconds an UNREGISTERED record survives without contacts.
    pub unreg_validity: i64,
    /// Sweep period in seconds.
    pub timer_interval: u64,
    pub db_mode: DbMode,
}

impl Default for UsrlocConfig {
    fn default() -> Self {
        Self {
            hash_size: 9,
            contact_hash_size: 9,
            matching_mode: MatchingMode::ContactOnly,
            max_contacts: 0,
            max_contact_behaviour: MaxContactBehaviour::Disabled,
            contacts_per_impu_cap: DEFAULT_CONTACTS_PER_IMPU,
            unreg_validity: 1800,
            timer_interval: 60,
            db_mode: DbMode::NoDb,
        }
    }
}

impl UsrlocConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash_size(mut self, log2: u32) -> Self {
        self.hash_size = log2;
        self
    }

    pub fn with_contact_hash_size(mut self, log2: u32) -> Self {
        self.contact_hash_size = log2;
        self
    }

    pub fn with_matching_mode(mut self, mode: MatchingMode) -> Self {
        self.matching_mode = mode;
        self
    }

    pub fn with_max_contacts(mut self, max: usize, behaviour: MaxContactBehaviour) -> Self {
        self.max_contacts = max;
        self.max_contact_behaviour = behaviour;
        self
    }

    pub fn with_contacts_per_impu_cap(mut self, cap: usize) -> Self {
        self.contacts_per_impu_cap = cap;
        self
    }

    pub fn with_unreg_validity(mut self, secs: i64) -> Self {
        self.unreg_validity = secs;
        self
    }

    pub fn with_timer_interval(mut self, secs: u64) -> Self {
        self.timer_interval = secs;
        self
    }

    pub fn with_db_mode(mut self, mode: DbMode) -> Self {
        self.db_mode = mode;
        self
    }

    /// Preset for tests and small deployments: tiny tables, memory only.
    pub fn small() -> Self {
        Self::default().with_hash_size(4).with_contact_hash_size(4)
    }

    /// Number of IMPU slots.
    pub fn impu_slots(&self) -> usize {
        table_size(self.hash_size)
    }

    /// Number of contact slots.
    pub fn contact_slots(&self) -> usize {
        table_size(self.contact_hash_size)
    }

    /// Effective per-IMPU contact limit enforced by `link_contact`.
    pub fn contact_limit(&self) -> usize {
        match self.max_contact_behaviour {
            MaxContactBehaviour::Disabled => self.contacts_per_impu_cap,
            _ if self.max_contacts == 0 => self.contacts_per_impu_cap,
            _ => self.max_contacts.min(self.contacts_per_impu_cap),
        }
    }

    pub fn write_through(&self) -> bool {
        self.db_mode == DbMode::WriteThrough
    }

    pub fn validate(&self) -> Result<()> {
        if self.hash_size > MAX_HASH_SIZE_LOG2 || self.contact_hash_size > MAX_HASH_SIZE_LOG2 {
            return Err(UsrlocError::Invalid(format!(
                "hash size must be at most 2^{}",
                MAX_HASH_SIZE_LOG2
            )));
        }
        if self.contacts_per_impu_cap == 0 {
            return Err(UsrlocError::Invalid(
                "contacts per IMPU cap must be positive".into(),
            ));
        }
        if self.max_contacts > self.contacts_per_impu_cap {
            return Err(UsrlocError::Invalid(format!(
                "max contacts {} exceeds per-IMPU cap {}",
                self.max_contacts, self.contacts_per_impu_cap
            )));
        }
        if self.unreg_validity < 0 {
            return Err(UsrlocError::Invalid("unreg validity must not be negative".into()));
        }
        if self.timer_interval == 0 {
            return Err(UsrlocError::Invalid("timer interval must be positive".into()));
        }
        Ok(())
    }
}

fn table_size(log2: u32) -> usize {
    if log2 <= 1 {
        DEFAULT_TABLE_SIZE
    } else {
        1usize << log2
    }
}
