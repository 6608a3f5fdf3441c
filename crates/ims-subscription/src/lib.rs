// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! IMS subscription documents (3GPP TS 29.228 user profile).
//!
//! An [`ImsSubscription`] is the service-profile tree an S-CSCF receives from
//! the HSS for one private identity. All public identities of an implicit
//! registration set share one document. The [`codec`] module converts a
//! document to and from the compact binary blob stored in the `impu` table.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{decode, encode, encode_into, CodecError};

/// Subscription document for one private identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImsSubscription {
    pub private_identity: String,
    pub service_profiles: Vec<ServiceProfile>,
}

impl ImsSubscription {
    pub fn new(private_identity: impl Into<String>) -> Self {
        Self {
            private_identity: private_identity.into(),
            service_profiles: Vec::new(),
        }
    }

    pub fn with_profile(mut self, profile: ServiceProfile) -> Self {
        self.service_profiles.push(profile);
        self
    }

    /// Iterates every public identity across all service profiles.
    pub fn public_identities(&self) -> impl Iterator<Item = &PublicIdentity> {
        self.service_profiles
            .iter()
            .flat_map(|profile| profile.public_identities.iter())
    }

    /// Returns true if `identity` is one of the document's public identities.
    pub fn contains_identity(&self, identity: &str) -> bool {
        self.public_identities().any(|pi| pi.identity == identity)
    }

    /// Returns true if any public identity is shared with `other`.
    pub fn overlaps(&self, other: &ImsSubscription) -> bool {
        self.public_identities()
            .any(|pi| other.contains_identity(&pi.identity))
    }
}

/// One service profile inside a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub public_identities: Vec<PublicIdentity>,
    pub filter_criteria: Vec<FilterCriteria>,
    pub cn_service_auth: Option<CnServiceAuth>,
    pub shared_ifc_sets: Vec<i32>,
}

impl ServiceProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: PublicIdentity) -> Self {
        self.public_identities.push(identity);
        self
    }

    pub fn with_criteria(mut self, criteria: FilterCriteria) -> Self {
        self.filter_criteria.push(criteria);
        self
    }

    pub fn with_cn_service_auth(mut self, auth: CnServiceAuth) -> Self {
        self.cn_service_auth = Some(auth);
        self
    }

    pub fn with_shared_ifc_set(mut self, id: i32) -> Self {
        self.shared_ifc_sets.push(id);
        self
    }
}

/// A public user identity with its barring indication.
///
/// `wildcarded_psi` is carried in memory only; the binary blob does not store it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub barring: bool,
    pub identity: String,
    pub wildcarded_psi: Option<String>,
}

impl PublicIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            barring: false,
            identity: identity.into(),
            wildcarded_psi: None,
        }
    }

    pub fn barred(mut self) -> Self {
        self.barring = true;
        self
    }

    pub fn with_wildcard(mut self, psi: impl Into<String>) -> Self {
        self.wildcarded_psi = Some(psi.into());
        self
    }
}

/// Initial filter criterion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub priority: i32,
    pub trigger_point: Option<TriggerPoint>,
    pub application_server: ApplicationServer,
    pub profile_part_indicator: Option<ProfilePartIndicator>,
}

impl FilterCriteria {
    pub fn new(priority: i32, application_server: ApplicationServer) -> Self {
        Self {
            priority,
            trigger_point: None,
            application_server,
            profile_part_indicator: None,
        }
    }

    pub fn with_trigger_point(mut self, tp: TriggerPoint) -> Self {
        self.trigger_point = Some(tp);
        self
    }

    pub fn with_profile_part_indicator(mut self, ppi: ProfilePartIndicator) -> Self {
        self.profile_part_indicator = Some(ppi);
        self
    }
}

/// Whether a filter criterion applies to registered or unregistered users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfilePartIndicator {
    Registered,
    Unregistered,
}

impl ProfilePartIndicator {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Registered => 0,
            Self::Unregistered => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Registered),
            1 => Some(Self::Unregistered),
            _ => None,
        }
    }
}

/// Trigger point: a set of SPTs in conjunctive or disjunctive normal form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPoint {
    /// true = CNF, false = DNF.
    pub condition_type_cnf: bool,
    pub spts: Vec<Spt>,
}

impl TriggerPoint {
    pub fn cnf() -> Self {
        Self {
            condition_type_cnf: true,
            spts: Vec::new(),
        }
    }

    pub fn dnf() -> Self {
        Self::default()
    }

    pub fn with_spt(mut self, spt: Spt) -> Self {
        self.spts.push(spt);
        self
    }
}

/// Service point trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spt {
    pub condition_negated: bool,
    pub group: i32,
    /// Registration type bitmask (initial, re-registration, de-registration). Three bits.
    pub registration_type: u8,
    pub kind: SptKind,
}

impl Spt {
    pub fn new(group: i32, kind: SptKind) -> Self {
        Self {
            condition_negated: false,
            group,
            registration_type: 0,
            kind,
        }
    }

    pub fn negated(mut self) -> Self {
        self.condition_negated = true;
        self
    }

    pub fn with_registration_type(mut self, registration_type: u8) -> Self {
        self.registration_type = registration_type & 0x07;
        self
    }
}

/// SPT condition payload, discriminated by type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SptKind {
    RequestUri(String),
    Method(String),
    SipHeader {
        header_type: i16,
        header: String,
        content: String,
    },
    SessionCase(i8),
    SessionDescription {
        line: String,
        content: String,
    },
}

impl SptKind {
    /// Wire type tag.
    pub fn tag(&self) -> u8 {
        match self {
            Self::RequestUri(_) => 1,
            Self::Method(_) => 2,
            Self::SipHeader { .. } => 3,
            Self::SessionCase(_) => 4,
            Self::SessionDescription { .. } => 5,
        }
    }
}

/// Application server an initial filter criterion routes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationServer {
    pub server_name: String,
    /// 0 = session continued, 1 = session terminated.
    pub default_handling: i8,
    pub service_info: String,
}

impl ApplicationServer {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            default_handling: 0,
            service_info: String::new(),
        }
    }

    pub fn with_default_handling(mut self, default_handling: i8) -> Self {
        self.default_handling = default_handling;
        self
    }

    pub fn with_service_info(mut self, info: impl Into<String>) -> Self {
        self.service_info = info.into();
        self
    }
}

/// Core network service authorization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnServiceAuth {
    pub subscribed_media_profile_id: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImsSubscription {
        ImsSubscription::new("alice@ims.example.com").with_profile(
            ServiceProfile::new()
                .with_identity(PublicIdentity::new("sip:alice@ims.example.com"))
                .with_identity(PublicIdentity::new("tel:+15551234").barred()),
        )
    }

    #[test]
    fn lists_identities_across_profiles() {
        let sub = sample().with_profile(
            ServiceProfile::new().with_identity(PublicIdentity::new("sip:work@ims.example.com")),
        );
        let ids: Vec<_> = sub.public_identities().map(|p| p.identity.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "sip:alice@ims.example.com",
                "tel:+15551234",
                "sip:work@ims.example.com"
            ]
        );
    }

    #[test]
    fn overlap_detects_shared_identity() {
        let a = sample();
        let b = ImsSubscription::new("other").with_profile(
            ServiceProfile::new().with_identity(PublicIdentity::new("tel:+15551234")),
        );
        let c = ImsSubscription::new("other").with_profile(
            ServiceProfile::new().with_identity(PublicIdentity::new("sip:bob@ims.example.com")),
        );
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn spt_registration_type_is_three_bits() {
        let spt = Spt::new(0, SptKind::SessionCase(1)).with_registration_type(0xff);
        assert_eq!(spt.registration_type, 0x07);
    }

    #[test]
    fn profile_part_indicator_values() {
        assert_eq!(ProfilePartIndicator::from_u8(0), Some(ProfilePartIndicator::Registered));
        assert_eq!(ProfilePartIndicator::from_u8(1), Some(ProfilePartIndicator::Unregistered));
        assert_eq!(ProfilePartIndicator::from_u8(2), None);
    }
}
