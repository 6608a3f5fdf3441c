// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Binary codec for [`ImsSubscription`] blobs.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! subscription := str(private_identity) u16(n) profile*n
//! profile      := u16(n) (i8(barring) str(identity))*n
//!                 u16(n) criteria*n
//!                 i32(cn_auth | 0xFFFFFFFF)
//!                 u16(n) i32*n
//! criteria     := i32(priority) u8(ppi + 1 | 0) (u8(100) | trigger) app_server
//! trigger      := u8(cnf) u16(n) spt*n
//! spt          := u8(negated << 7 | reg_type << 4 | type) i32(group) payload
//! app_server   := str(name) i8(default_handling) str(service_info)
//! str          := u16(len) bytes
//! ```
//!
//! The layout is compatible with blobs written by existing S-CSCF deployments.

use std::fmt;

use bytes::{Buf, BufMut};
use tracing::warn;

use crate::{
    ApplicationServer, CnServiceAuth, FilterCriteria, ImsSubscription, ProfilePartIndicator,
    PublicIdentity, ServiceProfile, Spt, SptKind, TriggerPoint,
};

/// Marker byte written in place of an absent trigger point.
const NO_TRIGGER_POINT: u8 = 100;
/// Marker written in place of an absent core network service authorization.
const NO_CN_AUTH: u32 = 0xFFFF_FFFF;
const MAX_STR_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The output buffer could not grow.
    OutOfMemory,
    /// The document holds a value the wire format cannot express.
    Unrepresentable(&'static str),
    /// Malformed or truncated input.
    Decode { offset: usize, what: &'static str },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::OutOfMemory => write!(f, "out of memory while encoding subscription"),
            CodecError::Unrepresentable(what) => {
                write!(f, "subscription cannot be encoded: {}", what)
            }
            CodecError::Decode { offset, what } => {
                write!(f, "malformed subscription blob at byte {}: {}", offset, what)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Encodes a subscription into a fresh buffer.
pub fn encode(subscription: &ImsSubscription) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode_into(&mut buf, subscription)?;
    Ok(buf)
}

/// Appends the encoded subscription to `buf`.
///
/// On failure `buf` is truncated back to its original length.
pub fn encode_into(buf: &mut Vec<u8>, subscription: &ImsSubscription) -> Result<(), CodecError> {
    let start = buf.len();
    let result = Encoder { buf: &mut *buf }.subscription(subscription);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

/// Decodes a subscription blob.
///
/// Trailing bytes after the last profile are ignored.
pub fn decode(src: &[u8]) -> Result<ImsSubscription, CodecError> {
    Decoder::new(src).subscription()
}

struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl Encoder<'_> {
    fn reserve(&mut self, additional: usize) -> Result<(), CodecError> {
        self.buf
            .try_reserve(additional)
            .map_err(|_| CodecError::OutOfMemory)
    }

    fn put_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.reserve(1)?;
        self.buf.put_u8(v);
        Ok(())
    }

    fn put_i8(&mut self, v: i8) -> Result<(), CodecError> {
        self.reserve(1)?;
        self.buf.put_i8(v);
        Ok(())
    }

    fn put_u16(&mut self, v: u16) -> Result<(), CodecError> {
        self.reserve(2)?;
        self.buf.put_u16_le(v);
        Ok(())
    }

    fn put_i16(&mut self, v: i16) -> Result<(), CodecError> {
        self.reserve(2)?;
        self.buf.put_i16_le(v);
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<(), CodecError> {
        self.reserve(4)?;
        self.buf.put_u32_le(v);
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.reserve(4)?;
        self.buf.put_i32_le(v);
        Ok(())
    }

    fn put_count(&mut self, len: usize, what: &'static str) -> Result<(), CodecError> {
        let count = u16::try_from(len).map_err(|_| CodecError::Unrepresentable(what))?;
        self.put_u16(count)
    }

    fn put_str(&mut self, s: &str) -> Result<(), CodecError> {
        let bytes = if s.len() > MAX_STR_LEN {
            let mut end = MAX_STR_LEN;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            warn!(len = s.len(), kept = end, "string too long for subscription blob, truncating");
            &s.as_bytes()[..end]
        } else {
            s.as_bytes()
        };
        self.reserve(2 + bytes.len())?;
        self.buf.put_u16_le(bytes.len() as u16);
        self.buf.put_slice(bytes);
        Ok(())
    }

    fn subscription(&mut self, sub: &ImsSubscription) -> Result<(), CodecError> {
        self.put_str(&sub.private_identity)?;
        self.put_count(sub.service_profiles.len(), "too many service profiles")?;
        for profile in &sub.service_profiles {
            self.profile(profile)?;
        }
        Ok(())
    }

    fn profile(&mut self, profile: &ServiceProfile) -> Result<(), CodecError> {
        self.put_count(profile.public_identities.len(), "too many public identities")?;
        for pi in &profile.public_identities {
            self.put_i8(pi.barring as i8)?;
            self.put_str(&pi.identity)?;
        }

        self.put_count(profile.filter_criteria.len(), "too many filter criteria")?;
        for fc in &profile.filter_criteria {
            self.filter_criteria(fc)?;
        }

        match profile.cn_service_auth {
            Some(auth) if auth.subscribed_media_profile_id as u32 == NO_CN_AUTH => {
                return Err(CodecError::Unrepresentable(
                    "subscribed media profile id collides with absent marker",
                ));
            }
            Some(auth) => self.put_i32(auth.subscribed_media_profile_id)?,
            None => self.put_u32(NO_CN_AUTH)?,
        }

        self.put_count(profile.shared_ifc_sets.len(), "too many shared IFC sets")?;
        for id in &profile.shared_ifc_sets {
            self.put_i32(*id)?;
        }
        Ok(())
    }

    fn filter_criteria(&mut self, fc: &FilterCriteria) -> Result<(), CodecError> {
        self.put_i32(fc.priority)?;
        let ppi = fc.profile_part_indicator.map_or(0, |p| p.as_u8() + 1);
        self.put_u8(ppi)?;
        match &fc.trigger_point {
            Some(tp) => self.trigger_point(tp)?,
            None => self.put_u8(NO_TRIGGER_POINT)?,
        }
        self.application_server(&fc.application_server)
    }

    fn trigger_point(&mut self, tp: &TriggerPoint) -> Result<(), CodecError> {
        self.put_u8(tp.condition_type_cnf as u8)?;
        self.put_count(tp.spts.len(), "too many service point triggers")?;
        for spt in &tp.spts {
            self.spt(spt)?;
        }
        Ok(())
    }

    fn spt(&mut self, spt: &Spt) -> Result<(), CodecError> {
        let packed = ((spt.condition_negated as u8) << 7)
            | ((spt.registration_type & 0x07) << 4)
            | spt.kind.tag();
        self.put_u8(packed)?;
        self.put_i32(spt.group)?;
        match &spt.kind {
            SptKind::RequestUri(uri) => self.put_str(uri),
            SptKind::Method(method) => self.put_str(method),
            SptKind::SipHeader {
                header_type,
                header,
                content,
            } => {
                self.put_i16(*header_type)?;
                self.put_str(header)?;
                self.put_str(content)
            }
            SptKind::SessionCase(case) => self.put_i8(*case),
            SptKind::SessionDescription { line, content } => {
                self.put_str(line)?;
                self.put_str(content)
            }
        }
    }

    fn application_server(&mut self, server: &ApplicationServer) -> Result<(), CodecError> {
        self.put_str(&server.server_name)?;
        self.put_i8(server.default_handling)?;
        self.put_str(&server.service_info)
    }
}

struct Decoder<'a> {
    src: &'a [u8],
    total: usize,
}

impl<'a> Decoder<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            total: src.len(),
        }
    }

    fn offset(&self) -> usize {
        self.total - self.src.remaining()
    }

    fn error(&self, what: &'static str) -> CodecError {
        CodecError::Decode {
            offset: self.offset(),
            what,
        }
    }

    fn need(&self, len: usize, what: &'static str) -> Result<(), CodecError> {
        if self.src.remaining() < len {
            Err(self.error(what))
        } else {
            Ok(())
        }
    }

    fn get_u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        self.need(1, what)?;
        Ok(self.src.get_u8())
    }

    fn peek_u8(&self, what: &'static str) -> Result<u8, CodecError> {
        self.need(1, what)?;
        Ok(self.src.chunk()[0])
    }

    fn get_i8(&mut self, what: &'static str) -> Result<i8, CodecError> {
        self.need(1, what)?;
        Ok(self.src.get_i8())
    }

    fn get_u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        self.need(2, what)?;
        Ok(self.src.get_u16_le())
    }

    fn get_i16(&mut self, what: &'static str) -> Result<i16, CodecError> {
        self.need(2, what)?;
        Ok(self.src.get_i16_le())
    }

    fn get_i32(&mut self, what: &'static str) -> Result<i32, CodecError> {
        self.need(4, what)?;
        Ok(self.src.get_i32_le())
    }

    fn get_str(&mut self, what: &'static str) -> Result<String, CodecError> {
        let len = self.get_u16(what)? as usize;
        self.need(len, what)?;
        let text = std::str::from_utf8(&self.src[..len]).map_err(|_| self.error("invalid utf-8"))?;
        let owned = text.to_owned();
        self.src.advance(len);
        Ok(owned)
    }

    fn subscription(&mut self) -> Result<ImsSubscription, CodecError> {
        let private_identity = self.get_str("private identity")?;
        let count = self.get_u16("service profile count")? as usize;
        let mut service_profiles = Vec::with_capacity(count.min(self.src.remaining()));
        for _ in 0..count {
            service_profiles.push(self.profile()?);
        }
        Ok(ImsSubscription {
            private_identity,
            service_profiles,
        })
    }

    fn profile(&mut self) -> Result<ServiceProfile, CodecError> {
        let count = self.get_u16("public identity count")? as usize;
        let mut public_identities = Vec::with_capacity(count.min(self.src.remaining()));
        for _ in 0..count {
            let barring = self.get_i8("public identity barring")? != 0;
            let identity = self.get_str("public identity")?;
            public_identities.push(PublicIdentity {
                barring,
                identity,
                wildcarded_psi: None,
            });
        }

        let count = self.get_u16("filter criteria count")? as usize;
        let mut filter_criteria = Vec::with_capacity(count.min(self.src.remaining()));
        for _ in 0..count {
            filter_criteria.push(self.filter_criteria()?);
        }

        let cn = self.get_i32("cn service auth")?;
        let cn_service_auth = (cn as u32 != NO_CN_AUTH).then_some(CnServiceAuth {
            subscribed_media_profile_id: cn,
        });

        let count = self.get_u16("shared ifc set count")? as usize;
        let mut shared_ifc_sets = Vec::with_capacity(count.min(self.src.remaining() / 4));
        for _ in 0..count {
            shared_ifc_sets.push(self.get_i32("shared ifc set")?);
        }

        Ok(ServiceProfile {
            public_identities,
            filter_criteria,
            cn_service_auth,
            shared_ifc_sets,
        })
    }

    fn filter_criteria(&mut self) -> Result<FilterCriteria, CodecError> {
        let priority = self.get_i32("filter criteria priority")?;
        let profile_part_indicator = match self.get_u8("profile part indicator")? {
            0 => None,
            n => Some(
                ProfilePartIndicator::from_u8(n - 1)
                    .ok_or_else(|| self.error("unknown profile part indicator"))?,
            ),
        };
        let trigger_point = if self.peek_u8("trigger point")? == NO_TRIGGER_POINT {
            self.src.advance(1);
            None
        } else {
            Some(self.trigger_point()?)
        };
        let application_server = self.application_server()?;
        Ok(FilterCriteria {
            priority,
            trigger_point,
            application_server,
            profile_part_indicator,
        })
    }

    fn trigger_point(&mut self) -> Result<TriggerPoint, CodecError> {
        let condition_type_cnf = self.get_u8("trigger point condition type")? != 0;
        let count = self.get_u16("spt count")? as usize;
        let mut spts = Vec::with_capacity(count.min(self.src.remaining()));
        for _ in 0..count {
            spts.push(self.spt()?);
        }
        Ok(TriggerPoint {
            condition_type_cnf,
            spts,
        })
    }

    fn spt(&mut self) -> Result<Spt, CodecError> {
        let packed = self.get_u8("spt type")?;
        let group = self.get_i32("spt group")?;
        let kind = match packed & 0x0f {
            1 => SptKind::RequestUri(self.get_str("spt request uri")?),
            2 => SptKind::Method(self.get_str("spt method")?),
            3 => {
                let header_type = self.get_i16("spt header type")?;
                let header = self.get_str("spt header")?;
                let content = self.get_str("spt header content")?;
                SptKind::SipHeader {
                    header_type,
                    header,
                    content,
                }
            }
            4 => SptKind::SessionCase(self.get_i8("spt session case")?),
            5 => {
                let line = self.get_str("spt session description line")?;
                let content = self.get_str("spt session description content")?;
                SptKind::SessionDescription { line, content }
            }
            _ => return Err(self.error("unknown spt type")),
        };
        Ok(Spt {
            condition_negated: packed & 0x80 != 0,
            group,
            registration_type: (packed >> 4) & 0x07,
            kind,
        })
    }

    fn application_server(&mut self) -> Result<ApplicationServer, CodecError> {
        let server_name = self.get_str("application server name")?;
        let default_handling = self.get_i8("application server default handling")?;
        let service_info = self.get_str("application server service info")?;
        Ok(ApplicationServer {
            server_name,
            default_handling,
            service_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ifc_heavy() -> ImsSubscription {
        let tp = TriggerPoint::cnf()
            .with_spt(Spt::new(0, SptKind::Method("INVITE".into())).with_registration_type(3))
            .with_spt(
                Spt::new(
                    1,
                    SptKind::SipHeader {
                        header_type: 7,
                        header: "P-Asserted-Service".into(),
                        content: "urn:urn-7:3gpp-service.ims.icsi.mmtel".into(),
                    },
                )
                .negated(),
            )
            .with_spt(Spt::new(2, SptKind::SessionCase(2)))
            .with_spt(Spt::new(
                2,
                SptKind::SessionDescription {
                    line: "m".into(),
                    content: "audio".into(),
                },
            ))
            .with_spt(Spt::new(3, SptKind::RequestUri("sip:voicemail".into())));
        ImsSubscription::new("alice@ims.example.com").with_profile(
            ServiceProfile::new()
                .with_identity(PublicIdentity::new("sip:alice@ims.example.com"))
                .with_identity(PublicIdentity::new("tel:+15551234").barred())
                .with_criteria(
                    FilterCriteria::new(
                        10,
                        ApplicationServer::new("sip:tas.ims.example.com")
                            .with_default_handling(1)
                            .with_service_info("mmtel"),
                    )
                    .with_trigger_point(tp)
                    .with_profile_part_indicator(ProfilePartIndicator::Unregistered),
                )
                .with_criteria(FilterCriteria::new(
                    20,
                    ApplicationServer::new("sip:as2.ims.example.com"),
                ))
                .with_cn_service_auth(CnServiceAuth {
                    subscribed_media_profile_id: 4,
                })
                .with_shared_ifc_set(1)
                .with_shared_ifc_set(99),
        )
    }

    #[test]
    fn encodes_minimal_document_byte_for_byte() {
        let sub = ImsSubscription::new("ab").with_profile(
            ServiceProfile::new().with_identity(PublicIdentity::new("x").barred()),
        );
        let buf = encode(&sub).unwrap();
        assert_eq!(
            buf,
            vec![
                2, 0, b'a', b'b', // private identity
                1, 0, // profile count
                1, 0, 1, 1, 0, b'x', // one barred identity
                0, 0, // no filter criteria
                0xff, 0xff, 0xff, 0xff, // no cn auth
                0, 0, // no shared ifc sets
            ]
        );
    }

    #[test]
    fn packs_spt_type_byte() {
        let sub = ImsSubscription::new("").with_profile(ServiceProfile::new().with_criteria(
            FilterCriteria::new(0, ApplicationServer::default()).with_trigger_point(
                TriggerPoint::dnf().with_spt(
                    Spt::new(-1, SptKind::SessionCase(3))
                        .negated()
                        .with_registration_type(5),
                ),
            ),
        ));
        let buf = encode(&sub).unwrap();
        // private identity (2) + profile count (2) + identity count (2) + criteria count (2)
        // + priority (4) + ppi (1) + cnf (1) + spt count (2)
        let spt_at = 2 + 2 + 2 + 2 + 4 + 1 + 1 + 2;
        assert_eq!(buf[spt_at], 0x80 | (5 << 4) | 4);
        assert_eq!(&buf[spt_at + 1..spt_at + 5], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(buf[spt_at + 5], 3);
    }

    #[test]
    fn absent_trigger_point_uses_marker() {
        let sub = ImsSubscription::new("").with_profile(
            ServiceProfile::new()
                .with_criteria(FilterCriteria::new(0x01020304, ApplicationServer::default())),
        );
        let buf = encode(&sub).unwrap();
        assert_eq!(&buf[8..12], &[4, 3, 2, 1]);
        assert_eq!(buf[12], 0);
        assert_eq!(buf[13], NO_TRIGGER_POINT);
    }

    #[test]
    fn round_trips_full_document() {
        let sub = ifc_heavy();
        let decoded = decode(&encode(&sub).unwrap()).unwrap();
        assert_eq!(decoded, sub);
    }

    #[test]
    fn wildcard_is_not_persisted() {
        let sub = ImsSubscription::new("p").with_profile(ServiceProfile::new().with_identity(
            PublicIdentity::new("sip:!.*!@ims.example.com").with_wildcard("sip:*@ims"),
        ));
        let decoded = decode(&encode(&sub).unwrap()).unwrap();
        assert_eq!(decoded.service_profiles[0].public_identities[0].wildcarded_psi, None);
    }

    #[test]
    fn truncated_string_reports_offset() {
        let mut buf = encode(&ifc_heavy()).unwrap();
        buf.truncate(10);
        match decode(&buf) {
            Err(CodecError::Decode { offset, .. }) => assert!(offset <= 10),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn every_truncation_fails_cleanly() {
        let buf = encode(&ifc_heavy()).unwrap();
        for len in 0..buf.len() {
            assert!(decode(&buf[..len]).is_err(), "prefix of {} bytes decoded", len);
        }
    }

    #[test]
    fn rejects_unknown_spt_type() {
        let sub = ImsSubscription::new("").with_profile(ServiceProfile::new().with_criteria(
            FilterCriteria::new(0, ApplicationServer::default())
                .with_trigger_point(TriggerPoint::dnf().with_spt(Spt::new(0, SptKind::SessionCase(0)))),
        ));
        let mut buf = encode(&sub).unwrap();
        let spt_at = 2 + 2 + 2 + 2 + 4 + 1 + 1 + 2;
        buf[spt_at] = 9;
        assert_eq!(
            decode(&buf),
            Err(CodecError::Decode {
                offset: spt_at + 5,
                what: "unknown spt type"
            })
        );
    }

    #[test]
    fn rejects_invalid_utf8() {
        let buf = [2, 0, 0xc3, 0x28, 0, 0];
        assert!(matches!(
            decode(&buf),
            Err(CodecError::Decode { what: "invalid utf-8", .. })
        ));
    }

    #[test]
    fn oversized_string_is_truncated() {
        let long = "é".repeat(40_000);
        let sub = ImsSubscription::new(long);
        let decoded = decode(&encode(&sub).unwrap()).unwrap();
        assert_eq!(decoded.private_identity.len(), 65534);
        assert!(decoded.private_identity.chars().all(|c| c == 'é'));
    }

    #[test]
    fn cn_auth_marker_collision_is_rejected() {
        let sub = ImsSubscription::new("").with_profile(ServiceProfile::new().with_cn_service_auth(
            CnServiceAuth {
                subscribed_media_profile_id: -1,
            },
        ));
        let mut buf = vec![7u8];
        assert!(matches!(
            encode_into(&mut buf, &sub),
            Err(CodecError::Unrepresentable(_))
        ));
        assert_eq!(buf, vec![7u8]);
    }
}
