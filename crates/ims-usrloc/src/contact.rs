// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Contact bindings held by the contact store.

use std::fmt;
use std::net::SocketAddr;

use smol_str::SmolStr;

use crate::callbacks::CallbackList;
use crate::dialog::DialogRef;
use crate::error::{assign, assign_opt, try_copy, Result};

/// q-value of a contact that did not carry one.
pub const Q_UNSPECIFIED: i32 = -1;

/// Stable reference to a contact in the contact store.
///
/// Handles stay cheap to copy; the store resolves them under the owning
/// slot's lock and reports `NotFound` once the contact is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContactHandle {
    pub(crate) slot: usize,
    pub(crate) id: u64,
}

impl ContactHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Display for ContactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.id)
    }
}

/// Generic Contact header parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactParam {
    pub name: SmolStr,
    pub value: Option<SmolStr>,
}

impl ContactParam {
    pub fn new(name: impl Into<SmolStr>, value: Option<&str>) -> Self {
        Self {
            name: name.into(),
            value: value.map(SmolStr::new),
        }
    }
}

/// Registration attributes supplied on insert and update.
#[derive(Debug, Clone)]
pub struct ContactInfo {
    /// Absolute expiry in seconds; 0 means permanent.
    pub expires: i64,
    /// q-value in thousandths, or [`Q_UNSPECIFIED`].
    pub q: i32,
    pub call_id: String,
    pub cseq: i32,
    pub flags: u32,
    pub cflags: u32,
    pub user_agent: String,
    pub received: Option<String>,
    pub path: Option<String>,
    /// Supported methods bitmask.
    pub methods: u32,
    pub last_modified: i64,
    pub params: Vec<ContactParam>,
    pub sock: Option<SocketAddr>,
}

impl Default for ContactInfo {
    fn default() -> Self {
        Self {
            expires: 0,
            q: Q_UNSPECIFIED,
            call_id: String::new(),
            cseq: 0,
            flags: 0,
            cflags: 0,
            user_agent: String::new(),
            received: None,
            path: None,
            methods: u32::MAX,
            last_modified: 0,
            params: Vec::new(),
            sock: None,
        }
    }
}

impl ContactInfo {
    pub fn new(expires: i64) -> Self {
        Self {
            expires,
            ..Self::default()
        }
    }

    pub fn with_q(mut self, q: i32) -> Self {
        self.q = q;
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>, cseq: i32) -> Self {
        self.call_id = call_id.into();
        self.cseq = cseq;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cflags(mut self, cflags: u32) -> Self {
        self.cflags = cflags;
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn with_received(mut self, received: impl Into<String>) -> Self {
        self.received = Some(received.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_methods(mut self, methods: u32) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_last_modified(mut self, ts: i64) -> Self {
        self.last_modified = ts;
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.push(ContactParam::new(name, value));
        self
    }

    pub fn with_sock(mut self, sock: SocketAddr) -> Self {
        self.sock = Some(sock);
        self
    }
}

/// A registered contact.
#[derive(Debug, Clone)]
pub struct Contact {
    pub(crate) id: u64,
    pub(crate) slot: usize,
    pub(crate) uri: String,
    pub(crate) hash: u32,
    pub(crate) ref_count: i32,
    pub(crate) expires: i64,
    pub(crate) q: i32,
    pub(crate) call_id: String,
    pub(crate) cseq: i32,
    pub(crate) flags: u32,
    pub(crate) cflags: u32,
    pub(crate) user_agent: String,
    pub(crate) received: Option<String>,
    pub(crate) path: Option<String>,
    pub(crate) methods: u32,
    pub(crate) last_modified: i64,
    pub(crate) params: Vec<ContactParam>,
    pub(crate) sock: Option<SocketAddr>,
    pub(crate) dialogs: Vec<DialogRef>,
    pub(crate) callbacks: CallbackList,
}

impl Contact {
    pub(crate) fn create(
        id: u64,
        slot: usize,
        hash: u32,
        uri: &str,
        info: &ContactInfo,
    ) -> Result<Self> {
        let mut params = Vec::new();
        params.try_reserve_exact(info.params.len())?;
        params.extend(info.params.iter().cloned());
        Ok(Self {
            id,
            slot,
            uri: try_copy(uri)?,
            hash,
            ref_count: 1,
            expires: info.expires,
            q: info.q,
            call_id: try_copy(&info.call_id)?,
            cseq: info.cseq,
            flags: info.flags,
            cflags: info.cflags,
            user_agent: try_copy(&info.user_agent)?,
            received: info.received.as_deref().map(try_copy).transpose()?,
            path: info.path.as_deref().map(try_copy).transpose()?,
            methods: info.methods,
            last_modified: info.last_modified,
            params,
            sock: info.sock,
            dialogs: Vec::new(),
            callbacks: CallbackList::new(),
        })
    }

    /// Applies `info` in place. String buffers are reused when large enough.
    pub(crate) fn apply(&mut self, info: &ContactInfo) -> Result<()> {
        assign(&mut self.call_id, &info.call_id)?;
        assign(&mut self.user_agent, &info.user_agent)?;
        assign_opt(&mut self.received, info.received.as_deref())?;
        assign_opt(&mut self.path, info.path.as_deref())?;
        if self.params.capacity() < info.params.len() {
            self.params
                .try_reserve_exact(info.params.len() - self.params.len())?;
        }
        self.params.clear();
        self.params.extend(info.params.iter().cloned());
        self.expires = info.expires;
        self.q = info.q;
        self.cseq = info.cseq;
        self.flags = info.flags;
        self.cflags = info.cflags;
        self.methods = info.methods;
        self.last_modified = info.last_modified;
        self.sock = info.sock;
        Ok(())
    }

    pub fn handle(&self) -> ContactHandle {
        ContactHandle {
            slot: self.slot,
            id: self.id,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    pub fn expires(&self) -> i64 {
        self.expires
    }

    pub fn q(&self) -> i32 {
        self.q
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn cseq(&self) -> i32 {
        self.cseq
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn cflags(&self) -> u32 {
        self.cflags
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn received(&self) -> Option<&str> {
        self.received.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn methods(&self) -> u32 {
        self.methods
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn params(&self) -> &[ContactParam] {
        &self.params
    }

    pub fn sock(&self) -> Option<SocketAddr> {
        self.sock
    }

    pub fn dialogs(&self) -> &[DialogRef] {
        &self.dialogs
    }

    /// Permanent contacts (expires == 0) never lapse.
    pub fn is_valid(&self, now: i64) -> bool {
        self.expires == 0 || self.expires > now
    }

    /// Parameters serialized as `name=value;name` for the `contact` table.
    pub fn params_string(&self) -> String {
        let mut out = String::new();
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(&param.name);
            if let Some(value) = &param.value {
                out.push('=');
                out.push_str(value);
            }
        }
        out
    }
}

/// Inverse of [`Contact::params_string`].
pub fn parse_params(s: &str) -> Vec<ContactParam> {
    s.split(';')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, value)) => ContactParam::new(name, Some(value)),
            None => ContactParam::new(p, None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(info: &ContactInfo) -> Contact {
        Contact::create(1, 0, 7, "sip:alice@192.0.2.1:5060", info).unwrap()
    }

    #[test]
    fn create_starts_with_creator_reference() {
        let c = contact(&ContactInfo::new(100).with_user_agent("phone/1.0"));
        assert_eq!(c.ref_count(), 1);
        assert_eq!(c.user_agent(), "phone/1.0");
        assert_eq!(c.handle(), ContactHandle { slot: 0, id: 1 });
    }

    #[test]
    fn validity_honours_permanent_contacts() {
        assert!(contact(&ContactInfo::new(0)).is_valid(i64::MAX));
        let c = contact(&ContactInfo::new(100));
        assert!(c.is_valid(99));
        assert!(!c.is_valid(100));
    }

    #[test]
    fn apply_replaces_fields_and_drops_absent_ones() {
        let mut c = contact(
            &ContactInfo::new(100)
                .with_received("sip:10.0.0.1:5060")
                .with_path("<sip:pcscf.example.com;lr>")
                .with_param("+sip.instance", Some("\"<urn:uuid:1>\"")),
        );
        c.apply(&ContactInfo::new(200).with_call_id("abc", 2))
            .unwrap();
        assert_eq!(c.expires(), 200);
        assert_eq!(c.call_id(), "abc");
        assert_eq!(c.cseq(), 2);
        assert!(c.received().is_none());
        assert!(c.path().is_none());
        assert!(c.params().is_empty());
    }

    #[test]
    fn params_round_trip_through_string() {
        let c = contact(
            &ContactInfo::new(0)
                .with_param("expires", Some("3600"))
                .with_param("reg-id", Some("1"))
                .with_param("ob", None),
        );
        let s = c.params_string();
        assert_eq!(s, "expires=3600;reg-id=1;ob");
        assert_eq!(parse_params(&s), c.params().to_vec());
        assert!(parse_params("").is_empty());
    }
}
