// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use ims_subscription::CodecError;

use crate::persist::DbError;

pub type Result<T> = std::result::Result<T, UsrlocError>;

/// Errors returned by user location operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsrlocError {
    /// An allocation failed; nothing was linked or inserted.
    OutOfMemory,
    /// The named entity (contact, IMPU, domain, subscriber) does not exist.
    NotFound(&'static str),
    /// Bad input or configuration.
    Invalid(String),
    /// Linking would exceed the per-IMPU contact limit.
    TooManyContacts { limit: usize },
    /// A subscription blob failed to encode or decode.
    Codec(CodecError),
    /// The persistence collaborator failed where the failure cannot be absorbed.
    Persistence(DbError),
}

impl fmt::Display for UsrlocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsrlocError::OutOfMemory => write!(f, "out of memory"),
            UsrlocError::NotFound(what) => write!(f, "{} not found", what),
            UsrlocError::Invalid(msg) => write!(f, "invalid: {}", msg),
            UsrlocError::TooManyContacts { limit } => {
                write!(f, "too many contacts (limit {})", limit)
            }
            UsrlocError::Codec(err) => write!(f, "subscription codec: {}", err),
            UsrlocError::Persistence(err) => write!(f, "persistence: {}", err),
        }
    }
}

impl std::error::Error for UsrlocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UsrlocError::Codec(err) => Some(err),
            UsrlocError::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for UsrlocError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::OutOfMemory => UsrlocError::OutOfMemory,
            other => UsrlocError::Codec(other),
        }
    }
}

impl From<DbError> for UsrlocError {
    fn from(err: DbError) -> Self {
        UsrlocError::Persistence(err)
    }
}

impl From<std::collections::TryReserveError> for UsrlocError {
    fn from(_: std::collections::TryReserveError) -> Self {
        UsrlocError::OutOfMemory
    }
}

/// Copies `s` into a freshly allocated string, reporting allocation failure.
pub(crate) fn try_copy(s: &str) -> Result<String> {
    let mut out = String::new();
    out.try_reserve_exact(s.len())?;
    out.push_str(s);
    Ok(out)
}

/// Overwrites `dst` with `src`, growing the buffer only when it is too small.
pub(crate) fn assign(dst: &mut String, src: &str) -> Result<()> {
    if dst.capacity() < src.len() {
        dst.try_reserve(src.len() - dst.len())?;
    }
    dst.clear();
    dst.push_str(src);
    Ok(())
}

/// Like [`assign`] for optional fields; `None` frees the existing value.
pub(crate) fn assign_opt(dst: &mut Option<String>, src: Option<&str>) -> Result<()> {
    match (dst.as_mut(), src) {
        (Some(existing), Some(value)) => assign(existing, value),
        (None, Some(value)) => {
            *dst = Some(try_copy(value)?);
            Ok(())
        }
        (_, None) => {
            *dst = None;
            Ok(())
        }
    }
}
