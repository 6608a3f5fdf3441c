// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Narrow view of the dialog module that contacts need.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::Serialize;

/// Dialog handle as `(h_entry, h_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DialogRef {
    pub h_entry: u32,
    pub h_id: u32,
}

impl DialogRef {
    pub fn new(h_entry: u32, h_id: u32) -> Self {
        Self { h_entry, h_id }
    }
}

impl fmt::Display for DialogRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.h_entry, self.h_id)
    }
}

bitflags! {
    /// Dialog transitions a callback can observe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DialogEvents: u32 {
        const CONFIRMED = 1 << 0;
        const TERMINATED = 1 << 1;
        const FAILED = 1 << 2;
        const EXPIRED = 1 << 3;
    }
}

pub type DialogCallback = Arc<dyn Fn(DialogRef, DialogEvents) + Send + Sync>;

/// Dialog collaborator. Implementations may invoke callbacks synchronously
/// from inside `terminate_dialog`.
pub trait DialogApi: Send + Sync {
    /// Ends the dialog; returns false if it is unknown.
    fn terminate_dialog(&self, dialog: DialogRef) -> bool;

    fn lookup_dialog(&self, h_entry: u32, h_id: u32) -> Option<DialogRef>;

    /// Returns false if the dialog is unknown.
    fn register_dialog_callback(
        &self,
        dialog: DialogRef,
        events: DialogEvents,
        callback: DialogCallback,
    ) -> bool;
}

/// Used when no dialog module is loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDialogApi;

impl DialogApi for NoopDialogApi {
    fn terminate_dialog(&self, _dialog: DialogRef) -> bool {
        false
    }

    fn lookup_dialog(&self, _h_entry: u32, _h_id: u32) -> Option<DialogRef> {
        None
    }

    fn register_dialog_callback(
        &self,
        _dialog: DialogRef,
        _events: DialogEvents,
        _callback: DialogCallback,
    ) -> bool {
        false
    }
}
