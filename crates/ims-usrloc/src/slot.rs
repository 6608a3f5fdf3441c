// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-size hash tables whose buckets lock independently.
//!
//! Every bucket owns its lock. IMPU buckets use a plain mutex; contact buckets
//! use a re-entrant one so a thread already holding a contact slot can enter it
//! again (dialog teardown during delete calls back into the contact table).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};

use crate::error::{Result, UsrlocError};

/// Power-of-two array of buckets addressed by `hash & (len - 1)`.
pub struct SlotTable<S> {
    slots: Box<[S]>,
    mask: u32,
}

impl<S> SlotTable<S> {
    pub fn new(size: usize, mut init: impl FnMut(usize) -> S) -> Result<Self> {
        if !size.is_power_of_two() || size > u32::MAX as usize {
            return Err(UsrlocError::Invalid(format!(
                "slot table size {} is not a power of two",
                size
            )));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(size)?;
        slots.extend((0..size).map(&mut init));
        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: (size - 1) as u32,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index_of(&self, hash: u32) -> usize {
        (hash & self.mask) as usize
    }

    pub fn slot(&self, index: usize) -> Option<&S> {
        self.slots.get(index)
    }

    pub fn slot_for(&self, hash: u32) -> &S {
        &self.slots[self.index_of(hash)]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &S)> {
        self.slots.iter().enumerate()
    }
}

/// Bucket guarded by a non-recursive mutex.
#[derive(Default)]
pub struct Slot<T> {
    inner: Mutex<T>,
    acquisitions: AtomicU64,
}

impl<T> Slot<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Blocks until the bucket is held.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.inner.lock()
    }

    /// Number of times this bucket has been locked.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Bucket guarded by a lock the holding thread may re-acquire.
///
/// The lock records its owner thread and a recursion count; re-entry by the
/// owner is a counter bump. Data sits in a `RefCell`, so callers must not hold
/// a mutable borrow across a call that may re-enter.
#[derive(Default)]
pub struct RecursiveSlot<T> {
    inner: ReentrantMutex<RefCell<T>>,
    acquisitions: AtomicU64,
}

impl<T> RecursiveSlot<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(value)),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<T>> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.inner.lock()
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}
