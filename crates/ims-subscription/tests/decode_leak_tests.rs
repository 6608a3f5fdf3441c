// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A failed decode must release everything it allocated.
//!
//! This binary installs a counting allocator that tracks live heap bytes per
//! thread, so unrelated harness activity on other threads does not skew it.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use ims_subscription::{
    decode, encode, ApplicationServer, CodecError, FilterCriteria, ImsSubscription,
    PublicIdentity, ServiceProfile, Spt, SptKind, TriggerPoint,
};

struct CountingAlloc;

thread_local! {
    static LIVE: Cell<isize> = const { Cell::new(0) };
}

fn adjust(delta: isize) {
    let _ = LIVE.try_with(|live| live.set(live.get() + delta));
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            adjust(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        adjust(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            adjust(new_size as isize - layout.size() as isize);
        }
        new_ptr
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

fn live_bytes() -> isize {
    LIVE.with(|live| live.get())
}

fn document() -> ImsSubscription {
    ImsSubscription::new("alice@ims.example.com").with_profile(
        ServiceProfile::new()
            .with_identity(PublicIdentity::new("sip:alice@ims.example.com"))
            .with_identity(PublicIdentity::new("tel:+15551234"))
            .with_criteria(
                FilterCriteria::new(1, ApplicationServer::new("sip:as.ims.example.com"))
                    .with_trigger_point(
                        TriggerPoint::cnf()
                            .with_spt(Spt::new(0, SptKind::Method("REGISTER".into())))
                            .with_spt(Spt::new(
                                1,
                                SptKind::RequestUri("sip:voicemail@ims.example.com".into()),
                            )),
                    ),
            ),
    )
}

#[test]
fn truncated_decode_leaks_nothing() {
    let blob = encode(&document()).expect("encode");

    // Cut inside the last SPT's request-uri so the length prefix claims more
    // bytes than remain, after several nested values were already built.
    let cut = blob.len() - "sip:voicemail@ims.example.com".len() / 2 - 40;
    let truncated = blob[..cut].to_vec();

    for len in [cut, 3, 30, blob.len() - 1] {
        let before = live_bytes();
        let result = decode(&truncated[..len.min(truncated.len())]);
        assert!(matches!(result, Err(CodecError::Decode { .. })));
        drop(result);
        assert_eq!(live_bytes(), before, "decode of {} bytes leaked", len);
    }
}

#[test]
fn successful_decode_frees_on_drop() {
    let blob = encode(&document()).expect("encode");
    let before = live_bytes();
    let decoded = decode(&blob).expect("decode");
    assert!(live_bytes() > before);
    drop(decoded);
    assert_eq!(live_bytes(), before);
}
