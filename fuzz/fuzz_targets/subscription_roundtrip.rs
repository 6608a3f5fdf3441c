// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 4096 {
        return;
    }

    // Whatever decodes must re-encode to bytes that decode to the same document.
    if let Ok(doc) = ims_subscription::decode(data) {
        let encoded = match ims_subscription::encode(&doc) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let again = ims_subscription::decode(&encoded).expect("re-encoded document must decode");
        assert_eq!(doc, again);
    }
});
