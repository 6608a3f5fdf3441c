// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use ims_usrloc::{ContactInfo, ImpuInfo, ManualClock, RegState, Sweeper, Usrloc, UsrlocConfig};

const NOW: i64 = 1_700_000_000;

#[tokio::test]
async fn sweeper_runs_until_shutdown() {
    let ul = Arc::new(
        Usrloc::builder(UsrlocConfig::small())
            .with_clock(Arc::new(ManualClock::new(NOW)))
            .build()
            .unwrap(),
    );
    let domain = ul.register_udomain("location").unwrap();
    domain
        .insert("sip:alice@example.com", &ImpuInfo::new(RegState::Registered))
        .unwrap();
    domain
        .add_contact(
            "sip:alice@example.com",
            "sip:alice@192.0.2.1",
            &ContactInfo::new(NOW - 1),
        )
        .unwrap();

    let sweeper = Sweeper::spawn(Arc::clone(&ul), Duration::from_millis(10));
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while ul.metrics().snapshot().sweeps < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    sweeper.shutdown().await;
    assert!(waited.is_ok(), "sweeper never ran");

    // Two passes: unlink, then reclaim.
    assert!(ul.contacts().is_empty());
    domain
        .with_impu("sip:alice@example.com", |r| {
            assert_eq!(r.reg_state(), RegState::Unregistered)
        })
        .unwrap();

    let after = ul.metrics().snapshot().sweeps;
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(ul.metrics().snapshot().sweeps, after);
}
