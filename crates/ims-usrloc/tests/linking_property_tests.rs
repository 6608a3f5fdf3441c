// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use ims_usrloc::{
    ContactHandle, ContactInfo, ImpuInfo, MaxContactBehaviour, RegState, Usrloc, UsrlocConfig,
    UsrlocError,
};
use proptest::prelude::*;

const RECORDS: usize = 3;
const CONTACTS: usize = 5;

#[derive(Debug, Clone, Copy)]
enum Op {
    Link(usize, usize),
    Unlink(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..RECORDS, 0..CONTACTS).prop_map(|(r, c)| Op::Link(r, c)),
        1 => (0..RECORDS, 0..CONTACTS).prop_map(|(r, c)| Op::Unlink(r, c)),
    ]
}

fn behaviour() -> impl Strategy<Value = MaxContactBehaviour> {
    prop::sample::select(vec![
        MaxContactBehaviour::Reject,
        MaxContactBehaviour::OverwriteOldest,
    ])
}

fn identity(r: usize) -> String {
    format!("sip:user{}@example.com", r)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn links_stay_bounded_and_counted(
        max in 1usize..4,
        policy in behaviour(),
        ops in prop::collection::vec(op(), 1..40),
    ) {
        let ul = Usrloc::init(UsrlocConfig::small().with_max_contacts(max, policy)).unwrap();
        let domain = ul.register_udomain("location").unwrap();
        for r in 0..RECORDS {
            domain.insert(&identity(r), &ImpuInfo::new(RegState::Registered)).unwrap();
        }
        let contacts: Vec<ContactHandle> = (0..CONTACTS)
            .map(|c| {
                ul.contacts()
                    .insert(&format!("sip:ue{}@192.0.2.{}", c, c), &ContactInfo::new(0))
                    .unwrap()
            })
            .collect();
        let mut model: Vec<Vec<usize>> = vec![Vec::new(); RECORDS];

        for op in ops {
            match op {
                Op::Link(r, c) => {
                    let result = domain.link_contact(&identity(r), contacts[c], false);
                    let list = &mut model[r];
                    if list.contains(&c) {
                        prop_assert_eq!(result, Ok(()));
                    } else if list.len() >= max {
                        match policy {
                            MaxContactBehaviour::OverwriteOldest => {
                                prop_assert_eq!(result, Ok(()));
                                list.remove(0);
                                list.push(c);
                            }
                            _ => prop_assert_eq!(result, Err(UsrlocError::TooManyContacts { limit: max })),
                        }
                    } else {
                        prop_assert_eq!(result, Ok(()));
                        list.push(c);
                    }
                }
                Op::Unlink(r, c) => {
                    let result = domain.unlink_contact(&identity(r), contacts[c], false);
                    let list = &mut model[r];
                    match list.iter().position(|x| *x == c) {
                        Some(pos) => {
                            prop_assert_eq!(result, Ok(()));
                            list.remove(pos);
                        }
                        None => prop_assert_eq!(result, Err(UsrlocError::NotFound("linked contact"))),
                    }
                }
            }

            for (r, expected) in model.iter().enumerate() {
                let actual = domain
                    .with_impu(&identity(r), |rec| rec.contacts().as_slice().to_vec())
                    .unwrap();
                let expected: Vec<ContactHandle> = expected.iter().map(|c| contacts[*c]).collect();
                prop_assert!(actual.len() <= max);
                prop_assert_eq!(actual, expected);
            }
            for (c, handle) in contacts.iter().enumerate() {
                let holders = model.iter().filter(|list| list.contains(&c)).count() as i32;
                let refs = ul.contacts().get(*handle).unwrap().ref_count();
                // One reference stays with the creator.
                prop_assert_eq!(refs, holders + 1);
            }
        }
    }
}
