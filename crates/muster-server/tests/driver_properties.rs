//! Property-based tests for the store driver.
//!
//! These exercise the wait/watch bookkeeping across generated workloads: no
//! waiter is ever released twice, no index survives a purge, and arithmetic
//! over the decimal-string encoding is exact.

use bytes::Bytes;
use muster_proto::{Reply, Request};
use muster_server::{DriverConfig, SessionId, StoreAction, StoreDriver, StoreEvent};
use proptest::prelude::*;

fn driver() -> StoreDriver {
    StoreDriver::new(DriverConfig::default())
}

fn open(driver: &mut StoreDriver, session_id: SessionId) {
    driver.process_event(StoreEvent::SessionOpened { session_id }).unwrap();
}

fn apply(driver: &mut StoreDriver, session_id: SessionId, request: Request) -> Vec<StoreAction> {
    driver.process_event(StoreEvent::RequestReceived { session_id, request }).unwrap()
}

fn close(driver: &mut StoreDriver, session_id: SessionId) {
    driver
        .process_event(StoreEvent::SessionClosed { session_id, reason: "test".to_string() })
        .unwrap();
}

/// Sessions that received `StopWaiting` in this action batch.
fn released(actions: &[StoreAction]) -> Vec<SessionId> {
    actions
        .iter()
        .filter_map(|action| match action {
            StoreAction::Send { session_id, reply: Reply::StopWaiting } => Some(*session_id),
            _ => None,
        })
        .collect()
}

/// Property: however many clients wait on a fresh key, one write releases
/// each of them exactly once and empties the key's waiter list.
#[test]
fn prop_one_write_releases_every_single_key_waiter_once() {
    proptest!(|(waiter_count in 1usize..20)| {
        let mut d = driver();
        open(&mut d, 1);

        let waiters: Vec<SessionId> = (100..100 + waiter_count as SessionId).collect();
        for &waiter in &waiters {
            open(&mut d, waiter);
            let actions = apply(&mut d, waiter, Request::Wait { keys: vec!["/k".to_string()] });
            prop_assert!(released(&actions).is_empty());
        }

        let actions = apply(
            &mut d,
            1,
            Request::Set { key: "/k".to_string(), value: Bytes::from_static(b"v") },
        );

        prop_assert_eq!(released(&actions), waiters.clone());
        prop_assert_eq!(d.waiters_on("/k").count(), 0);
        for &waiter in &waiters {
            prop_assert_eq!(d.pending_wait(waiter), None);
        }
    });
}

/// Property: a waiter blocked on several keys is released exactly once, by
/// the write that fills in its last missing key, regardless of write order.
#[test]
fn prop_multi_key_waiter_releases_on_last_missing_key() {
    proptest!(|(key_count in 1usize..6, order in prop::collection::vec(0usize..6, 1..6))| {
        let keys: Vec<String> = (0..key_count).map(|i| format!("/k{i}")).collect();

        // Dedup the generated order into a permutation over the key set.
        let mut write_order: Vec<usize> = Vec::new();
        for i in order {
            let i = i % key_count;
            if !write_order.contains(&i) {
                write_order.push(i);
            }
        }
        for i in 0..key_count {
            if !write_order.contains(&i) {
                write_order.push(i);
            }
        }

        let mut d = driver();
        open(&mut d, 1);
        open(&mut d, 2);
        apply(&mut d, 2, Request::Wait { keys: keys.clone() });
        prop_assert_eq!(d.pending_wait(2), Some(key_count));

        let mut releases = 0;
        for (step, &i) in write_order.iter().enumerate() {
            let actions = apply(
                &mut d,
                1,
                Request::Set { key: keys[i].clone(), value: Bytes::from_static(b"v") },
            );
            releases += released(&actions).len();

            if step + 1 < key_count {
                prop_assert_eq!(d.pending_wait(2), Some(key_count - step - 1));
            }
        }

        prop_assert_eq!(releases, 1);
        prop_assert_eq!(d.pending_wait(2), None);
    });
}

/// Property: purging a session leaves no reference to it in any index, no
/// matter what it registered beforehand.
#[test]
fn prop_purge_erases_every_reference() {
    proptest!(|(
        wait_keys in prop::collection::vec("[a-z]{1,4}", 0..5),
        watch_keys in prop::collection::vec("[a-z]{1,4}", 0..5),
    )| {
        let mut d = driver();
        open(&mut d, 1);
        open(&mut d, 2);

        if !wait_keys.is_empty() {
            let keys: Vec<String> = wait_keys.iter().map(|k| format!("/{k}")).collect();
            apply(&mut d, 2, Request::Wait { keys });
        }
        for key in &watch_keys {
            apply(&mut d, 2, Request::WatchKey { key: format!("/{key}") });
        }

        close(&mut d, 2);

        prop_assert_eq!(d.session_count(), 1);
        prop_assert_eq!(d.pending_wait(2), None);
        for key in wait_keys.iter().chain(watch_keys.iter()) {
            let key = format!("/{key}");
            prop_assert!(d.waiters_on(&key).all(|s| s != 2));
            prop_assert!(d.watchers_on(&key).all(|s| s != 2));
        }

        // The store itself is untouched by a purge.
        let actions = apply(&mut d, 1, Request::GetNumKeys);
        let matched = matches!(actions[..], [StoreAction::Send { session_id: 1, .. }]);
        prop_assert!(matched);
    });
}

/// Property: two increments over an initially absent key accumulate exactly,
/// through the decimal-string representation.
#[test]
fn prop_add_accumulates_through_decimal_strings() {
    proptest!(|(a in -1_000_000_000i64..1_000_000_000, b in -1_000_000_000i64..1_000_000_000)| {
        let mut d = driver();
        open(&mut d, 1);

        let first = apply(&mut d, 1, Request::Add { key: "/n".to_string(), delta: a });
        let first_matched = matches!(
            first[..],
            [StoreAction::Send { reply: Reply::Int(n), .. }, ..] if n == a
        );
        prop_assert!(first_matched);

        let second = apply(&mut d, 1, Request::Add { key: "/n".to_string(), delta: b });
        let second_matched = matches!(
            second[..],
            [StoreAction::Send { reply: Reply::Int(n), .. }, ..] if n == a + b
        );
        prop_assert!(second_matched);
    });
}

/// Property: deleting any key twice reports erased then not-erased, and the
/// second call is never an error.
#[test]
fn prop_delete_is_idempotent() {
    proptest!(|(key in "[a-z]{1,8}", value in prop::collection::vec(any::<u8>(), 0..64))| {
        let key = format!("/{key}");
        let mut d = driver();
        open(&mut d, 1);
        apply(&mut d, 1, Request::Set { key: key.clone(), value: Bytes::from(value) });

        let first = apply(&mut d, 1, Request::DeleteKey { key: key.clone() });
        let first_matched = matches!(first[..], [StoreAction::Send { reply: Reply::Int(1), .. }]);
        prop_assert!(first_matched);

        let second = apply(&mut d, 1, Request::DeleteKey { key: key.clone() });
        let second_matched = matches!(second[..], [StoreAction::Send { reply: Reply::Int(0), .. }]);
        prop_assert!(second_matched);
    });
}
