//! Property-based tests for the quantity ledger
//!
//! These verify the invariants the ledger owes every caller regardless of
//! the specific sequence of operations: conservation of quantity across
//! reserve/deduct/restore, idempotent deduction, and no oversell under
//! concurrent reservations.
//!
//! Each case opens its own sled database under a tempdir (sled holds a
//! file lock per database), so the case count is kept deliberately low.
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use asset_approval::batch::Submission;
use asset_approval::error::WorkflowError;
use asset_approval::ledger::{DeductOutcome, LedgerReason, QuantityLedger};
use asset_approval::request::InventoryItem;
use asset_approval::service::{ReturnLine, WorkflowService};
use asset_approval::types::{Criticality, EntityKind, ReturnCondition, Role};

fn open_service(name: &str) -> (tempfile::TempDir, WorkflowService, Arc<sled::Db>) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db = Arc::new(sled::open(temp_dir.path().join(name)).unwrap());
    db.clear().unwrap();
    (temp_dir, WorkflowService::new(Arc::clone(&db)), db)
}

fn stocked(svc: &WorkflowService, qty: u64) -> String {
    let item = InventoryItem::new("prop item", true, 100);
    let item_ref = item.item_ref.clone();
    svc.ledger().register_item(&item).unwrap();
    svc.ledger().stock_receipt(&item_ref, qty).unwrap();
    item_ref
}

fn condition_strategy() -> impl Strategy<Value = ReturnCondition> {
    prop_oneof![
        Just(ReturnCondition::Good),
        Just(ReturnCondition::Damaged),
        Just(ReturnCondition::Lost),
        Just(ReturnCondition::Consumed),
    ]
}

/// One borrow-then-return round: quantity and the condition it comes
/// back in.
fn round_strategy() -> impl Strategy<Value = Vec<(u32, ReturnCondition)>> {
    prop::collection::vec((1u32..=5, condition_strategy()), 1..=6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: for any sequence of borrow/return rounds,
    /// `available_after = available_before - deducted + restored`,
    /// the materialized counter matches the sum of ledger deltas, and
    /// availability never goes negative.
    #[test]
    fn prop_reservation_conservation(
        initial in 10u64..=40,
        rounds in round_strategy(),
    ) {
        let (_tmp, svc, _db) = open_service("prop_conservation.db");
        let item_ref = stocked(&svc, initial);

        let mut expected = initial as i64;

        for (qty, condition) in rounds {
            if u64::from(qty) > svc.ledger().headroom(&item_ref).unwrap() {
                // short stock must reject and change nothing
                let err = svc
                    .submit_request(
                        Submission::new(EntityKind::BorrowedTool, "user_wh", Role::Warehouseman)
                            .pin_criticality(Criticality::Basic)
                            .streamlined()
                            .line(&item_ref, qty),
                    )
                    .unwrap_err();
                let is_insufficient = matches!(err, WorkflowError::InsufficientQuantity { .. });
                prop_assert!(is_insufficient);
                prop_assert_eq!(svc.ledger().available(&item_ref).unwrap() as i64, expected);
                continue;
            }

            let req = svc
                .submit_request(
                    Submission::new(EntityKind::BorrowedTool, "user_wh", Role::Warehouseman)
                        .pin_criticality(Criticality::Basic)
                        .streamlined()
                        .line(&item_ref, qty),
                )
                .unwrap();
            expected -= i64::from(qty);
            prop_assert_eq!(svc.ledger().available(&item_ref).unwrap() as i64, expected);

            let line_id = req.line_items[0].line_id.clone();
            svc.return_items(
                &req.request_id,
                "user_wh",
                Role::Warehouseman,
                vec![ReturnLine {
                    line_id,
                    quantity: qty,
                    condition,
                }],
                None,
            )
            .unwrap();
            if condition.restores_stock() {
                expected += i64::from(qty);
            }

            let available = svc.ledger().available(&item_ref).unwrap() as i64;
            prop_assert_eq!(available, expected);
            prop_assert!(available >= 0);

            // the counter is exactly the sum of the append-only entries
            let delta_sum: i64 = svc
                .ledger()
                .entries_for_item(&item_ref)
                .unwrap()
                .iter()
                .map(|e| e.on_hand_delta)
                .sum();
            prop_assert_eq!(delta_sum, available);

            // line bookkeeping never violates its invariants
            let stored = svc.request(&req.request_id).unwrap();
            prop_assert!(stored.line_items.iter().all(|l| l.invariants_hold()));
        }
    }

    /// Property: deduct applies exactly once. The second call reports
    /// `AlreadyDeducted`, appends nothing, and moves nothing.
    #[test]
    fn prop_deduct_is_idempotent(
        stock in 5u64..=30,
        qty in 1u32..=5,
    ) {
        let (_tmp, svc, _db) = open_service("prop_idempotent.db");
        let item_ref = stocked(&svc, stock);

        let req = svc
            .submit_request(
                Submission::new(EntityKind::BorrowedTool, "user_wh", Role::Warehouseman)
                    .pin_criticality(Criticality::Basic)
                    .as_draft()
                    .line(&item_ref, qty),
            )
            .unwrap();
        let line_id = req.line_items[0].line_id.clone();
        let ledger = svc.ledger();

        prop_assert_eq!(ledger.deduct(&line_id, qty).unwrap(), DeductOutcome::Applied);
        let after_first = ledger.available(&item_ref).unwrap();

        prop_assert_eq!(
            ledger.deduct(&line_id, qty).unwrap(),
            DeductOutcome::AlreadyDeducted
        );
        prop_assert_eq!(ledger.available(&item_ref).unwrap(), after_first);

        let non_zero_deducts = ledger
            .entries_for_item(&item_ref)
            .unwrap()
            .into_iter()
            .filter(|e| e.reason == LedgerReason::ReleaseDeduct && e.on_hand_delta != 0)
            .count();
        prop_assert_eq!(non_zero_deducts, 1);
    }

    /// Property: a return can never account for more than is out.
    #[test]
    fn prop_restore_bounded_by_outstanding(
        qty in 1u32..=5,
        excess in 1u32..=5,
    ) {
        let (_tmp, svc, _db) = open_service("prop_restore_bound.db");
        let item_ref = stocked(&svc, 50);

        let req = svc
            .submit_request(
                Submission::new(EntityKind::BorrowedTool, "user_wh", Role::Warehouseman)
                    .pin_criticality(Criticality::Basic)
                    .streamlined()
                    .line(&item_ref, qty),
            )
            .unwrap();
        let line_id = req.line_items[0].line_id.clone();

        let err = svc
            .ledger()
            .restore(&line_id, qty + excess, ReturnCondition::Good)
            .unwrap_err();
        prop_assert!(matches!(err, WorkflowError::Validation(_)));

        // the failed restore left the counters alone
        prop_assert_eq!(
            svc.ledger().available(&item_ref).unwrap(),
            50 - u64::from(qty)
        );
    }
}

/// N concurrent reservations of one unit against K units of headroom end
/// with exactly K granted and N-K refused, never more.
#[test]
fn concurrent_reserves_never_oversell() {
    const STOCK: u64 = 3;
    const CALLERS: usize = 8;

    let (_tmp, svc, db) = open_service("concurrent_reserve.db");
    let item_ref = stocked(&svc, STOCK);

    let mut handles = Vec::new();
    for i in 0..CALLERS {
        let db = Arc::clone(&db);
        let item_ref = item_ref.clone();
        handles.push(thread::spawn(move || {
            let ledger = QuantityLedger::new(db);
            ledger.reserve(&item_ref, 1, &format!("req_{i}"))
        }));
    }

    let mut granted = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(()) => granted += 1,
            Err(WorkflowError::InsufficientQuantity { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(granted, STOCK as usize);
    assert_eq!(refused, CALLERS - STOCK as usize);

    let ledger = QuantityLedger::new(Arc::clone(&db));
    assert_eq!(ledger.headroom(&item_ref).unwrap(), 0);
    assert_eq!(ledger.item(&item_ref).unwrap().reserved, STOCK);

    let reserve_entries = ledger
        .entries_for_item(&item_ref)
        .unwrap()
        .into_iter()
        .filter(|e| e.reason == LedgerReason::Reserve)
        .count();
    assert_eq!(reserve_entries, STOCK as usize);
}
