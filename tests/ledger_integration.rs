//! Integration tests for the points ledger service
//!
//! Exercises the full `LedgerService` facade against a file-backed SQLite
//! database, including the end-to-end checkout/refund/dispute scenarios and
//! the concurrency guarantees.

use std::sync::Arc;

use driverpoints_backend::ledger::{Actor, LedgerError, OrderStatus, Resolution, RewardKind};
use driverpoints_backend::models::{CausalKind, DisputeStatus, SponsorLimits};
use driverpoints_backend::LedgerService;
use tempfile::TempDir;

fn service() -> (LedgerService, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let db_path = dir.path().join("ledger.db");
    let service = LedgerService::open(db_path.to_str().unwrap()).expect("open ledger");
    (service, dir)
}

fn sponsor_actor() -> Actor {
    Actor::Sponsor {
        user_id: "sponsor-user-1".into(),
    }
}

#[tokio::test]
async fn test_order_debit_refund_and_idempotency() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();

    // Seed to 100 via a sponsor award.
    service
        .apply_change(rel.id, 100, "signup bonus", &sponsor_actor(), None)
        .await
        .unwrap();

    // Checkout debits 30.
    let debit = service.debit_for_order(rel.id, 30, "order-1").await.unwrap();
    assert_eq!(debit.delta, -30);
    assert_eq!(debit.balance_before, 100);
    assert_eq!(debit.balance_after, 70);

    // Refund restores the balance.
    let credit = service
        .credit_for_refund("order-1", 30, "customer return")
        .await
        .unwrap();
    assert_eq!(credit.delta, 30);
    assert_eq!(credit.balance_before, 70);
    assert_eq!(credit.balance_after, 100);

    // Second refund attempt is rejected and changes nothing.
    let err = service
        .credit_for_refund("order-1", 30, "customer return")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyRefunded { .. }));
    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 100);

    // Exactly three records, in order, chained.
    let replay = service.replay_balance(rel.id).await.unwrap();
    assert!(replay.consistent);
    assert_eq!(replay.records_checked, 3);
    assert_eq!(replay.computed_balance, 100);
}

#[tokio::test]
async fn test_insufficient_balance_leaves_no_trace() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();

    let err = service.debit_for_order(rel.id, 10, "order-x").await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 0);
    assert_eq!(service.history(rel.id, 50).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_dispute_reversal_end_to_end() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 100, "signup bonus", &sponsor_actor(), None)
        .await
        .unwrap();
    let debit = service.debit_for_order(rel.id, 30, "order-1").await.unwrap();

    let dispute = service
        .file_dispute(&debit.id, "I was charged for an order I never placed")
        .await
        .unwrap();
    assert_eq!(dispute.status, DisputeStatus::Open);

    let dispute = service.begin_dispute_review(&dispute.id).await.unwrap();
    assert_eq!(dispute.status, DisputeStatus::UnderReview);

    let (dispute, compensation) = service
        .resolve_dispute(
            &dispute.id,
            Resolution::Reversed,
            &sponsor_actor(),
            "confirmed with the catalog vendor",
        )
        .await
        .unwrap();
    assert_eq!(dispute.status, DisputeStatus::ResolvedReversed);

    let compensation = compensation.expect("reversal produces a compensating record");
    assert_eq!(compensation.delta, 30);
    assert_eq!(
        compensation.causal_ref.as_ref().map(|c| c.kind),
        Some(CausalKind::Dispute)
    );
    assert_eq!(
        compensation.causal_ref.as_ref().map(|c| c.id.as_str()),
        Some(dispute.id.as_str())
    );

    // Original record untouched, balance restored.
    let replay = service.replay_balance(rel.id).await.unwrap();
    assert!(replay.consistent);
    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 100);

    let history = service.history(rel.id, 50).await.unwrap();
    let original = history.iter().find(|r| r.id == debit.id).unwrap();
    assert_eq!(original.delta, -30);
    assert_eq!(original.balance_before, 100);
    assert_eq!(original.balance_after, 70);
}

#[tokio::test]
async fn test_concurrent_mixed_deltas_sum_exactly() {
    let (service, _dir) = service();
    let service = Arc::new(service);
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 1000, "seed", &sponsor_actor(), None)
        .await
        .unwrap();

    // 15 credits of +20 and 10 debits of -30: net +0, 25 records.
    let mut handles = Vec::new();
    for i in 0..25 {
        let service = service.clone();
        let delta = if i < 15 { 20 } else { -30 };
        handles.push(tokio::spawn(async move {
            service
                .apply_change(
                    rel.id,
                    delta,
                    "concurrent change",
                    &Actor::Sponsor {
                        user_id: format!("sponsor-user-{}", i),
                    },
                    None,
                )
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let rel = service.get_relationship(rel.id).await.unwrap();
    assert_eq!(rel.balance, 1000);

    let replay = service.replay_balance(rel.id).await.unwrap();
    assert!(replay.consistent);
    assert_eq!(replay.records_checked, 26);
    assert_eq!(service.verify_balance(rel.id).await.unwrap(), 1000);
}

#[tokio::test]
async fn test_concurrent_refunds_credit_once() {
    let (service, _dir) = service();
    let service = Arc::new(service);
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 100, "seed", &sponsor_actor(), None)
        .await
        .unwrap();
    service.debit_for_order(rel.id, 30, "order-1").await.unwrap();

    // All four refunds pass the read-side check together; the unique
    // compensation index inside the write transaction lets only one land.
    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            service.credit_for_refund("order-1", 30, "customer return").await
        }));
    }

    let mut succeeded = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(record) => {
                succeeded += 1;
                assert_eq!(record.delta, 30);
            }
            Err(e) => assert!(matches!(e, LedgerError::AlreadyRefunded { .. })),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 100);

    let replay = service.replay_balance(rel.id).await.unwrap();
    assert!(replay.consistent);
    assert_eq!(replay.records_checked, 3);
}

#[tokio::test]
async fn test_concurrent_resolutions_reverse_once() {
    let (service, _dir) = service();
    let service = Arc::new(service);
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 100, "seed", &sponsor_actor(), None)
        .await
        .unwrap();
    let debit = service.debit_for_order(rel.id, 30, "order-1").await.unwrap();

    let dispute = service
        .file_dispute(&debit.id, "charge not recognized")
        .await
        .unwrap();
    service.begin_dispute_review(&dispute.id).await.unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        let barrier = barrier.clone();
        let dispute_id = dispute.id.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            service
                .resolve_dispute(&dispute_id, Resolution::Reversed, &sponsor_actor(), "reversed")
                .await
        }));
    }

    let mut succeeded = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok((resolved, compensation)) => {
                succeeded += 1;
                assert_eq!(resolved.status, DisputeStatus::ResolvedReversed);
                assert_eq!(compensation.unwrap().delta, 30);
            }
            Err(e) => assert!(matches!(e, LedgerError::InvalidDisputeTransition { .. })),
        }
    }
    assert_eq!(succeeded, 1);

    // One debit, one compensating credit, balance restored exactly once.
    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 100);
    let replay = service.replay_balance(rel.id).await.unwrap();
    assert!(replay.consistent);
    assert_eq!(replay.records_checked, 3);
}

#[tokio::test]
async fn test_concurrent_filings_open_one_dispute() {
    let (service, _dir) = service();
    let service = Arc::new(service);
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 100, "seed", &sponsor_actor(), None)
        .await
        .unwrap();
    let debit = service.debit_for_order(rel.id, 30, "order-1").await.unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        let barrier = barrier.clone();
        let record_id = debit.id.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            service.file_dispute(&record_id, "charge not recognized").await
        }));
    }

    let mut succeeded = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(dispute) => {
                succeeded += 1;
                assert_eq!(dispute.status, DisputeStatus::Open);
            }
            Err(e) => assert!(matches!(e, LedgerError::DisputeAlreadyExists { .. })),
        }
    }
    assert_eq!(succeeded, 1);
}

#[tokio::test]
async fn test_limits_apply_to_sponsor_actions_only() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();

    let mut limits = SponsorLimits::defaults_for("sponsor-a");
    limits.min_points_per_txn = 10;
    limits.max_points_per_txn = 50;
    service.set_limits(&limits).await.unwrap();

    // Sponsor award outside bounds is rejected.
    let err = service
        .apply_change(rel.id, 60, "big award", &sponsor_actor(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::LimitExceeded { .. }));

    // Reward credits are pre-validated and bypass the bounds.
    service
        .credit_for_reward(rel.id, 500, RewardKind::Challenge, "challenge-42")
        .await
        .unwrap();

    // Order settlement is likewise exempt (it reverses real checkout state).
    service.debit_for_order(rel.id, 200, "order-9").await.unwrap();
    service
        .credit_for_refund("order-9", 200, "refund")
        .await
        .unwrap();

    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 500);
}

#[tokio::test]
async fn test_deactivated_relationship_rejects_mutations_keeps_history() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 40, "award", &sponsor_actor(), None)
        .await
        .unwrap();

    service.deactivate(rel.id).await.unwrap();

    let err = service
        .apply_change(rel.id, 10, "award", &sponsor_actor(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::RelationshipInactive { .. }));

    // History and replay remain readable after deactivation.
    assert_eq!(service.history(rel.id, 50).await.unwrap().len(), 1);
    let replay = service.replay_balance(rel.id).await.unwrap();
    assert!(replay.consistent);
    assert_eq!(replay.stored_balance, 40);
}

#[tokio::test]
async fn test_cancellation_window_and_status() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 100, "award", &sponsor_actor(), None)
        .await
        .unwrap();
    service.debit_for_order(rel.id, 25, "order-7").await.unwrap();

    // Shipped orders cannot be cancelled.
    let err = service
        .credit_for_cancellation("order-7", 25, OrderStatus::Shipped)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::OrderNotCancellable { .. }));

    // Pre-fulfillment cancellation credits back once.
    service
        .credit_for_cancellation("order-7", 25, OrderStatus::Processing)
        .await
        .unwrap();
    let err = service
        .credit_for_cancellation("order-7", 25, OrderStatus::Placed)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyRefunded { .. }));
}

#[tokio::test]
async fn test_refund_window_enforced_from_limits() {
    let (service, _dir) = service();
    let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
    service
        .apply_change(rel.id, 100, "award", &sponsor_actor(), None)
        .await
        .unwrap();
    service.debit_for_order(rel.id, 40, "order-8").await.unwrap();

    // A zero-day window means the deadline is the debit instant itself.
    let mut limits = SponsorLimits::defaults_for("sponsor-a");
    limits.refund_window_days = 0;
    service.set_limits(&limits).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let err = service
        .credit_for_refund("order-8", 40, "late refund")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::RefundWindowExpired { .. }));
    assert_eq!(service.get_relationship(rel.id).await.unwrap().balance, 60);
}

#[tokio::test]
async fn test_balances_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let path = db_path.to_str().unwrap();

    let rel_id = {
        let service = LedgerService::open(path).unwrap();
        let rel = service.enroll("driver-1", "sponsor-a").await.unwrap();
        service
            .apply_change(rel.id, 75, "award", &sponsor_actor(), None)
            .await
            .unwrap();
        rel.id
    };

    let service = LedgerService::open(path).unwrap();
    let rel = service.get_relationship(rel_id).await.unwrap();
    assert_eq!(rel.balance, 75);
    let replay = service.replay_balance(rel_id).await.unwrap();
    assert!(replay.consistent);
}
