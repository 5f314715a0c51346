//! Payment scenarios run end to end through the gate.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::TestHarness;
use paygate::gate::REQUESTS_FILE;
use paygate::payment::amount::parse_sol;
use paygate::payment::RequestStore;
use paygate::{GateEvent, RequestIntake, RequestStatus, UserId};
use std::sync::Arc;
use std::time::Duration;

fn price() -> u64 {
    parse_sol("0.01").expect("price")
}

/// A confirmed transfer carrying the token settles the request exactly once.
#[tokio::test]
async fn test_paid_request_is_granted() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(42);
    let request = harness.request(user).expect("request");
    let token = request.reference_token.clone();

    harness.ledger().pay("S1", Some(token.as_str()), price());
    harness.confirm();

    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.matched, 1);
    assert_eq!(report.granted, 1);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Granted));
    assert_eq!(harness.gateway().grants_for(user), 1);
    assert_eq!(
        harness
            .gate()
            .intake()
            .store()
            .latest_for_user(user)
            .and_then(|r| r.matched_tx_signature)
            .as_deref(),
        Some("S1")
    );
    assert!(harness
        .gate()
        .intake()
        .status(user)
        .contains("granted"));
    assert_eq!(harness.gateway().messages_for(user).len(), 1);
}

/// A transfer with fewer confirmations than required waits for the next cycle.
#[tokio::test]
async fn test_shallow_transfer_waits_for_confirmations() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(5);
    let token = harness.request(user).expect("request").reference_token;

    harness.ledger().pay("S1", Some(token.as_str()), price());
    harness.ledger().advance(10);

    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.examined, 0);
    assert_eq!(report.cursor, None);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Pending));

    harness.confirm();
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.granted, 1);
}

/// Two overlapping cycles over the same transfer grant once.
#[tokio::test]
async fn test_overlapping_cycles_grant_once() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(42);
    let token = harness.request(user).expect("request").reference_token;
    harness.ledger().pay("S1", Some(token.as_str()), price());
    harness.confirm();

    let (first, second) = tokio::join!(harness.gate().run_once(), harness.gate().run_once());
    let outcomes = [first.expect("first"), second.expect("second")];
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, paygate::CycleOutcome::Skipped)));

    harness.cycle().await.expect("cycle");
    assert_eq!(harness.gateway().grants_for(user), 1);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Granted));
}

/// A second payment for a settled request, then a restart, grant nothing more.
#[tokio::test]
async fn test_settled_request_is_not_regranted() {
    let mut harness = TestHarness::setup().await.expect("setup");
    let user = UserId(42);
    let token = harness.request(user).expect("request").reference_token;
    harness.ledger().pay("S1", Some(token.as_str()), price());
    harness.ledger().pay("S2", Some(token.as_str()), price());
    harness.confirm();

    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.granted, 1);
    assert_eq!(report.already_consumed, 1);

    harness.restart().await.expect("restart");
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.examined, 0);
    assert_eq!(harness.gateway().grants_for(user), 1);
}

/// An underpayment leaves the request pending; a full payment then settles it.
#[tokio::test]
async fn test_underpayment_is_rejected() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(9);
    let token = harness.request(user).expect("request").reference_token;
    harness.ledger().pay("S1", Some(token.as_str()), price() - 1);
    harness.confirm();

    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.amount_mismatch, 1);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Pending));
    assert_eq!(harness.gateway().grants_for(user), 0);

    harness.ledger().pay("S2", Some(token.as_str()), price() + 5);
    harness.confirm();
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.granted, 1);
}

/// Transfers without a usable memo are consumed without touching requests.
#[tokio::test]
async fn test_unmatched_memos_are_consumed_once() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(3);
    let token = harness.request(user).expect("request").reference_token;
    let mut events = harness.gate().subscribe_events();

    harness.ledger().pay("S1", None, price());
    harness.ledger().pay("S2", Some("ZZZZ9999"), price());
    harness.ledger().pay("S3", Some("hello there!"), price());
    harness.confirm();

    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.no_reference, 2);
    assert_eq!(report.unknown_reference, 1);
    assert_eq!(report.cursor.as_deref(), Some("S3"));
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Pending));

    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, GateEvent::TransferRejected { .. }) {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 3);

    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.examined, 0);
}

/// A request that expires before payment no longer matches its token.
#[tokio::test]
async fn test_expired_request_is_not_matched() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(42);
    let token = harness.request(user).expect("request").reference_token;

    let expired = harness
        .gate()
        .intake()
        .store()
        .expire_created_before(chrono::Utc::now())
        .expect("expire");
    assert_eq!(expired.len(), 1);

    harness.ledger().pay("S1", Some(token.as_str()), price());
    harness.confirm();
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.unknown_reference, 1);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Expired));
    assert_eq!(harness.gateway().grants_for(user), 0);

    let fresh = harness.request(user).expect("request");
    assert_ne!(fresh.reference_token, token);
}

/// A membership outage keeps the request Matched until the next cycle.
#[tokio::test]
async fn test_grant_retried_after_outage() {
    let harness = TestHarness::setup().await.expect("setup");
    let user = UserId(11);
    let token = harness.request(user).expect("request").reference_token;
    harness.ledger().pay("S1", Some(token.as_str()), price());
    harness.confirm();

    harness.gateway().set_unreachable(true);
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.grant_failures, 1);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Matched));

    harness.gateway().set_unreachable(false);
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.retried, 1);
    assert_eq!(report.granted, 1);
    assert_eq!(harness.gateway().grants_for(user), 1);
}

/// A ledger outage mid-batch followed by a restart loses and repeats nothing.
#[tokio::test]
async fn test_restart_mid_batch_resumes() {
    let mut harness = TestHarness::setup().await.expect("setup");
    let users = [UserId(1), UserId(2), UserId(3)];
    for (i, user) in users.iter().enumerate() {
        let token = harness.request(*user).expect("request").reference_token;
        harness
            .ledger()
            .pay(&format!("S{i}"), Some(token.as_str()), price());
    }
    harness.confirm();

    harness.ledger().fail_after(1);
    let report = harness.cycle().await.expect("cycle");
    assert!(report.transient_error.is_some());
    assert_eq!(report.granted, 1);
    assert_eq!(report.cursor.as_deref(), Some("S0"));

    harness.restart().await.expect("restart");
    harness.ledger().recover();
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.examined, 2);
    assert_eq!(report.granted, 2);
    for user in users {
        assert_eq!(harness.gateway().grants_for(user), 1);
    }
}

/// A second gate over the same state directory is refused.
#[tokio::test]
async fn test_second_gate_is_locked_out() {
    let harness = TestHarness::setup().await.expect("setup");
    let mut config = paygate::GateConfig {
        root_dir: harness.gate().root_dir().clone(),
        ..paygate::GateConfig::default()
    };
    config.ledger.payment_address = super::harness::GATE_ADDRESS.to_string();
    config.telegram.bot_token = Some("123:abc".to_string());
    config.telegram.channel_id = Some(-100);

    let result = paygate::GateBuilder::new(config).build().await;
    assert!(matches!(result, Err(paygate::Error::Locked(_))));
}

/// A request opened while the polling loop runs is granted by that loop.
#[tokio::test]
async fn test_request_during_run_is_granted() {
    let harness = TestHarness::setup_with(|config| config.scan.poll_interval_secs = 1)
        .await
        .expect("setup");
    let gate = harness.gate();
    let intake = gate.intake();
    let user = UserId(77);

    let driver = async {
        let token = intake.open_request(user).expect("request").reference_token;
        harness.ledger().pay("S1", Some(token.as_str()), price());
        harness.confirm();
        for _ in 0..50 {
            if harness.gateway().grants_for(user) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        gate.shutdown();
        token
    };
    let (run, token) = tokio::join!(gate.run(), driver);
    run.expect("run");

    assert_eq!(harness.gateway().grants_for(user), 1);
    assert_eq!(harness.status(user, &token), Some(RequestStatus::Granted));
}

/// A request written by a separate store handle, as the CLI does beside a
/// running daemon, is matched and survives the daemon's own writes.
#[tokio::test]
async fn test_request_from_second_handle_is_granted() {
    let harness = TestHarness::setup().await.expect("setup");
    let cli_store =
        Arc::new(RequestStore::open(harness.root_dir().join(REQUESTS_FILE)).expect("store"));
    let cli = RequestIntake::new(
        Arc::clone(&cli_store),
        super::harness::GATE_ADDRESS.to_string(),
        price(),
    );

    let early = harness.request(UserId(1)).expect("request").reference_token;
    let joined = cli.open_request(UserId(2)).expect("request").reference_token;
    assert_eq!(
        cli.open_request(UserId(1)).expect("reuse").reference_token,
        early
    );

    harness.ledger().pay("S1", Some(joined.as_str()), price());
    harness.ledger().pay("S2", Some(early.as_str()), price());
    harness.confirm();
    let report = harness.cycle().await.expect("cycle");
    assert_eq!(report.granted, 2);

    assert_eq!(
        cli_store.latest_for_user(UserId(2)).map(|r| r.status),
        Some(RequestStatus::Granted)
    );
    assert!(cli.status(UserId(1)).contains("granted"));
    let reopened = RequestStore::open(harness.root_dir().join(REQUESTS_FILE)).expect("store");
    assert_eq!(reopened.len(), 2);
}
