mod common;

use common::{addr, limits, Mining, SendBehaviour, TestFaucet};
use futures::future::join_all;
use spigot_faucet::{Disbursement, FaucetError, QuotaLimit, ReservationStatus};
use std::collections::HashSet;
use tempfile::TempDir;

#[tokio::test]
async fn test_limit_walkthrough() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    let (a, b, c, d) = (addr(0xa), addr(0xb), addr(0xc), addr(0xd));

    let first = faucet.fund(&a).await.unwrap();
    assert!(matches!(first, Disbursement::Committed(r) if r.destination == a && r.amount == 30));
    assert_eq!(faucet.ledger.address_total(&a).unwrap(), 30);
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);

    assert!(matches!(
        faucet.fund(&a).await,
        Err(FaucetError::QuotaDenied(QuotaLimit::AddressLimit))
    ));

    faucet.fund(&b).await.unwrap();
    assert_eq!(faucet.ledger.global_total().unwrap(), 60);
    assert!(matches!(
        faucet.fund(&b).await,
        Err(FaucetError::QuotaDenied(QuotaLimit::AddressLimit))
    ));

    faucet.fund(&c).await.unwrap();
    assert_eq!(faucet.ledger.global_total().unwrap(), 90);

    assert!(matches!(
        faucet.fund(&d).await,
        Err(FaucetError::QuotaDenied(QuotaLimit::TotalLimit))
    ));
    assert_eq!(faucet.ledger.global_total().unwrap(), 90);
    assert_eq!(faucet.ledger.address_total(&d).unwrap(), 0);

    assert_eq!(faucet.chain.issued_nonces(), vec![0, 1, 2]);
    assert_eq!(faucet.metrics.requests("success"), 3);
    assert_eq!(faucet.metrics.requests("denied_address"), 2);
    assert_eq!(faucet.metrics.requests("denied_total"), 1);
}

#[tokio::test]
async fn test_denial_never_reaches_chain() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 30, 30)).await;

    faucet.fund(&addr(1)).await.unwrap();
    let calls = faucet.chain.send_calls();
    let before = faucet.ledger.statistics().unwrap();

    assert!(faucet.fund(&addr(1)).await.is_err());

    assert_eq!(faucet.chain.send_calls(), calls);
    assert_eq!(faucet.ledger.statistics().unwrap(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_for_one_address() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 30, 30)).await;
    let target = addr(7);

    let (left, right) = tokio::join!(faucet.fund(&target), faucet.fund(&target));
    let results = [left, right];

    let granted = results.iter().filter(|r| r.is_ok()).count();
    let denied = results
        .iter()
        .filter(|r| matches!(r, Err(FaucetError::QuotaDenied(QuotaLimit::AddressLimit))))
        .count();
    assert_eq!((granted, denied), (1, 1));
    assert_eq!(faucet.ledger.address_total(&target).unwrap(), 30);
    assert_eq!(faucet.chain.issued_nonces().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_get_unique_nonces() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(1000, 10, 10)).await;

    let requests = (1..=20u8).map(|i| {
        let engine = faucet.engine.clone();
        async move { engine.request_funds(&addr(i).to_string()).await }
    });
    let results = join_all(requests).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let nonces = faucet.chain.issued_nonces();
    let unique: HashSet<u64> = nonces.iter().copied().collect();
    assert_eq!(nonces.len(), 20);
    assert_eq!(unique, (0..20).collect());
    assert_eq!(faucet.ledger.global_total().unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_cap_holds_under_contention() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 10)).await;

    let requests = (0..30u8).map(|i| {
        let engine = faucet.engine.clone();
        async move { engine.request_funds(&addr(1 + i % 5).to_string()).await }
    });
    let results = join_all(requests).await;

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 10);
    assert_eq!(faucet.ledger.global_total().unwrap(), 100);
    for i in 1..=5 {
        assert!(faucet.ledger.address_total(&addr(i)).unwrap() <= 40);
    }
}

#[tokio::test]
async fn test_rejection_restores_counters() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.fund(&addr(1)).await.unwrap();

    faucet
        .chain
        .script([SendBehaviour::Reject("insufficient funds for gas * price + value")]);
    let result = faucet.fund(&addr(2)).await;

    assert!(matches!(result, Err(FaucetError::SubmissionRejected(ref m)) if m.contains("insufficient")));
    assert_eq!(faucet.ledger.address_total(&addr(2)).unwrap(), 0);
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);
    let latest = faucet.ledger.recent(1).unwrap().remove(0);
    assert_eq!(latest.status, ReservationStatus::Released);

    // the refused nonce is reused by the next transfer
    faucet.fund(&addr(2)).await.unwrap();
    assert_eq!(faucet.chain.issued_nonces(), vec![0, 1]);
}

#[tokio::test]
async fn test_revert_releases_reservation() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.set_mining(Mining::Revert);

    let result = faucet.fund(&addr(1)).await;
    assert!(matches!(result, Err(FaucetError::SubmissionRejected(_))));
    assert_eq!(faucet.ledger.global_total().unwrap(), 0);
}

#[tokio::test]
async fn test_unconfirmed_transfer_is_parked_then_committed() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.set_mining(Mining::Hold);

    let pending = match faucet.fund(&addr(1)).await.unwrap() {
        Disbursement::Pending(p) => p,
        other => panic!("expected pending, got {:?}", other),
    };
    assert_eq!(pending.nonce, 0);
    assert_eq!(faucet.metrics.requests("pending"), 1);

    // the quota stays held while the outcome is unknown
    assert_eq!(faucet.ledger.address_total(&addr(1)).unwrap(), 30);
    let record = faucet.ledger.recent(1).unwrap().remove(0);
    assert_eq!(record.status, ReservationStatus::Unresolved(pending.submission()));

    let report = faucet.reconciler.run_pass().await.unwrap();
    assert_eq!(report.still_pending, 1);

    faucet.chain.mine_pending();
    let report = faucet.reconciler.run_pass().await.unwrap();
    assert_eq!((report.committed, report.released), (1, 0));
    assert_eq!(
        faucet.ledger.reservation(record.id).unwrap().unwrap().status,
        ReservationStatus::Committed(pending.submission())
    );
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);
}

#[tokio::test]
async fn test_dropped_transfer_is_released_by_reconciliation() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.set_mining(Mining::Hold);

    assert!(faucet.fund(&addr(1)).await.unwrap().is_pending());
    faucet.chain.drop_pending();

    let report = faucet.reconciler.run_pass().await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(faucet.ledger.global_total().unwrap(), 0);
    assert_eq!(faucet.submitter.cached_sequence().await, None);

    // the next transfer reuses the abandoned nonce
    faucet.chain.set_mining(Mining::Confirm);
    faucet.fund(&addr(1)).await.unwrap();
    assert_eq!(faucet.chain.issued_nonces(), vec![0, 0]);
}

#[tokio::test]
async fn test_lost_response_is_pending() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.script([SendBehaviour::LoseResponse]);

    let result = faucet.fund(&addr(1)).await.unwrap();
    assert!(result.is_pending());
    assert_eq!(faucet.submitter.cached_sequence().await, None);

    // the node had accepted and mined it
    let report = faucet.reconciler.run_pass().await.unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);

    faucet.fund(&addr(2)).await.unwrap();
    assert_eq!(faucet.chain.issued_nonces(), vec![0, 1]);
}

#[tokio::test]
async fn test_already_known_send_is_not_resigned() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.script([SendBehaviour::AlreadyKnown]);

    let result = faucet.fund(&addr(1)).await.unwrap();
    let Disbursement::Committed(receipt) = result else {
        panic!("expected a committed disbursement, got {:?}", result);
    };
    assert_eq!(receipt.nonce, 0);
    assert_eq!(faucet.chain.send_calls(), 1);
    assert_eq!(faucet.chain.issued_nonces(), vec![0]);
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);

    // the next request moves on to the following nonce
    faucet.fund(&addr(2)).await.unwrap();
    assert_eq!(faucet.chain.issued_nonces(), vec![0, 1]);
}

#[tokio::test]
async fn test_unreachable_node_is_retried() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet
        .chain
        .script([SendBehaviour::Unreachable, SendBehaviour::Unreachable]);

    let result = faucet.fund(&addr(1)).await.unwrap();
    assert!(matches!(result, Disbursement::Committed(_)));
    assert_eq!(faucet.chain.send_calls(), 3);
    assert_eq!(faucet.chain.issued_nonces(), vec![0]);
}

#[tokio::test]
async fn test_unreachable_node_reports_unavailable() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.script([
        SendBehaviour::Unreachable,
        SendBehaviour::Unreachable,
        SendBehaviour::Unreachable,
    ]);

    let result = faucet.fund(&addr(1)).await;
    assert!(matches!(result, Err(FaucetError::ChainUnavailable(_))));
    assert_eq!(faucet.metrics.requests("unavailable"), 1);

    // a signed transaction was journaled, so the claim waits for reconciliation
    let record = faucet.ledger.recent(1).unwrap().remove(0);
    assert!(matches!(record.status, ReservationStatus::Unresolved(_)));
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);

    let report = faucet.reconciler.run_pass().await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(faucet.ledger.global_total().unwrap(), 0);
}

#[tokio::test]
async fn test_stale_nonce_is_refetched() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    faucet.chain.script([SendBehaviour::StaleNonce]);

    let result = faucet.fund(&addr(1)).await.unwrap();
    match result {
        Disbursement::Committed(receipt) => assert_eq!(receipt.nonce, 1),
        other => panic!("expected commit, got {:?}", other),
    }
    assert_eq!(faucet.chain.issued_nonces(), vec![1]);
}

#[tokio::test]
async fn test_invalid_addresses_have_no_side_effects() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 30)).await;
    let faucet_address = faucet.submitter.address().to_string();

    for raw in [
        "",
        "0x1234",
        "0xzz00000000000000000000000000000000000000",
        "0x0000000000000000000000000000000000000000",
        // EIP-55 address with one letter's case flipped
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAeD",
        faucet_address.as_str(),
    ] {
        let result = faucet.engine.request_funds(raw).await;
        assert!(
            matches!(result, Err(FaucetError::InvalidAddress(_))),
            "{:?} was accepted",
            raw
        );
    }

    assert!(faucet.ledger.recent(10).unwrap().is_empty());
    assert_eq!(faucet.chain.send_calls(), 0);
    assert_eq!(faucet.metrics.requests("invalid"), 6);
}

#[tokio::test]
async fn test_accepts_lowercase_and_checksummed() {
    let dir = TempDir::new().unwrap();
    let faucet = TestFaucet::start(&dir, limits(100, 40, 10)).await;

    for raw in [
        "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed",
        "5AAEB6053F3E94C9B9A09F33669435E7EF1BEAED",
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
    ] {
        faucet.engine.request_funds(raw).await.unwrap();
    }
    assert_eq!(faucet.ledger.statistics().unwrap().unique_addresses, 1);
    assert_eq!(faucet.ledger.global_total().unwrap(), 30);
}
