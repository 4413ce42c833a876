//! End-to-end ledger and fraud scenarios against the in-memory store

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use ledgerguard::{
    alerts::{AlertQuery, AlertStatus, DashboardEvent},
    auth::{Actor, Role, StaffDirectory},
    config::LedgerConfig,
    errors::LedgerError,
    notify::Notifier,
    otp::IssuedOtp,
    rules::{default_rules, FraudRule, InMemoryRuleCatalog, RuleKind, RuleParams, Severity},
    store::{AccountStore, InMemoryAccountStore, TransactionQuery},
    Account, AccountStatus, Collaborators, LedgerGuard, Transaction, TransactionRequest,
    TransactionType,
};

#[derive(Default)]
struct RecordingNotifier {
    large: Mutex<Vec<Uuid>>,
    reviews: Mutex<Vec<Uuid>>,
    otps: Mutex<Vec<IssuedOtp>>,
}

impl Notifier for RecordingNotifier {
    fn notify_large_transaction(&self, transaction: &Transaction, _threshold: Decimal) {
        self.large.lock().unwrap().push(transaction.transaction_id);
    }

    fn notify_review_required(&self, transaction: &Transaction) {
        self.reviews.lock().unwrap().push(transaction.transaction_id);
    }

    fn deliver_otp(&self, otp: &IssuedOtp) {
        self.otps.lock().unwrap().push(otp.clone());
    }
}

struct Harness {
    guard: LedgerGuard,
    store: Arc<InMemoryAccountStore>,
    notifier: Arc<RecordingNotifier>,
}

fn account(number: &str, customer: &str, opening: i64, minimum: i64) -> Account {
    Account {
        account_number: number.to_string(),
        customer_id: customer.to_string(),
        current_balance: Decimal::ZERO,
        status: AccountStatus::Active,
        minimum_balance: Decimal::from(minimum),
        opening_date: Utc::now() - Duration::days(400),
        opening_balance: Decimal::from(opening),
        phone_number: Some("+94771234567".to_string()),
    }
}

fn harness(rules: Vec<FraudRule>) -> Harness {
    let store = Arc::new(InMemoryAccountStore::new());
    store.open_account(account("ACC001", "CUS001", 1_000_000, 500)).unwrap();
    store.open_account(account("ACC002", "CUS002", 1_000_000, 500)).unwrap();

    let directory = Arc::new(StaffDirectory::new());
    directory.assign("AGT001", "CUS001").unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let guard = LedgerGuard::start(
        LedgerConfig::default(),
        Collaborators {
            store: store.clone(),
            directory,
            rules: Arc::new(InMemoryRuleCatalog::new(rules)),
            notifier: notifier.clone(),
        },
    )
    .unwrap();

    Harness {
        guard,
        store,
        notifier,
    }
}

fn rule(kind: RuleKind, params: RuleParams) -> FraudRule {
    let mut rule = default_rules()
        .into_iter()
        .find(|rule| rule.kind == kind)
        .unwrap();
    rule.params = params;
    rule
}

fn manager() -> Actor {
    Actor::new("MGR001", Role::Manager)
}

fn deposit(account: &str, amount: i64) -> TransactionRequest {
    TransactionRequest::new(account, TransactionType::Deposit, Decimal::from(amount)).with_otp_verified()
}

#[tokio::test]
async fn balance_conservation_and_minimum_balance() {
    let h = harness(default_rules());
    let actor = manager();
    let requests = [
        (TransactionType::Deposit, 25_000),
        (TransactionType::Withdrawal, 40_000),
        (TransactionType::FdOpen, 500_000),
        (TransactionType::Interest, 1_250),
        (TransactionType::Withdrawal, 490_000),
        (TransactionType::FdClose, 100_000),
    ];

    let mut rejected = 0;
    for (kind, amount) in requests {
        let request = TransactionRequest::new("ACC001", kind, Decimal::from(amount)).with_otp_verified();
        match h.guard.process_transaction(&request, &actor) {
            Ok(receipt) => assert!(receipt.new_balance >= Decimal::from(500)),
            Err(e) => {
                assert!(e.is_validation());
                rejected += 1;
            }
        }
    }

    // 1,000,000 + 25,000 - 40,000 - 500,000 + 1,250 leaves 486,250; the 490,000 debit fails
    assert_eq!(rejected, 1);
    let reconciliation = h.guard.reconcile("ACC001").unwrap();
    assert!(reconciliation.is_balanced());
    assert_eq!(reconciliation.current_balance, Decimal::from(586_250));
    assert!(h.guard.verify_chain("ACC001").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_withdrawals_never_overdraw() {
    let store = Arc::new(InMemoryAccountStore::new());
    store.open_account(account("ACC900", "CUS900", 10_000, 0)).unwrap();
    let guard = Arc::new(
        LedgerGuard::start(
            LedgerConfig::default(),
            Collaborators {
                store: store.clone(),
                directory: Arc::new(StaffDirectory::new()),
                rules: Arc::new(InMemoryRuleCatalog::with_default_rules()),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let guard = guard.clone();
            tokio::task::spawn_blocking(move || {
                let request =
                    TransactionRequest::new("ACC900", TransactionType::Withdrawal, Decimal::from(500));
                guard.process_transaction(&request, &manager())
            })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(LedgerError::InsufficientFunds { .. })
            | Err(LedgerError::MinimumBalanceViolation { .. })
            | Err(LedgerError::LedgerConflict { .. }) => {}
            Err(other) => panic!("unexpected rejection: {}", other),
        }
    }

    let balance = store.get_account("ACC900").unwrap().current_balance;
    assert!(committed <= 20);
    assert!(balance >= Decimal::ZERO);
    assert_eq!(balance, Decimal::from(10_000 - 500 * committed as i64));
    assert!(guard.reconcile("ACC900").unwrap().is_balanced());
}

#[tokio::test]
async fn high_amount_deposit_raises_single_alert() {
    let h = harness(vec![rule(
        RuleKind::HighAmount,
        RuleParams {
            amount_threshold: Some(Decimal::from(100_000)),
            ..Default::default()
        },
    )]);

    let receipt = h
        .guard
        .process_transaction(&deposit("ACC001", 150_000), &manager())
        .unwrap();
    h.guard.flush_scans().await;

    let alerts = h.guard.alerts().for_transaction(receipt.transaction_id).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule_code, "HIGH_AMOUNT");
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].status, AlertStatus::Pending);
    assert!(alerts[0].fraud_score >= 0.8 && alerts[0].fraud_score <= 1.0);

    // Above both the large-transaction notice and the manager approval threshold
    assert!(receipt.requires_review);
    assert_eq!(h.notifier.large.lock().unwrap().as_slice(), &[receipt.transaction_id]);
    assert_eq!(h.notifier.reviews.lock().unwrap().as_slice(), &[receipt.transaction_id]);
}

#[tokio::test]
async fn rescan_does_not_duplicate_alerts() {
    let h = harness(vec![rule(
        RuleKind::HighAmount,
        RuleParams {
            amount_threshold: Some(Decimal::from(100_000)),
            ..Default::default()
        },
    )]);

    let receipt = h
        .guard
        .process_transaction(&deposit("ACC001", 150_000), &manager())
        .unwrap();
    h.guard.flush_scans().await;

    assert!(h.guard.rescan(receipt.transaction_id).unwrap().is_empty());
    assert!(h.guard.rescan_recent(24).unwrap().is_empty());
    assert_eq!(h.guard.list_alerts(&AlertQuery::new()).unwrap().len(), 1);

    assert!(matches!(
        h.guard.rescan(Uuid::new_v4()),
        Err(LedgerError::TransactionNotFound { .. })
    ));
}

#[tokio::test]
async fn otp_gates_large_withdrawals() {
    let h = harness(Vec::new());
    let agent = Actor::new("AGT001", Role::Agent);
    let withdrawal = TransactionRequest::new("ACC001", TransactionType::Withdrawal, Decimal::from(6_000));

    match h.guard.process_transaction(&withdrawal, &agent) {
        Err(LedgerError::OtpRequired { threshold }) => assert_eq!(threshold, Decimal::from(5_000)),
        other => panic!("expected OtpRequired, got {:?}", other.map(|r| r.transaction_id)),
    }
    assert!(h
        .guard
        .transactions(&TransactionQuery::new().for_account("ACC001"))
        .unwrap()
        .is_empty());

    let receipt = h
        .guard
        .process_transaction(&withdrawal.clone().with_otp_verified(), &agent)
        .unwrap();
    assert_eq!(receipt.new_balance, Decimal::from(994_000));
    // Agent approval threshold is 5,000: committed but flagged
    assert!(receipt.requires_review);
    assert_eq!(h.notifier.reviews.lock().unwrap().as_slice(), &[receipt.transaction_id]);
}

#[tokio::test]
async fn otp_round_trip_through_phone_on_file() {
    let h = harness(Vec::new());
    let agent = Actor::new("AGT001", Role::Agent);

    assert!(matches!(
        h.guard.request_otp("ACC001", Decimal::from(5_000)),
        Err(LedgerError::OtpNotRequired { .. })
    ));

    let challenge = h.guard.request_otp("ACC001", Decimal::from(7_000)).unwrap();
    assert!(challenge.masked_phone.ends_with("4567"));
    let code = h.notifier.otps.lock().unwrap()[0].code.clone();

    h.guard.verify_otp("ACC001", &code).unwrap();
    assert!(h.guard.verify_otp("ACC001", &code).is_err());

    let withdrawal = TransactionRequest::new("ACC001", TransactionType::Withdrawal, Decimal::from(7_000));
    assert!(h.guard.process_transaction(&withdrawal, &agent).is_ok());

    // One verification clears one transaction
    match h.guard.process_transaction(&withdrawal, &agent) {
        Err(LedgerError::OtpRequired { threshold }) => assert_eq!(threshold, Decimal::from(5_000)),
        other => panic!("expected OtpRequired, got {:?}", other.map(|r| r.transaction_id)),
    }
    assert_eq!(
        h.guard.reconcile("ACC001").unwrap().current_balance,
        Decimal::from(993_000)
    );

    // Nor a larger amount
    let larger = TransactionRequest::new("ACC001", TransactionType::Withdrawal, Decimal::from(8_000));
    assert!(matches!(
        h.guard.process_transaction(&larger, &agent),
        Err(LedgerError::OtpRequired { .. })
    ));
}

#[tokio::test]
async fn agent_limits_and_assignment() {
    let h = harness(Vec::new());
    let agent = Actor::new("AGT001", Role::Agent);

    assert!(matches!(
        h.guard.process_transaction(&deposit("ACC002", 100), &agent),
        Err(LedgerError::AccessDenied { .. })
    ));
    assert!(matches!(
        h.guard.process_transaction(&deposit("ACC001", 12_000), &agent),
        Err(LedgerError::LimitExceeded { .. })
    ));

    for _ in 0..5 {
        h.guard.process_transaction(&deposit("ACC001", 10_000), &agent).unwrap();
    }
    // 50,000 already committed today
    assert!(matches!(
        h.guard.process_transaction(&deposit("ACC001", 100), &agent),
        Err(LedgerError::LimitExceeded { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_agent_deposits_respect_daily_limit() {
    let store = Arc::new(InMemoryAccountStore::new());
    let directory = Arc::new(StaffDirectory::new());
    for n in 0..8 {
        let number = format!("ACC{:03}", 100 + n);
        let customer = format!("CUS{:03}", 100 + n);
        store.open_account(account(&number, &customer, 1_000, 0)).unwrap();
        directory.assign("AGT001", &customer).unwrap();
    }
    let guard = Arc::new(
        LedgerGuard::start(
            LedgerConfig::default(),
            Collaborators {
                store: store.clone(),
                directory,
                rules: Arc::new(InMemoryRuleCatalog::new(Vec::new())),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let guard = guard.clone();
            tokio::task::spawn_blocking(move || {
                let agent = Actor::new("AGT001", Role::Agent);
                guard.process_transaction(&deposit(&format!("ACC{:03}", 100 + n), 10_000), &agent)
            })
        })
        .collect();

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(LedgerError::LimitExceeded { .. }) => {}
            Err(other) => panic!("unexpected rejection: {}", other),
        }
    }

    // Agent daily limit is 50,000
    assert_eq!(committed, 5);
    let now = Utc::now();
    let volume = store
        .actor_volume_between("AGT001", now - Duration::days(1), now + Duration::days(1))
        .unwrap();
    assert_eq!(volume, Decimal::from(50_000));
}

#[tokio::test]
async fn inactive_account_and_bad_amounts_rejected() {
    let h = harness(Vec::new());
    h.store.set_status("ACC002", AccountStatus::Inactive).unwrap();

    assert!(matches!(
        h.guard.process_transaction(&deposit("ACC002", 100), &manager()),
        Err(LedgerError::AccountInactive { .. })
    ));
    assert!(matches!(
        h.guard.process_transaction(&deposit("ACC001", -5), &manager()),
        Err(LedgerError::InvalidAmount { .. })
    ));
    assert!(matches!(
        h.guard.process_transaction(&deposit("NOPE", 100), &manager()),
        Err(LedgerError::AccountNotFound { .. })
    ));
}

#[tokio::test]
async fn dashboard_receives_high_severity_alerts() {
    let h = harness(vec![
        rule(
            RuleKind::HighAmount,
            RuleParams {
                amount_threshold: Some(Decimal::from(100_000)),
                ..Default::default()
            },
        ),
        rule(
            RuleKind::NewAccountLarge,
            RuleParams {
                account_age_days: Some(1_000),
                amount_threshold: Some(Decimal::from(100_000)),
                ..Default::default()
            },
        ),
    ]);
    let mut subscription = h.guard.subscribe_dashboard().unwrap();
    assert_eq!(subscription.snapshot.total, 0);

    h.guard
        .process_transaction(&deposit("ACC001", 150_000), &manager())
        .unwrap();
    h.guard.flush_scans().await;

    // Only the high-severity rule is pushed live; the medium one is stored
    let mut pushed = Vec::new();
    while let Ok(event) = subscription.events.try_recv() {
        if let DashboardEvent::AlertCreated { alert } = event {
            pushed.push(alert.rule_code);
        }
    }
    assert_eq!(pushed, vec!["HIGH_AMOUNT".to_string()]);

    let stats = h.guard.alerts().stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.high, 1);
    assert_eq!(stats.medium, 1);
}

#[tokio::test]
async fn disabled_rule_stops_firing() {
    let h = harness(vec![rule(
        RuleKind::HighAmount,
        RuleParams {
            amount_threshold: Some(Decimal::from(100_000)),
            ..Default::default()
        },
    )]);

    let toggled = h.guard.set_rule_active(1, false).unwrap();
    assert!(!toggled.is_active);

    h.guard
        .process_transaction(&deposit("ACC001", 150_000), &manager())
        .unwrap();
    h.guard.flush_scans().await;
    assert!(h.guard.list_alerts(&AlertQuery::new()).unwrap().is_empty());

    let stats = h.guard.get_fraud_statistics();
    assert_eq!(stats["scans_completed"], 1.0);
    assert_eq!(stats["alerts_raised"], 0.0);
}

#[tokio::test]
async fn reviewer_resolves_alert() {
    let h = harness(vec![rule(
        RuleKind::HighAmount,
        RuleParams {
            amount_threshold: Some(Decimal::from(100_000)),
            ..Default::default()
        },
    )]);
    h.guard
        .process_transaction(&deposit("ACC001", 150_000), &manager())
        .unwrap();
    h.guard.flush_scans().await;

    let alert = h.guard.list_alerts(&AlertQuery::new()).unwrap().remove(0);
    let resolved = h
        .guard
        .resolve_alert(
            alert.alert_id,
            AlertStatus::Resolved,
            &manager(),
            Some("salary bonus, verified with customer".to_string()),
        )
        .unwrap();
    assert_eq!(resolved.resolved_by.as_deref(), Some("MGR001"));

    assert_eq!(
        h.guard
            .list_alerts(&AlertQuery::new().with_status(AlertStatus::Pending))
            .unwrap()
            .len(),
        0
    );
    assert_eq!(h.guard.alerts().stats().unwrap().resolved, 1);
}

#[tokio::test]
async fn shutdown_drains_queued_scans() {
    let h = harness(vec![rule(
        RuleKind::HighAmount,
        RuleParams {
            amount_threshold: Some(Decimal::from(100_000)),
            ..Default::default()
        },
    )]);
    let alerts = h.guard.alerts();

    for _ in 0..3 {
        h.guard
            .process_transaction(&deposit("ACC001", 120_000), &manager())
            .unwrap();
    }
    h.guard.shutdown().await;

    assert_eq!(alerts.stats().unwrap().total, 3);
}
