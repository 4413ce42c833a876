//! LedgerGuard CLI
//!
//! Runs an in-memory branch demo, prints the fraud rule catalog, or checks a
//! configuration file.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Arg, Command};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ledgerguard::{
    alerts::AlertQuery,
    auth::{Actor, Role, StaffDirectory},
    config::{LedgerConfig, LoggingConfig},
    notify::TracingNotifier,
    rules::{InMemoryRuleCatalog, RuleCatalog},
    store::InMemoryAccountStore,
    utils::format_currency,
    Account, AccountStatus, Collaborators, LedgerGuard, TransactionRequest, TransactionType,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("ledgerguard")
        .version("0.1.0")
        .author("LedgerGuard Team")
        .about("Transaction ledger with real-time fraud rule evaluation")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (TOML)"),
        )
        .subcommand(Command::new("demo").about("Run an in-memory branch session with fraud scanning"))
        .subcommand(Command::new("rules").about("List the default fraud rules"))
        .subcommand(Command::new("check-config").about("Validate configuration and print it"))
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => LedgerConfig::load_from_path(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => LedgerConfig::default(),
    };
    init_tracing(&config.logging)?;

    match matches.subcommand() {
        Some(("demo", _)) => run_demo(config).await?,
        Some(("rules", _)) => show_rules()?,
        Some(("check-config", _)) => {
            config
                .validate()
                .map_err(anyhow::Error::msg)
                .context("configuration is invalid")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        _ => {
            println!("LedgerGuard - transaction ledger and fraud rule engine");
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level).context("invalid log level")?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn show_rules() -> Result<()> {
    let catalog = InMemoryRuleCatalog::with_default_rules();
    for rule in catalog.all_rules()? {
        println!(
            "{:>2}  {:<20} {:<9} {:<11} {}",
            rule.rule_id,
            rule.code,
            rule.severity.to_string(),
            format!("{:?}", rule.category).to_lowercase(),
            rule.description
        );
        println!("    params: {}", serde_json::to_string(&rule.params)?);
    }
    Ok(())
}

async fn run_demo(config: LedgerConfig) -> Result<()> {
    let currency = config.local_currency.clone();
    let store = Arc::new(InMemoryAccountStore::new());
    let directory = Arc::new(StaffDirectory::new());

    store.open_account(demo_account("ACC1001", "CUS001", 250_000, 400, Some("+94771234567")))?;
    store.open_account(demo_account("ACC1002", "CUS002", 2_000_000, 10, None))?;
    directory.assign("AGT001", "CUS001")?;

    let guard = LedgerGuard::start(
        config,
        Collaborators {
            store: store.clone(),
            directory,
            rules: Arc::new(InMemoryRuleCatalog::with_default_rules()),
            notifier: Arc::new(TracingNotifier::new(&currency)),
        },
    )?;
    let mut dashboard = guard.subscribe_dashboard()?;

    let agent = Actor::new("AGT001", Role::Agent).with_branch("BR01");
    let manager = Actor::new("MGR001", Role::Manager).with_branch("BR01");

    println!("1. Counter transactions");
    let session: Vec<(&Actor, TransactionRequest)> = vec![
        (
            &agent,
            TransactionRequest::new("ACC1001", TransactionType::Deposit, Decimal::from(4_500))
                .with_reference("cash deposit"),
        ),
        (
            &agent,
            TransactionRequest::new("ACC1001", TransactionType::Withdrawal, Decimal::from(6_000)),
        ),
        (
            &agent,
            TransactionRequest::new("ACC1001", TransactionType::Withdrawal, Decimal::from(6_000))
                .with_otp_verified(),
        ),
        (
            &agent,
            TransactionRequest::new("ACC1002", TransactionType::Deposit, Decimal::from(1_000)),
        ),
        (
            &manager,
            TransactionRequest::new("ACC1002", TransactionType::Withdrawal, Decimal::from(300_000))
                .with_otp_verified(),
        ),
    ];

    for (actor, request) in &session {
        match guard.process_transaction(request, actor) {
            Ok(receipt) => println!(
                "   ✅ {:?} {} on {} -> balance {} [{}]{}",
                receipt.transaction_type,
                format_currency(receipt.amount, &currency),
                receipt.account_number,
                format_currency(receipt.new_balance, &currency),
                receipt.confirmation_code,
                if receipt.requires_review { " (review requested)" } else { "" }
            ),
            Err(e) => println!(
                "   ❌ {:?} {} by {}: {}",
                request.transaction_type,
                format_currency(request.amount, &currency),
                actor.employee_id,
                e.to_user_message()
            ),
        }
    }

    println!("\n2. OTP challenge for a large withdrawal");
    let challenge = guard.request_otp("ACC1001", Decimal::from(8_000))?;
    println!(
        "   code sent to {}, expires {}",
        challenge.masked_phone,
        challenge.expires_at.format("%H:%M:%S")
    );

    println!("\n3. Rapid alternating activity");
    for kind in [
        TransactionType::Deposit,
        TransactionType::Withdrawal,
        TransactionType::Deposit,
    ] {
        let request = TransactionRequest::new("ACC1002", kind, Decimal::from(45_000)).with_otp_verified();
        guard.process_transaction(&request, &manager)?;
    }

    guard.flush_scans().await;

    println!("\n4. Fraud alerts");
    for alert in guard.list_alerts(&AlertQuery::new())? {
        println!(
            "   [{}] {:<20} score {:.2}  {}",
            alert.severity, alert.rule_code, alert.fraud_score, alert.description
        );
    }
    while let Ok(event) = dashboard.events.try_recv() {
        println!("   dashboard <- {}", serde_json::to_string(&event)?);
    }

    println!("\n5. Integrity");
    for account in store.account_numbers()? {
        let reconciliation = guard.reconcile(&account)?;
        println!(
            "   {} chain {} | balanced {} ({} entries)",
            account,
            if guard.verify_chain(&account)? { "ok" } else { "BROKEN" },
            reconciliation.is_balanced(),
            reconciliation.entry_count
        );
    }

    println!("\n6. Pipeline statistics");
    let mut stats: Vec<_> = guard.get_fraud_statistics().into_iter().collect();
    stats.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in stats {
        println!("   {:<16} {}", name, value);
    }
    println!("   alerts: {:?}", guard.alerts().stats()?);

    guard.shutdown().await;
    info!("Demo finished");
    Ok(())
}

fn demo_account(
    number: &str,
    customer: &str,
    opening: i64,
    age_days: i64,
    phone: Option<&str>,
) -> Account {
    Account {
        account_number: number.to_string(),
        customer_id: customer.to_string(),
        current_balance: Decimal::ZERO,
        status: AccountStatus::Active,
        minimum_balance: Decimal::from(1_000),
        opening_date: Utc::now() - Duration::days(age_days),
        opening_balance: Decimal::from(opening),
        phone_number: phone.map(str::to_string),
    }
}
