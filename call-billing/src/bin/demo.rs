//! Demo: one funded coaching call from booking to settlement

use call_billing::{
    BillingEngine, CallEvent, CallEventKind, CallOutcome, ChannelId, ChannelInfo, Config,
    ReconciliationSweep, StaticChannelDirectory,
};
use chrono::{Duration, Utc};
use ledger_core::{Currency, EscrowManager, LedgerStore, UserId};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let billing_config = Config::from_env()?;
    let ledger_config = ledger_core::Config::from_env()?;

    info!("🚀 Call billing demo starting");

    let store = Arc::new(LedgerStore::new(&ledger_config)?);
    let escrow = Arc::new(EscrowManager::new(store.clone()));

    // One coaching channel at $60/hour
    let channel = ChannelId::new("987654321098765432");
    let directory = StaticChannelDirectory::new();
    directory.insert(ChannelInfo {
        channel_id: channel.clone(),
        rate_per_hour: Decimal::new(60_00, 2),
        currency: Currency::USD,
        active: true,
    });

    let engine = Arc::new(BillingEngine::new(
        store.clone(),
        escrow,
        Arc::new(directory),
        billing_config,
    ));

    let coach = UserId::new(Uuid::new_v4());
    let attendee = UserId::new(Uuid::new_v4());

    store.deposit(attendee, Decimal::new(200_00, 2), Currency::USD, Uuid::new_v4())?;
    info!(attendee = %attendee, "Attendee funded with $200.00");

    let session = Uuid::new_v4();
    let started_at = Utc::now() - Duration::minutes(25);

    let outcome = engine
        .handle_event(&CallEvent {
            session_id: session,
            coach_id: coach,
            attendee_id: attendee,
            channel_id: channel.clone(),
            event: CallEventKind::Start,
            at: started_at,
        })
        .await?;
    info!(?outcome, "Start signal processed");

    let balance = store.balance(attendee)?;
    info!(
        available = %balance.available,
        reserved = %balance.reserved,
        "Attendee balance while call is live"
    );

    // The call ran 25 minutes
    let outcome = engine
        .handle_event(&CallEvent {
            session_id: session,
            coach_id: coach,
            attendee_id: attendee,
            channel_id: channel,
            event: CallEventKind::End,
            at: Utc::now(),
        })
        .await?;

    if let CallOutcome::Settled(settlement) = &outcome {
        info!(
            minutes = settlement.duration_minutes,
            cost = %settlement.total_cost,
            paid_out = %settlement.paid_out,
            refunded = %settlement.refunded,
            "Call settled"
        );
    }

    let attendee_balance = store.balance(attendee)?;
    let coach_balance = store.balance(coach)?;
    info!(
        attendee_available = %attendee_balance.available,
        coach_available = %coach_balance.available,
        total_in_system = %store.total_in_system()?,
        "Final balances"
    );

    // A sweep pass over a settled book finds nothing to fix
    let sweep = ReconciliationSweep::new(engine);
    let report = sweep.run_once().await;
    info!(scanned = report.scanned, clean = report.is_clean(), "Sweep pass complete");

    info!("✅ Demo complete");
    Ok(())
}
