// Demo: an auth service and a wallet service wired only through events,
// plus a payment machine driven through its workflow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use entangle::{
    async_trait, payload, topics, Config, Event, EventBus, EventTap, Hub, MachineConfig,
    SubscribeOptions, TapContext, TransitionTable,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Logs every emission with its delivery counts.
struct TraceTap;

#[async_trait]
impl EventTap for TraceTap {
    async fn on_event(&self, event: &Event, ctx: &TapContext) -> Result<()> {
        tracing::debug!(
            event_type = %event.event_type,
            notified = ctx.notified,
            failed = ctx.failed(),
            "event delivered"
        );
        Ok(())
    }
}

/// Issues a token whenever a user logs in.
fn start_auth_service(bus: &EventBus) {
    let publisher = bus.clone();
    bus.subscribe(
        topics::AUTH_LOGIN,
        move |event: Arc<Event>| {
            let bus = publisher.clone();
            async move {
                let user = event
                    .get("user")
                    .and_then(|v| v.as_str())
                    .context("login without user")?
                    .to_string();
                tracing::info!(user = %user, "issuing token");
                bus.emit(
                    topics::TOKEN_GENERATED,
                    payload! { "user" => user, "token" => Uuid::new_v4().to_string() },
                )
                .await;
                anyhow::Ok(())
            }
        },
        SubscribeOptions::new().priority(10),
    );
}

/// Opens a wallet on first login and books completed payments.
fn start_wallet_service(bus: &EventBus) {
    let balances: Arc<Mutex<HashMap<String, i64>>> = Arc::default();

    let publisher = bus.clone();
    let wallets = balances.clone();
    bus.on(topics::AUTH_LOGIN, move |event: Arc<Event>| {
        let bus = publisher.clone();
        let wallets = wallets.clone();
        async move {
            let user = event
                .get("user")
                .and_then(|v| v.as_str())
                .context("login without user")?
                .to_string();
            let created = {
                let mut wallets = wallets.lock().unwrap_or_else(|e| e.into_inner());
                if wallets.contains_key(&user) {
                    false
                } else {
                    wallets.insert(user.clone(), 0);
                    true
                }
            };
            if created {
                bus.emit(topics::WALLET_CREATED, payload! { "user" => user }).await;
            }
            anyhow::Ok(())
        }
    });

    let publisher = bus.clone();
    bus.on(topics::MACHINE_TRANSITION, move |event: Arc<Event>| {
        let bus = publisher.clone();
        let wallets = balances.clone();
        async move {
            if event.get("to").and_then(|v| v.as_str()) != Some("done") {
                return anyhow::Ok(());
            }
            let context = event.get("context").cloned().unwrap_or_default();
            let user = context["user"].as_str().unwrap_or_default().to_string();
            let amount = context["amount"].as_i64().unwrap_or_default();

            let balance = {
                let mut wallets = wallets.lock().unwrap_or_else(|e| e.into_inner());
                let balance = wallets.entry(user.clone()).or_insert(0);
                *balance -= amount;
                *balance
            };
            bus.emit(
                topics::WALLET_TRANSACTION,
                payload! { "user" => user, "amount" => -amount, "balance" => balance },
            )
            .await;
            anyhow::Ok(())
        }
    });
}

fn payment_machine() -> MachineConfig {
    MachineConfig::new()
        .machine_type("payment")
        .transitions(
            [
                ("idle", "start", "processing"),
                ("processing", "complete", "done"),
                ("processing", "fail", "failed"),
            ]
            .into_iter()
            .collect::<TransitionTable>(),
        )
        .context(payload! { "currency" => "USD" })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,entangle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let hub = Hub::with_bus(&config, EventBus::builder().with_tap(TraceTap))
        .context("Failed to build hub")?;

    start_auth_service(hub.bus());
    start_wallet_service(hub.bus());

    hub.bus()
        .emit(topics::AUTH_LOGIN, payload! { "user" => "ada" })
        .await;

    hub.machines().register("payment-1", payment_machine());
    for (event, data) in [
        ("start", payload! { "user" => "ada", "amount" => 1200 }),
        ("complete", payload! { "receipt" => "r-1" }),
        ("start", payload! {}),
    ] {
        let result = hub.drive("payment-1", event, data).await?;
        if result.success {
            tracing::info!(from = %result.from, to = %result.to, event, "payment advanced");
        } else {
            tracing::warn!(state = %result.from, event, "payment event rejected");
        }
    }

    let machine = hub
        .machines()
        .get("payment-1")
        .context("payment machine disappeared")?;
    println!(
        "payment-1 is {} with context {}",
        machine.state(),
        serde_json::Value::Object(machine.context().clone())
    );

    println!("recent events:");
    for event in hub.bus().recent_events(20) {
        println!(
            "  {} {:<20} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.event_type,
            serde_json::Value::Object(event.data.clone())
        );
    }

    Ok(())
}
