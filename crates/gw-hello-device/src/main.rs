//! Reference temperature-sensor device.
//!
//! Connects to the gateway, authenticates, subscribes to its command
//! subtree, and publishes a simulated temperature reading on an
//! interval. Commands:
//!
//! - `cmd.<device-id>.set-interval`  — payload `{ "ms": 5000 }`
//! - `cmd.<device-id>.ping`          — logged only
//!
//! Usage:
//!   GW_AUTH_TOKEN=secret gw-hello-device ws://localhost:8080/ws
//!
//! Env vars:
//!   GW_AUTH_TOKEN   — auth token (must match gateway)
//!   GW_DEVICE_ID    — device ID (default: "hello-sensor")
//!   GW_INTERVAL_MS  — initial publish interval (default: 2000)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gw_device_sdk::{DeviceClient, DeviceConfig, ErrorCode};
use rand::Rng;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let gateway_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8080/ws".into());
    let device_id = std::env::var("GW_DEVICE_ID").unwrap_or_else(|_| "hello-sensor".into());
    let token = std::env::var("GW_AUTH_TOKEN").unwrap_or_default();
    let interval_ms: u64 = std::env::var("GW_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2_000);

    let config = DeviceConfig::builder()
        .gateway_url(&gateway_url)
        .device_id(&device_id)
        .auth_token(token)
        .build()?;

    let mut client = DeviceClient::new(config)?;

    client.on_error(|code: ErrorCode, message: &str| {
        tracing::warn!(%code, message, "client error");
    });
    client.on_reconnecting(|attempt| {
        tracing::info!(attempt, "reconnecting to gateway");
    });
    client.on_disconnected(|code: ErrorCode, reason: &str| {
        tracing::warn!(%code, reason, "disconnected");
    });

    client.run_async();
    tracing::info!(url = %gateway_url, device_id = %device_id, "connecting");
    if !client.connect().await {
        anyhow::bail!("failed to connect to {gateway_url}");
    }

    if let Some(info) = client.device_info() {
        tracing::info!(
            publish_topics = ?info.allowed_publish_topics,
            subscribe_topics = ?info.allowed_subscribe_topics,
            "authenticated"
        );
    }

    let handle = client.handle();

    // Command subtree: the orchestrator can retune the publish rate.
    let interval = Arc::new(AtomicU64::new(interval_ms));
    {
        let interval = Arc::clone(&interval);
        handle.subscribe(&format!("cmd.{device_id}.>"), move |subject, payload, _| {
            tracing::info!(subject, %payload, "command received");
            if subject.ends_with(".set-interval") {
                if let Some(ms) = payload.get("ms").and_then(|v| v.as_u64()) {
                    interval.store(ms.max(100), Ordering::Relaxed);
                }
            }
        })?;
    }

    // Telemetry loop: a bounded random walk around 25 °C.
    let telemetry = tokio::spawn({
        let handle = client.handle();
        let interval = Arc::clone(&interval);
        async move {
            let mut temperature: f64 = 25.0;
            loop {
                tokio::time::sleep(Duration::from_millis(interval.load(Ordering::Relaxed))).await;

                temperature += rand::thread_rng().gen_range(-0.5..0.5);
                temperature = temperature.clamp(15.0, 35.0);

                let reading = serde_json::json!({
                    "celsius": (temperature * 10.0).round() / 10.0,
                    "unit": "C",
                });
                match handle.publish("telemetry.temperature", reading) {
                    Ok(()) => tracing::debug!(temperature, "published reading"),
                    Err(e) => tracing::warn!(error = %e, "publish failed"),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    telemetry.abort();
    client.disconnect().await?;
    client.stop().await;

    let stats = client.stats();
    tracing::info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        reconnects = stats.reconnect_count,
        "session stats"
    );
    Ok(())
}
