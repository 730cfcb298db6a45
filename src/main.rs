// =============================================================================
// Aegis Stop-Loss Guard — Main Entry Point
// =============================================================================
//
// The daemon only protects positions that already exist: it never opens or
// closes trades itself. Credentials must be present at startup; everything
// after that is contained per cycle.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod config;
mod engine;
mod exchange;
mod indicators;
mod notify;
mod orchestrator;
mod resilience;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceFuturesClient;
use crate::config::GuardConfig;
use crate::notify::Notifier;
use crate::orchestrator::ProtectionOrchestrator;

const CONFIG_PATH: &str = "guard_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aegis Stop-Loss Guard — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = GuardConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        GuardConfig::default()
    });
    let config = Arc::new(config);

    info!(
        atr_period = config.atr_period,
        atr_multiplier = config.atr_multiplier,
        trailing_pct = config.trailing_pct,
        normal_interval_secs = config.normal_interval_secs,
        "Protection parameters loaded"
    );

    // Fatal at startup by design: without credentials there is nothing to
    // protect.
    let api_key = std::env::var("BINANCE_API_KEY")
        .context("BINANCE_API_KEY must be set in the environment or .env")?;
    let api_secret = std::env::var("BINANCE_API_SECRET")
        .context("BINANCE_API_SECRET must be set in the environment or .env")?;

    // ── 2. Build client, notifier, orchestrator ──────────────────────────
    let client = Arc::new(BinanceFuturesClient::new(api_key, api_secret));
    let notifier = Arc::new(Notifier::new(config.webhook_url.clone()));
    let orchestrator = Arc::new(ProtectionOrchestrator::new(client, config.clone()));

    notifier.startup().await;

    // ── 3. Monitor loop ──────────────────────────────────────────────────
    let loop_orchestrator = orchestrator.clone();
    let loop_notifier = notifier.clone();
    let loop_config = config.clone();
    tokio::spawn(async move {
        loop {
            if !loop_orchestrator.health_check().await {
                warn!(
                    retry_secs = loop_config.retry_interval_secs,
                    "Health check failed — backing off before next cycle"
                );
                loop_notifier
                    .send("Health check failed — backing off before next cycle")
                    .await;
                tokio::time::sleep(Duration::from_secs(loop_config.retry_interval_secs)).await;
                continue;
            }

            let report = loop_orchestrator.run_cycle().await;
            if report.failed > 0 {
                loop_notifier.cycle_failures(&report).await;
            }

            let interval = loop_orchestrator.recommended_interval().await;
            info!(
                next_check_secs = interval.as_secs(),
                updated = report.updated,
                "Cycle complete — sleeping until next check"
            );
            tokio::time::sleep(interval).await;
        }
    });

    info!("Monitor loop running. Press Ctrl+C to stop.");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save guard config on shutdown");
    }

    notifier.send("Aegis stop-loss guard shut down").await;
    info!("Aegis Stop-Loss Guard shut down complete.");
    Ok(())
}
