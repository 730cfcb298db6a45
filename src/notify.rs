// =============================================================================
// Webhook Notifier — fire-and-forget operator notifications
// =============================================================================
//
// Discord-shaped webhook POSTs for startup, stop updates and cycle failures.
// No webhook URL means notifications are disabled; delivery failures are
// logged and never escalated into the cycle path.
// =============================================================================

use serde_json::json;
use tracing::{debug, warn};

use crate::orchestrator::CycleReport;

pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        if webhook_url.is_none() {
            warn!("webhook URL not configured — notifications disabled");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// POST `message` to the webhook. Best effort only.
    pub async fn send(&self, message: &str) {
        let Some(url) = self.webhook_url.as_deref() else {
            return;
        };

        let payload = json!({
            "content": message,
            "username": "Aegis Stop-Loss Guard",
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("notification delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "notification rejected by webhook");
            }
            Err(err) => {
                warn!(error = %err, "notification delivery failed");
            }
        }
    }

    pub async fn startup(&self) {
        self.send(
            "Aegis stop-loss guard started — monitoring existing positions \
             and auto-adjusting protective stops",
        )
        .await;
    }

    /// Summarise a cycle that had per-symbol failures.
    pub async fn cycle_failures(&self, report: &CycleReport) {
        let mut message = format!(
            "Cycle {} finished with {} failure(s):",
            report.cycle_id, report.failed
        );
        for failure in &report.failures {
            message.push_str("\n- ");
            message.push_str(failure);
        }
        self.send(&message).await;
    }
}
