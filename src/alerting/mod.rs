//! Alerting module for webhook notifications
//!
//! Ban notices are queued from the synchronous scan path and delivered by
//! an async dispatcher to Discord and generic webhooks.

use crate::config::{AlertConfig, DiscordConfig, WebhookConfig};
use crate::models::{AuditAction, BanAuditEntry};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

const QUEUE_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Alert channel closed")]
    ChannelClosed,
}

/// Notification payload for a ban transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanNotice {
    pub action: AuditAction,
    pub address: String,
    pub attempts: u32,
    pub user: String,
    pub workstation: String,
    pub applied: bool,
    pub location: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&BanAuditEntry> for BanNotice {
    fn from(entry: &BanAuditEntry) -> Self {
        BanNotice {
            action: entry.action,
            address: entry.address.clone(),
            attempts: entry.attempts,
            user: entry.user.clone(),
            workstation: entry.workstation.clone(),
            applied: entry.applied,
            location: entry.location.clone(),
            timestamp: entry.timestamp,
        }
    }
}

impl BanNotice {
    fn title(&self) -> String {
        match self.action {
            AuditAction::Ban => format!("Blocked {}", self.address),
            AuditAction::ManualBan => format!("Manually blocked {}", self.address),
            AuditAction::Unban => format!("Unblocked {}", self.address),
        }
    }

    fn color(&self) -> u32 {
        match (self.action, self.applied) {
            (_, false) => 0xFFCC00,          // Yellow: firewall change failed
            (AuditAction::Unban, _) => 0x00FF00,
            (AuditAction::ManualBan, _) => 0xFF6600,
            (AuditAction::Ban, _) => 0xFF0000,
        }
    }
}

/// Async alert dispatcher
///
/// Run it as a tokio task with the receiving half of `create_channel()`.
pub struct AlertDispatcher {
    config: AlertConfig,
    client: Client,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        AlertDispatcher {
            config,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn create_channel() -> (mpsc::Sender<BanNotice>, mpsc::Receiver<BanNotice>) {
        mpsc::channel(QUEUE_CAPACITY)
    }

    /// Receive notices until every sender is dropped
    pub async fn run(self, mut rx: mpsc::Receiver<BanNotice>) {
        log::info!("Alert dispatcher started");

        while let Some(notice) = rx.recv().await {
            if !self.config.enabled {
                continue;
            }

            log::info!("Sending alert: {}", notice.title());
            if let Err(e) = self.dispatch_alert(&notice).await {
                log::debug!("Alert for {} not fully delivered: {}", notice.address, e);
            }
        }

        log::info!("Alert dispatcher stopped");
    }

    /// Deliver to every configured target; the first failure is returned
    /// after all targets were tried
    async fn dispatch_alert(&self, notice: &BanNotice) -> Result<(), AlertError> {
        let mut targets = Vec::new();
        if let Some(discord) = &self.config.discord {
            let request = self
                .client
                .post(&discord.webhook_url)
                .json(&discord_payload(discord, notice));
            targets.push(("discord".to_string(), request));
        }
        for webhook in &self.config.webhooks {
            targets.push((webhook.name.clone(), self.webhook_request(webhook).json(notice)));
        }

        let mut first_error = None;
        for (target, request) in targets {
            if let Err(e) = deliver(&target, request).await {
                log::error!("Alert to {} failed: {}", target, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn webhook_request(&self, webhook: &WebhookConfig) -> RequestBuilder {
        let method = webhook.method.as_deref().unwrap_or("POST");
        let mut request = if method.eq_ignore_ascii_case("PUT") {
            self.client.put(&webhook.url)
        } else {
            self.client.post(&webhook.url)
        };
        for (key, value) in webhook.headers.iter().flatten() {
            request = request.header(key, value);
        }
        request
    }
}

/// A non-2xx answer is logged but not an error; the notice is not retried
async fn deliver(target: &str, request: RequestBuilder) -> Result<(), AlertError> {
    let status = request.send().await?.status();
    if !status.is_success() {
        log::warn!("Alert target {} answered {}", target, status);
    }
    Ok(())
}

fn discord_payload(config: &DiscordConfig, notice: &BanNotice) -> serde_json::Value {
    serde_json::json!({
        "username": config.username.as_deref().unwrap_or("smbguard"),
        "embeds": [{
            "title": format!(":shield: {}", notice.title()),
            "color": notice.color(),
            "fields": [
                { "name": "Attempts", "value": notice.attempts.to_string(), "inline": true },
                { "name": "User", "value": &notice.user, "inline": true },
                { "name": "Workstation", "value": &notice.workstation, "inline": true },
                { "name": "Location", "value": notice.location.as_deref().unwrap_or("unknown"), "inline": true },
                { "name": "Firewall", "value": if notice.applied { "applied" } else { "failed" }, "inline": true },
            ],
            "timestamp": notice.timestamp.to_rfc3339(),
            "footer": { "text": "smbguard" }
        }]
    })
}

/// Synchronous handle for queueing notices
#[derive(Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<BanNotice>,
}

impl AlertQueue {
    pub fn new(tx: mpsc::Sender<BanNotice>) -> Self {
        AlertQueue { tx }
    }

    /// Queue a notice without blocking; a full or closed queue drops it
    pub fn queue_alert(&self, notice: BanNotice) {
        if let Err(e) = self.tx.try_send(notice) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    log::warn!("Alert queue full, dropping alert");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::warn!("Alert queue closed");
                }
            }
        }
    }

    pub async fn queue_alert_async(&self, notice: BanNotice) -> Result<(), AlertError> {
        self.tx
            .send(notice)
            .await
            .map_err(|_| AlertError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
