//! Notifier boundary: hands fired alert records to the outside world.
//!
//! Every alert is logged. Optionally it is also POSTed as JSON to a webhook
//! and/or sent as a short text to a Telegram chat through the Bot API.
//! Delivery problems are logged and never bubble up into evaluation.

use anyhow::{Result, anyhow};
use reqwest::Client as HttpClient;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::call::CallEvent;
use crate::catalog::RadioSystem;
use crate::engine::AlertRecord;

#[derive(Clone)]
struct TelegramTarget {
    bot_token: String,
    chat_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Once per call, every fired trigger together.
    System,
    /// Once per fired trigger.
    Trigger,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    scope: Scope,
    system: &'a str,
    system_name: &'a str,
    start_time: f64,
    transcript: &'a str,
    audio_url: Option<&'a str>,
    alerts: &'a [AlertRecord],
}

#[derive(Serialize)]
struct SendMessagePayload<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Clone)]
pub struct Notifier {
    http: HttpClient,
    webhook_url: Option<String>,
    telegram: Option<TelegramTarget>,
    timeout: Duration,
}

impl Notifier {
    /// | Env var              | Default | Purpose                              |
    /// |----------------------|---------|--------------------------------------|
    /// | `NOTIFY_WEBHOOK_URL` | unset   | POST alert JSON here                 |
    /// | `TELEGRAM_BOT_TOKEN` | unset   | Bot used for Telegram delivery       |
    /// | `TELEGRAM_CHAT_ID`   | unset   | Chat receiving the alerts            |
    /// | `NOTIFY_TIMEOUT_MS`  | `5000`  | Per-request delivery timeout         |
    pub fn from_env() -> Self {
        let webhook_url = std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let telegram = match (
            std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            std::env::var("TELEGRAM_CHAT_ID")
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok()),
        ) {
            (Some(bot_token), Some(chat_id)) if !bot_token.is_empty() => {
                Some(TelegramTarget { bot_token, chat_id })
            }
            _ => None,
        };
        let timeout_ms: u64 = std::env::var("NOTIFY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000);

        Self {
            http: HttpClient::new(),
            webhook_url,
            telegram,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[cfg(test)]
    pub fn log_only() -> Self {
        Self {
            http: HttpClient::new(),
            webhook_url: None,
            telegram: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// System-wide actions for everything that fired on one call.
    pub async fn notify_system(&self, system: &RadioSystem, records: &[AlertRecord], call: &CallEvent) {
        if records.is_empty() {
            return;
        }
        info!(
            "Running system actions for {}: {} alert(s)",
            system.short_name,
            records.len()
        );
        self.deliver(Scope::System, system, records, call, self.telegram.is_some())
            .await;
    }

    /// Trigger-specific actions for one fired trigger.
    pub async fn notify_trigger(&self, system: &RadioSystem, record: &AlertRecord, call: &CallEvent) {
        info!(
            "Running trigger actions for {} (id={})",
            record.trigger_name, record.trigger_id
        );
        if record.facebook_enabled {
            info!("Facebook posting requested for {}; no page configured", record.trigger_name);
        }
        self.deliver(
            Scope::Trigger,
            system,
            std::slice::from_ref(record),
            call,
            record.telegram_enabled,
        )
        .await;
    }

    async fn deliver(
        &self,
        scope: Scope,
        system: &RadioSystem,
        records: &[AlertRecord],
        call: &CallEvent,
        telegram: bool,
    ) {
        if let Some(url) = &self.webhook_url {
            let payload = WebhookPayload {
                scope,
                system: &system.short_name,
                system_name: &system.name,
                start_time: call.start_time,
                transcript: call.transcript_text(),
                audio_url: call.audio_url(),
                alerts: records,
            };
            if let Err(e) = self.post_webhook(url, &payload).await {
                warn!("Webhook delivery failed for {}: {e:#}", system.short_name);
            }
        }

        if telegram {
            if let Some(target) = &self.telegram {
                let text = format_alert(system, records, call);
                if let Err(e) = self.send_telegram(target, &text).await {
                    warn!("Telegram delivery failed for {}: {e:#}", system.short_name);
                }
            }
        }
    }

    async fn post_webhook(&self, url: &str, payload: &WebhookPayload<'_>) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let raw = resp.text().await.unwrap_or_default();
            return Err(anyhow!("webhook returned {status} body={raw}"));
        }
        Ok(())
    }

    /// Send a single message to the configured chat via the Bot API.
    async fn send_telegram(&self, target: &TelegramTarget, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", target.bot_token);
        let body = SendMessagePayload {
            chat_id: target.chat_id,
            text,
            disable_web_page_preview: true,
        };
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let raw = resp.text().await.unwrap_or_default();
            return Err(anyhow!("sendMessage failed: {status} body={raw}"));
        }
        Ok(())
    }
}

impl fmt::Display for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Notifier(webhook={}, telegram={}, timeout={}ms)",
            self.webhook_url.is_some(),
            self.telegram.is_some(),
            self.timeout.as_millis(),
        )
    }
}

/// Hand a call's results to the notifier: once for the system, then once
/// per fired trigger.
pub async fn dispatch(notifier: &Notifier, system: &RadioSystem, call: &CallEvent, records: &[AlertRecord]) {
    if records.is_empty() {
        return;
    }
    notifier.notify_system(system, records, call).await;
    for record in records {
        notifier.notify_trigger(system, record, call).await;
    }
}

/// Plain-text summary used for chat delivery and replay output.
pub fn format_alert(system: &RadioSystem, records: &[AlertRecord], call: &CallEvent) -> String {
    let names: Vec<&str> = records.iter().map(|r| r.trigger_name.as_str()).collect();
    let title = if system.name.is_empty() {
        &system.short_name
    } else {
        &system.name
    };

    let mut out = format!("🚨 {title}: {}\n", names.join(", "));

    for record in records {
        let mut details = Vec::new();
        for m in record
            .two_tone
            .iter()
            .chain(&record.long_tone)
            .chain(&record.hi_low_tone)
        {
            details.push(format!("tone {} ({} Hz)", m.tone_id, m.tones_matched));
        }
        for m in &record.alert_filter {
            details.push(format!("\"{}\"", m.keyword));
        }
        if !details.is_empty() {
            out.push_str(&format!("- {}: {}\n", record.trigger_name, details.join("; ")));
        }
    }

    let transcript = call.transcript_text().trim();
    if !transcript.is_empty() {
        // Bot API messages cap out at 4096 chars.
        let trimmed: String = transcript.chars().take(3000).collect();
        out.push_str(&format!("---\n{trimmed}\n"));
    }
    if let Some(url) = call.audio_url() {
        out.push_str(&format!("🔊 {url}"));
    }
    out.trim_end().to_string()
}
