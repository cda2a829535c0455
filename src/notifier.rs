//! Push notifications to registered subscriptions

use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Notification delivery
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver to every subscription; returns how many accepted it
    async fn notify(&self, title: &str, body: &str) -> usize;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    body: &'a str,
}

/// POSTs `{title, body}` JSON to each subscription endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
}

impl WebhookNotifier {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    async fn send(&self, endpoint: &str, payload: &WebhookPayload<'_>) -> Result<()> {
        let resp = self.client.post(endpoint).json(payload).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Notification(format!(
                "{} rejected push: {}",
                endpoint,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, title: &str, body: &str) -> usize {
        let subscriptions = match self.config.service().list_push_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load push subscriptions");
                return 0;
            }
        };
        if subscriptions.is_empty() {
            tracing::debug!("No push subscriptions, skipping notification");
            return 0;
        }

        let payload = WebhookPayload { title, body };
        let sends = subscriptions.iter().map(|sub| {
            let payload = &payload;
            async move {
                match self.send(&sub.endpoint, payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(subscription_id = %sub.id, error = %e, "Push failed");
                        false
                    }
                }
            }
        });

        let delivered = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        tracing::info!(
            delivered = delivered,
            total = subscriptions.len(),
            "Notification sent"
        );
        delivered
    }
}
