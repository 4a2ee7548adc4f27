use super::{ChannelError, Notification, NotificationChannel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Posts each notification as JSON to an HTTP gateway (email/SMS/push relay).
#[derive(Clone)]
pub struct WebhookChannel {
    http: Client,
    url: Url,
    token: Option<String>,
}

impl fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookChannel")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookChannel {
    pub fn new(url: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("care-reminders/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, url, token })
    }

    pub fn build_request(&self, notification: &Notification) -> Result<reqwest::Request, ChannelError> {
        let mut req = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            // Lets the gateway drop duplicates when we retry after a lost response.
            .header("Idempotency-Key", notification.event_id.as_str())
            .json(notification);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.build()
            .map_err(|err| ChannelError::Permanent(format!("failed to build request: {}", err)))
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let request = self.build_request(notification)?;
        debug!(url = %request.url(), event_id = %notification.event_id, "posting notification");

        let res = self.http.execute(request).await.map_err(classify_transport)?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        warn!(%status, body = %body, event_id = %notification.event_id, "gateway rejected notification");
        Err(classify_status(status, &body))
    }
}

/// 408, 429 and 5xx are worth retrying; any other non-success is final.
pub fn classify_status(status: StatusCode, body: &str) -> ChannelError {
    let msg = format!("gateway returned {}: {}", status, body);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ChannelError::Transient(msg)
    } else {
        ChannelError::Permanent(msg)
    }
}

fn classify_transport(err: reqwest::Error) -> ChannelError {
    if err.is_builder() {
        ChannelError::Permanent(err.to_string())
    } else {
        ChannelError::Transient(err.to_string())
    }
}
