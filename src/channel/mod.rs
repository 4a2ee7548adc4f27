//! Outbound notification channels.
//!
//! A channel takes a rendered [`Notification`] and either delivers it or
//! returns a classified [`ChannelError`]. Providers (email/SMS gateways, push)
//! sit behind [`NotificationChannel`]; [`ChannelRouter`] picks one per event.
use crate::config::ChannelConfig;
use crate::model::{ChannelKind, ScheduledEvent, SubjectType};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub mod template;
pub mod webhook;

pub use template::{MessageTemplates, RenderError};
pub use webhook::WebhookChannel;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Timeouts, 5xx, throttling. Worth retrying.
    #[error("transient channel error: {0}")]
    Transient(String),
    /// Invalid recipient, malformed payload. Retrying cannot help.
    #[error("permanent channel error: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Transient(_))
    }
}

/// Message handed to a channel provider.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub event_id: String,
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub subject_type: SubjectType,
    pub message: String,
    pub payload: Value,
}

impl Notification {
    pub fn from_event(
        event: &ScheduledEvent,
        templates: &MessageTemplates,
    ) -> Result<Self, RenderError> {
        Ok(Self {
            event_id: event.id.clone(),
            recipient_id: event.recipient_id.clone(),
            channel: event.channel,
            subject_type: event.subject_type,
            message: templates.render_for(event.subject_type, &event.payload)?,
            payload: event.payload.clone(),
        })
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// Routes each notification to the provider registered for its channel kind.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    channels: BTreeMap<ChannelKind, Arc<dyn NotificationChannel>>,
}

impl fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("kinds", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ChannelKind, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(kind, channel);
        self
    }

    pub fn from_config(
        channels: &BTreeMap<ChannelKind, ChannelConfig>,
        send_timeout: Duration,
    ) -> Result<Self> {
        let mut router = Self::new();
        for (kind, cfg) in channels {
            let channel: Arc<dyn NotificationChannel> = match cfg {
                ChannelConfig::Webhook { url, token } => Arc::new(WebhookChannel::new(
                    url.parse()?,
                    token.clone(),
                    send_timeout,
                )?),
                ChannelConfig::Log => Arc::new(LogChannel),
            };
            router = router.with(*kind, channel);
        }
        Ok(router)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChannelKind> + '_ {
        self.channels.keys().copied()
    }
}

#[async_trait]
impl NotificationChannel for ChannelRouter {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let Some(channel) = self.channels.get(&notification.channel) else {
            return Err(ChannelError::Permanent(format!(
                "no provider configured for channel {}",
                notification.channel.as_str()
            )));
        };
        channel.send(notification).await
    }
}

/// Logs notifications instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        info!(
            event_id = %notification.event_id,
            recipient_id = %notification.recipient_id,
            channel = notification.channel.as_str(),
            message = %notification.message,
            "notification (log channel)"
        );
        Ok(())
    }
}
