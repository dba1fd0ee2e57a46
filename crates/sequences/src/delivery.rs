//! Delivery boundary. A provider receives one due step and performs the
//! side-effecting send. Real providers (SMTP, SMS gateway, dialer, task queue)
//! live outside this crate and implement [`DeliveryProvider`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use outreach_core::config::DeliveryConfig;

use crate::types::{StepChannel, StepTemplate};

/// Everything a provider needs to perform one touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub instance_id: Uuid,
    pub lead_id: String,
    pub advisor_id: String,
    pub ordinal: u32,
    pub channel: StepChannel,
    pub title: String,
    pub content: String,
}

impl DeliveryRequest {
    pub fn new(instance_id: Uuid, lead_id: &str, advisor_id: &str, template: &StepTemplate) -> Self {
        Self {
            instance_id,
            lead_id: lead_id.to_string(),
            advisor_id: advisor_id.to_string(),
            ordinal: template.ordinal,
            channel: template.channel.clone(),
            title: template.title.clone(),
            content: template.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub reason: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered() -> Self {
        Self {
            delivered: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            delivered: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, request: &DeliveryRequest) -> DeliveryOutcome;
}

/// Stand-in provider for development. Accepts every request except those on
/// configured failing channels, plus a random share given by
/// `simulated_failure_rate`.
pub struct SimulatedDelivery {
    failure_rate: f64,
    failing_channels: HashSet<String>,
    latency: Duration,
}

impl SimulatedDelivery {
    pub fn new(config: &DeliveryConfig) -> Self {
        info!(
            failure_rate = config.simulated_failure_rate,
            failing_channels = ?config.failing_channels,
            "Simulated delivery provider initialized"
        );
        Self {
            failure_rate: config.simulated_failure_rate.clamp(0.0, 1.0),
            failing_channels: config
                .failing_channels
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            latency: Duration::ZERO,
        }
    }

    /// Adds an artificial delay before every answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl DeliveryProvider for SimulatedDelivery {
    async fn send(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let channel = request.channel.label();
        debug!(
            instance_id = %request.instance_id,
            lead_id = %request.lead_id,
            ordinal = request.ordinal,
            channel,
            title = %request.title,
            "Simulating delivery"
        );

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.failing_channels.contains(channel) {
            return DeliveryOutcome::failed(format!("channel {} unavailable", channel));
        }
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            return DeliveryOutcome::failed("provider rejected message");
        }
        DeliveryOutcome::delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(channel: StepChannel) -> DeliveryRequest {
        DeliveryRequest {
            instance_id: Uuid::new_v4(),
            lead_id: "lead-1".into(),
            advisor_id: "adv-1".into(),
            ordinal: 1,
            channel,
            title: "Hello".into(),
            content: "Body".into(),
        }
    }

    #[tokio::test]
    async fn test_simulated_delivery_honours_config() {
        let config = DeliveryConfig {
            simulated_failure_rate: 0.0,
            failing_channels: vec!["SMS".into()],
            ..DeliveryConfig::default()
        };
        let provider = SimulatedDelivery::new(&config);

        let ok = provider.send(&request(StepChannel::Call)).await;
        assert_eq!(ok, DeliveryOutcome::delivered());

        let failed = provider.send(&request(StepChannel::Sms)).await;
        assert!(!failed.delivered);
        assert_eq!(failed.reason.as_deref(), Some("channel sms unavailable"));
    }

    #[tokio::test]
    async fn test_full_failure_rate_always_fails() {
        let config = DeliveryConfig {
            simulated_failure_rate: 1.0,
            ..DeliveryConfig::default()
        };
        let provider = SimulatedDelivery::new(&config);
        for _ in 0..10 {
            assert!(!provider.send(&request(StepChannel::Task)).await.delivered);
        }
    }
}
