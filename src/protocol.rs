//! Payloads exchanged through the broker.
//!
//! - control messages on `<ns>:events`
//! - liveness-probe replies on a worker's private reply list
//! - work items on the message and error queues

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlEventType {
    HealthCheck,
    StartAsGenerator,
}

/// Cross-worker command published on the shared events channel.  Every
/// worker receives every message and ignores the ones not addressed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub worker_id: String,
    pub event_type: ControlEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_channel: Option<String>,
}

impl ControlMessage {
    /// Probe addressed to `worker_id`; the reply list is named after the
    /// probed worker.
    pub fn health_check(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            event_type: ControlEventType::HealthCheck,
            reply_channel: Some(worker_id.to_string()),
        }
    }

    pub fn start_as_generator(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            event_type: ControlEventType::StartAsGenerator,
            reply_channel: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("encode control message")
    }

    /// Decode and validate an inbound control message.
    pub fn decode(raw: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(raw).context("decode control message")?;
        if message.event_type == ControlEventType::HealthCheck {
            anyhow::ensure!(
                message.reply_channel.as_deref().is_some_and(|c| !c.is_empty()),
                "health-check without replyChannel"
            );
        }
        Ok(message)
    }
}

pub const STATUS_OK: &str = "ok";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReply {
    pub status: String,
}

impl HealthReply {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// A work item on the message or error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message: String,
}
