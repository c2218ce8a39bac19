use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::broker::{Broker, Keys};
use crate::protocol::{ControlMessage, HealthReply};

/// Ask `worker_id` whether it is alive.
///
/// Publishes a `health-check` on the shared events channel, then waits up to
/// `timeout` for a reply on the list named after the probed worker.  Returns
/// `false` when nothing (or something other than `{"status":"ok"}`) arrives.
pub async fn check_health(
    broker: &dyn Broker,
    keys: &Keys,
    worker_id: &str,
    timeout: Duration,
) -> Result<bool> {
    let request = ControlMessage::health_check(worker_id);
    let reply_channel = request.reply_channel.clone().unwrap_or_default();
    broker
        .publish(&keys.events, &request.encode()?)
        .await
        .context("publish health-check")?;

    let Some(raw) = broker
        .blocking_pop_head(&reply_channel, Some(timeout))
        .await
        .context("wait for health reply")?
    else {
        debug!(%worker_id, ?timeout, "health probe timed out");
        return Ok(false);
    };

    match serde_json::from_str::<HealthReply>(&raw) {
        Ok(reply) => Ok(reply.is_ok()),
        Err(e) => {
            warn!(%worker_id, error = %e, "malformed health reply");
            Ok(false)
        }
    }
}
