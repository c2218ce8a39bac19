//! One-shot inspection of the error queue (`--get-errors`).

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::broker::{Broker, Keys};
use crate::protocol::QueueMessage;

/// Pop every entry off the error queue and log it.  Malformed entries are
/// logged and skipped.  Returns the number of well-formed entries drained.
pub async fn drain_errors(broker: &dyn Broker, keys: &Keys) -> Result<usize> {
    let mut drained = 0;
    while broker
        .length(&keys.errors)
        .await
        .context("read error queue length")?
        > 0
    {
        let Some(raw) = broker
            .pop_head(&keys.errors)
            .await
            .context("pop error queue")?
        else {
            break;
        };
        match serde_json::from_str::<QueueMessage>(&raw) {
            Ok(entry) => {
                info!(message = %entry.message, "error queue entry");
                drained += 1;
            }
            Err(e) => warn!(error = %e, %raw, "malformed error queue entry"),
        }
    }
    info!(drained, "error queue empty");
    Ok(drained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[tokio::test]
    async fn drains_until_empty_skipping_garbage() {
        let broker = MemoryBroker::new();
        let keys = Keys::new("worker");
        broker.seed_list(
            "worker:errors",
            &[r#"{"message":"abc"}"#, "garbage", r#"{"message":"xyz"}"#],
        );

        assert_eq!(drain_errors(&broker, &keys).await.unwrap(), 2);
        assert!(broker.list("worker:errors").is_empty());
        assert_eq!(broker.count("pop_head"), 3);
    }

    #[tokio::test]
    async fn empty_queue_drains_nothing() {
        let broker = MemoryBroker::new();
        let keys = Keys::new("worker");
        assert_eq!(drain_errors(&broker, &keys).await.unwrap(), 0);
        assert_eq!(broker.count("pop_head"), 0);
    }

    #[tokio::test]
    async fn broker_failure_is_reported() {
        let broker = MemoryBroker::new();
        let keys = Keys::new("worker");
        broker.fail("length");
        assert!(drain_errors(&broker, &keys).await.is_err());
    }
}
