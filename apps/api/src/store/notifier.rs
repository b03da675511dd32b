use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::BalanceNotifier;

/// Publishes balance changes on `org:<id>:balance` so other connected
/// clients can refresh. Connect and publish share one timeout; every
/// failure is logged and dropped.
#[derive(Clone)]
pub struct RedisBalanceNotifier {
    client: redis::Client,
    timeout: Duration,
}

impl RedisBalanceNotifier {
    pub fn new(client: redis::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn publish(&self, channel: &str, payload: String) -> redis::RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

pub fn balance_channel(organization_id: Uuid) -> String {
    format!("org:{organization_id}:balance")
}

#[async_trait]
impl BalanceNotifier for RedisBalanceNotifier {
    async fn balance_changed(&self, organization_id: Uuid, spent: i64) {
        let channel = balance_channel(organization_id);
        let payload = json!({
            "type": "balance_changed",
            "organization_id": organization_id,
            "tokens_spent": spent,
        })
        .to_string();

        match tokio::time::timeout(self.timeout, self.publish(&channel, payload)).await {
            Ok(Ok(())) => debug!(%organization_id, "Balance broadcast sent"),
            Ok(Err(e)) => warn!(%organization_id, "Balance broadcast failed: {e}"),
            Err(_) => warn!(%organization_id, "Balance broadcast timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_channel_name() {
        let id = Uuid::nil();
        assert_eq!(
            balance_channel(id),
            "org:00000000-0000-0000-0000-000000000000:balance"
        );
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_swallowed() {
        // Port 1 refuses connections; the call must return without panicking.
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let notifier = RedisBalanceNotifier::new(client, Duration::from_millis(200));
        notifier.balance_changed(Uuid::new_v4(), 10).await;
    }
}
