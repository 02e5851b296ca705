use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::create_timestamp;
use crate::shared::{HEARTBEAT_KEY, SharedStore};

/// Liveness record for one worker process; external monitors treat absence
/// or staleness as a dead process
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Heartbeat {
    pub instance_id: String,
    pub pid: u32,
    pub timestamp: String,
}

/// Periodically refreshes the shared heartbeat key. The record's TTL is
/// three publish intervals, so a key that outlives its writer disappears on
/// its own.
pub struct HeartbeatPublisher {
    store: Arc<dyn SharedStore>,
    instance_id: String,
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(store: Arc<dyn SharedStore>, interval: Duration) -> Self {
        Self {
            store,
            instance_id: uuid::Uuid::new_v4().to_string(),
            interval,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Publishes until shutdown, then removes the record only if it still
    /// carries this instance's payload; a faster restart already owns the
    /// key by then and must not be clobbered.
    pub async fn run(self, shutdown: CancellationToken) {
        let ttl = self.interval * 3;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_payload: Option<String> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let heartbeat = Heartbeat {
                        instance_id: self.instance_id.clone(),
                        pid: std::process::id(),
                        timestamp: create_timestamp(),
                    };
                    match serde_json::to_string(&heartbeat) {
                        Ok(payload) => {
                            match self.store.set_ex(HEARTBEAT_KEY, &payload, ttl).await {
                                Ok(()) => last_payload = Some(payload),
                                Err(e) => log::warn!("Failed to publish heartbeat: {e}"),
                            }
                        }
                        Err(e) => log::error!("Failed to serialize heartbeat: {e}"),
                    }
                }
            }
        }

        if let Some(payload) = last_payload {
            match self.store.del_if_eq(HEARTBEAT_KEY, &payload).await {
                Ok(true) => log::info!("Heartbeat record removed on shutdown"),
                Ok(false) => log::debug!("Heartbeat key already taken over by another instance"),
                Err(e) => log::warn!("Failed to remove heartbeat record: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::MemoryStore;

    #[tokio::test]
    async fn publishes_and_cleans_up_after_itself() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let publisher = HeartbeatPublisher::new(store.clone(), Duration::from_millis(20));
        let instance_id = publisher.instance_id().to_string();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let raw = store.get(HEARTBEAT_KEY).await.unwrap().unwrap();
        let heartbeat: Heartbeat = serde_json::from_str(&raw).unwrap();
        assert_eq!(heartbeat.instance_id, instance_id);
        assert_eq!(heartbeat.pid, std::process::id());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(store.get(HEARTBEAT_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_spares_a_newer_instances_record() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let publisher = HeartbeatPublisher::new(store.clone(), Duration::from_millis(20));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A faster restart overwrites the key before the old instance exits
        store
            .set_ex(HEARTBEAT_KEY, "newer-instance", Duration::from_secs(60))
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(
            store.get(HEARTBEAT_KEY).await.unwrap().as_deref(),
            Some("newer-instance")
        );
    }
}
