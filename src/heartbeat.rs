//! Heartbeat monitor
//!
//! Recurring sweep that evicts connections whose last heartbeat is older
//! than the client timeout. The sweep collects the stale set under a read
//! lock first, then evicts each connection without holding any lock across
//! the pass, so a slow eviction never stalls live traffic.

use crate::gateway::Gateway;
use crate::protocol::ConnectionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

/// Eviction reason recorded for timed-out connections
pub const TIMEOUT_REASON: &str = "heartbeat timeout";

/// Periodic liveness sweep over the gateway's registry
pub struct HeartbeatMonitor {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Start the sweep task using the gateway's configured period and timeout
    pub fn start(gateway: Arc<Gateway>) -> Self {
        let period = gateway.config().heartbeat_interval;
        let timeout = gateway.config().client_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick fires immediately; skip it so a freshly started
            // monitor never races connections made during startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep(&gateway, timeout).await;
            }
        });

        info!(period_secs = period.as_secs(), timeout_secs = timeout.as_secs(), "Heartbeat monitor started");
        Self {
            handle: Some(handle),
        }
    }

    /// Stop the sweep task
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Heartbeat monitor stopped");
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one sweep: collect stale connections, then evict them one by one
pub async fn sweep(gateway: &Gateway, timeout: Duration) -> Vec<ConnectionId> {
    let stale = gateway.registry().stale(timeout).await;

    for &id in &stale {
        warn!(connection_id = %id, "Client timeout, disconnecting");
        gateway.disconnect(id, TIMEOUT_REASON).await;
    }

    stale
}
