//! Liveness watchdog.
//!
//! Pings the server with `server.getVersion` every interval. A ping that
//! misses its deadline marks the server unresponsive; any later reply
//! (or any inbound traffic at all) marks it healthy again.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::analysis_client::{AnalysisClient, Inner};
use super::state::{ClientState, Health};
use crate::error::ClientError;
use crate::protocol::methods::GetVersion;
use crate::protocol::NoParams;

/// Spawn the watchdog. It holds only a weak reference, so it never keeps
/// a dropped client alive, and it exits once the client leaves `Running`.
pub(crate) fn spawn_watchdog(
    client: Weak<Inner>,
    period: Duration,
    ping_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(inner) = client.upgrade() else { break };
            let client = AnalysisClient::from_inner(inner);
            if client.state() != ClientState::Running {
                break;
            }

            let lifecycle = client.lifecycle();
            let ping = match client.send::<GetVersion>(NoParams) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("Liveness ping not sent: {}", e);
                    break;
                }
            };
            // Do not keep the client alive while waiting
            drop(client);

            match ping.wait_timeout(ping_timeout).await {
                Ok(_) => lifecycle.set_health(Health::Healthy),
                Err(ClientError::Timeout(limit)) => {
                    warn!("Liveness ping unanswered after {:?}", limit);
                    lifecycle.set_health(Health::Unresponsive);
                }
                Err(e) if e.is_systemic() => break,
                // Any reply, even an error, proves the server is alive
                Err(e) => {
                    debug!("Liveness ping answered with error: {}", e);
                    lifecycle.set_health(Health::Healthy);
                }
            }
        }

        debug!("Liveness watchdog stopped");
    })
}
