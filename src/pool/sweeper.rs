//! Periodic eviction of idle and over-aged connections.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::PoolInner;
use crate::connection::ConnectionFactory;

/// Start the sweeper. It stops on its own once the pool is closed or
/// dropped.
pub(crate) fn spawn<F: ConnectionFactory>(
    pool: Weak<PoolInner<F>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            pool.evict_expired();
        }
        debug!("eviction sweeper stopped");
    })
}
