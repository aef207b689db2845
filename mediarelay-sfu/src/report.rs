//! Receiver-report interval scheduling

use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::Transport;

/// Close the report interval of `transport` every `report_interval_ms`.
///
/// The task ends when `cancel` fires, or on its own once the transport is
/// stopped or dropped. It does not keep the transport alive.
pub fn spawn_report_task(transport: &Arc<Transport>, cancel: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_millis(transport.config().stats.report_interval_ms.max(1));
    let transport = Arc::downgrade(transport);
    tokio::spawn(report_loop(transport, period, cancel))
}

async fn report_loop(transport: Weak<Transport>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    info!(interval_ms = period.as_millis(), "Starting report interval task");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Report interval task cancelled");
                return;
            }
            _ = ticker.tick() => {
                let Some(transport) = transport.upgrade() else {
                    debug!("Transport dropped, ending report interval task");
                    return;
                };
                if transport.is_stopped() {
                    debug!("Transport stopped, ending report interval task");
                    return;
                }
                transport.close_report_interval();
            }
        }
    }
}
