//! Send loop: drains the outbound queue while the link is up

use super::RunnerShared;
use crate::error::RunnerResult;
use crate::signal::Signal;
use crate::transport::{OutboundMessage, Transport};
use tracing::{debug, error, warn};

pub(crate) async fn send_loop<T: Transport>(shared: RunnerShared<T>) -> RunnerResult<()> {
    let device_id = shared.device.device_id();

    loop {
        if !shared.signals.is_connected()
            && shared
                .signals
                .wait_first(&[Signal::Connected, Signal::Exit])
                .await
                == Signal::Exit
        {
            debug!(device_id, "Send loop exiting");
            return Ok(());
        }

        let in_flight = tokio::select! {
            biased;
            _ = shared.signals.wait_exit() => {
                debug!(device_id, "Send loop exiting");
                return Ok(());
            }
            item = shared.queue.pop() => item,
        };

        if shared.signals.is_exiting() {
            in_flight.restore();
            return Ok(());
        }

        let body = match shared.device.build_payload(in_flight.get()) {
            Ok(body) => body,
            Err(e) => {
                error!(device_id, error = %e, "Discarding reading that cannot be sent");
                in_flight.discard();
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = shared.signals.wait_exit() => None,
            result = shared.transport.send(OutboundMessage::json(body)) => Some(result),
        };

        match sent {
            None => {
                debug!(device_id, "Send interrupted by exit, keeping reading queued");
                in_flight.restore();
                return Ok(());
            }
            Some(Ok(())) => {
                in_flight.complete();
                debug!(device_id, pending = shared.queue.len(), "Telemetry sent");
            }
            Some(Err(e)) => {
                warn!(device_id, error = %e, "Send failed, re-queued reading");
                in_flight.requeue();
                tokio::task::yield_now().await;
            }
        }
    }
}
