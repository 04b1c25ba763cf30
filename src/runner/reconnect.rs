//! Reconnect loop
//!
//! Whenever the link is down and exit has not been requested, keep issuing
//! connect attempts with exponential backoff until one succeeds or the
//! backoff ceiling is reached.

use super::RunnerShared;
use crate::backoff::BackoffDecision;
use crate::error::{RunnerError, RunnerResult};
use crate::signal::Signal;
use crate::transport::Transport;
use tracing::{debug, error, info, warn};

pub(crate) async fn reconnect_loop<T: Transport>(shared: RunnerShared<T>) -> RunnerResult<()> {
    let device_id = shared.device.device_id();

    loop {
        if shared
            .signals
            .wait_first(&[Signal::Disconnected, Signal::Exit])
            .await
            == Signal::Exit
        {
            debug!(device_id, "Reconnect loop exiting");
            return Ok(());
        }

        loop {
            if shared.signals.is_exiting() {
                return Ok(());
            }

            let attempt = shared.lock_backoff().attempt();
            info!(device_id, attempt, "Connecting to IoT Hub");

            let result = tokio::select! {
                biased;
                _ = shared.signals.wait_exit() => {
                    debug!(device_id, attempt, "Connect attempt abandoned on exit");
                    return Ok(());
                }
                result = shared.transport.connect() => result,
            };

            let error = match result {
                Ok(()) => {
                    info!(device_id, attempt, "Connected");
                    break;
                }
                Err(e) => e,
            };

            let decision = shared.lock_backoff().record_failure(&shared.policy);
            match decision {
                BackoffDecision::Retry {
                    failed_attempt,
                    delay,
                    next_attempt,
                } => {
                    warn!(
                        device_id,
                        attempt = failed_attempt,
                        next_attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %error,
                        "Connection attempt failed, retrying"
                    );
                    if !shared.signals.sleep_or_exit(delay).await {
                        debug!(device_id, "Backoff sleep interrupted by exit");
                        return Ok(());
                    }
                }
                BackoffDecision::Exhausted {
                    failed_attempt,
                    delay,
                } => {
                    error!(
                        device_id,
                        attempt = failed_attempt,
                        error = %error,
                        "Could not reconnect within the retry limit, giving up"
                    );
                    shared.signals.request_exit();
                    return Err(RunnerError::RetryBudgetExhausted {
                        device_id: device_id.to_string(),
                        attempts: failed_attempt,
                        max_delay: delay,
                    });
                }
            }
        }
    }
}
