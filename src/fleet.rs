//! Running many device runners as one process
//!
//! Each runner is independent, but the fleet is not: when one runner ends,
//! whether it was stopped or gave up reconnecting, every other runner is
//! stopped too and the process winds down.

use crate::dispatch::MethodRegistry;
use crate::error::RunnerResult;
use crate::runner::{DeviceRunner, MessageCallback};
use crate::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

/// How one runner ended
#[derive(Debug)]
pub struct RunnerOutcome {
    pub device_id: String,
    pub result: RunnerResult<()>,
}

/// Run every runner until one of them ends or `shutdown` resolves, then stop
/// the rest and wait for all of them.
///
/// Outcomes are returned in completion order.
pub async fn run_fleet<T, S>(
    runners: Vec<Arc<DeviceRunner<T>>>,
    on_message: Option<MessageCallback>,
    registry: Option<Arc<MethodRegistry>>,
    shutdown: S,
) -> Vec<RunnerOutcome>
where
    T: Transport + 'static,
    S: Future<Output = ()>,
{
    let mut tasks = JoinSet::new();
    for runner in &runners {
        let runner = Arc::clone(runner);
        let on_message = on_message.clone();
        let registry = registry.clone();
        tasks.spawn(
            async move {
                let result = runner.run(on_message, registry).await;
                RunnerOutcome {
                    device_id: runner.device_id().to_string(),
                    result,
                }
            }
            .in_current_span(),
        );
    }
    info!(devices = runners.len(), "Fleet started");

    let stop_all = |reason: &str| {
        info!(reason, "Stopping all device runners");
        for runner in &runners {
            runner.stop();
        }
    };

    let mut outcomes = Vec::with_capacity(runners.len());
    let mut stopping = false;
    tokio::pin!(shutdown);

    while !tasks.is_empty() {
        tokio::select! {
            biased;
            _ = &mut shutdown, if !stopping => {
                stopping = true;
                stop_all("shutdown requested");
            }
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok(outcome) => {
                        if let Err(e) = &outcome.result {
                            error!(device_id = %outcome.device_id, error = %e, "Device runner ended with error");
                        }
                        outcomes.push(outcome);
                    }
                    Err(e) => error!(error = %e, "Device runner task failed"),
                }
                if !stopping {
                    stopping = true;
                    stop_all("a device runner ended");
                }
            }
        }
    }

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        warn!(failed, total = outcomes.len(), "Fleet stopped with failures");
    } else {
        info!(total = outcomes.len(), "Fleet stopped");
    }
    outcomes
}
