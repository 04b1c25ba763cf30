//! Connection signals for a single device runner
//!
//! The runner coordinates its reconnect loop and send loop through three
//! level-triggered signals: `Connected`, `Disconnected` and `Exit`. All three
//! live in one [`tokio::sync::watch`] state holder so a pair of flags can
//! never be observed half-updated, and every wait is cancel-safe: dropping a
//! pending [`ConnectionSignals::wait_first`] future leaves nothing behind.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Link state as last reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Initial state - no usable link to the broker
    Disconnected,
    /// Transport reported a working link
    Connected,
}

/// One of the binary signals a runner task can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Connected,
    Disconnected,
    Exit,
}

/// Snapshot of every signal at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalState {
    pub link: LinkState,
    pub exiting: bool,
}

impl SignalState {
    fn initial() -> Self {
        Self {
            link: LinkState::Disconnected,
            exiting: false,
        }
    }

    /// Whether `signal` is currently raised
    pub fn is_set(&self, signal: Signal) -> bool {
        match signal {
            Signal::Connected => self.link == LinkState::Connected,
            Signal::Disconnected => self.link == LinkState::Disconnected,
            Signal::Exit => self.exiting,
        }
    }
}

/// Shared, cloneable handle to a runner's signals
#[derive(Debug, Clone)]
pub struct ConnectionSignals {
    tx: Arc<watch::Sender<SignalState>>,
}

impl Default for ConnectionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSignals {
    /// Create signals in the initial state: disconnected, not exiting
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalState::initial());
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot of all signals
    pub fn state(&self) -> SignalState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_set(Signal::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().is_set(Signal::Disconnected)
    }

    pub fn is_exiting(&self) -> bool {
        self.state().is_set(Signal::Exit)
    }

    /// Record a link-state report from the transport.
    ///
    /// Returns `true` if the link state actually changed. Duplicate reports
    /// do not wake any waiter.
    pub fn set_link(&self, link: LinkState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.link == link {
                false
            } else {
                state.link = link;
                true
            }
        })
    }

    /// Latch the exit signal. Once set it is never cleared.
    ///
    /// Returns `true` for the call that actually latched it.
    pub fn request_exit(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.exiting {
                false
            } else {
                state.exiting = true;
                true
            }
        })
    }

    /// Suspend until any of `signals` is raised and return which one.
    ///
    /// When several are raised at the same time `Exit` wins, otherwise the
    /// first raised signal in slice order is returned.
    pub async fn wait_first(&self, signals: &[Signal]) -> Signal {
        debug_assert!(!signals.is_empty(), "wait_first needs at least one signal");

        let mut rx = self.tx.subscribe();
        let state = match rx
            .wait_for(|state| signals.iter().any(|signal| state.is_set(*signal)))
            .await
        {
            Ok(state) => *state,
            // The sender lives as long as `self`, so this only happens while
            // tearing down; treat it as an exit request.
            Err(_) => return Signal::Exit,
        };

        if signals.contains(&Signal::Exit) && state.exiting {
            return Signal::Exit;
        }
        signals
            .iter()
            .copied()
            .find(|signal| state.is_set(*signal))
            .unwrap_or(Signal::Exit)
    }

    /// Resolve once exit has been requested
    pub async fn wait_exit(&self) {
        self.wait_first(&[Signal::Exit]).await;
    }

    /// Sleep for `delay` unless exit is requested first.
    ///
    /// Returns `true` if the full delay elapsed, `false` if interrupted.
    pub async fn sleep_or_exit(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.wait_exit() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
