//! Shutdown coordination for the servers and their background tasks.
//!
//! A [`Shutdown`] owns a watch channel; every accept loop and periodic task
//! holds a [`ShutdownSignal`] and stops once it fires. Connection handlers
//! are then joined for a bounded time and detached if they do not finish.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// How long in-flight work is waited for once shutdown starts
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Sending side of the shutdown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A receiver for tasks that must stop on shutdown
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Initiating shutdown");
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown signal
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown was triggered (or its sender dropped)
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Join every task in `tasks` for at most `grace`, then detach the rest.
///
/// Returns the number of tasks left running.
pub async fn join_bounded(tasks: &mut JoinSet<()>, grace: Duration, what: &str) -> usize {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            () = &mut deadline => break,
        }
    }
    let remaining = tasks.len();
    if remaining > 0 {
        warn!("{} {} still running after {:?}, detaching", remaining, what, grace);
        tasks.detach_all();
    }
    remaining
}
