// src/engine/terminate.rs

//! Cooperative termination.
//!
//! Operator interrupts and internal faults never touch workflow state
//! directly. They set a flag on a `watch` channel which the runner checks at
//! the start of each iteration and between submission and polling. A fault
//! left by one run is cleared when the next run starts.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Operator cancel (Ctrl-C or an explicit request).
    Operator,
    /// The orchestrator itself cannot continue.
    Fault,
}

/// Sending half; cheap to clone.
#[derive(Debug, Clone)]
pub struct Terminator {
    tx: Arc<watch::Sender<Option<TerminationReason>>>,
}

/// Receiving half held by the runner.
#[derive(Debug, Clone)]
pub struct TerminationListener {
    rx: watch::Receiver<Option<TerminationReason>>,
}

pub fn termination_channel() -> (Terminator, TerminationListener) {
    let (tx, rx) = watch::channel(None);
    (Terminator { tx: Arc::new(tx) }, TerminationListener { rx })
}

impl Terminator {
    /// Request termination. The first reason sticks.
    pub fn terminate(&self, reason: TerminationReason) {
        let changed = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if changed {
            info!(?reason, "termination requested");
        }
    }

    /// Forget a fault left by an earlier run so the next one can start.
    /// Operator requests stay in place.
    pub fn clear_fault(&self) {
        self.tx.send_if_modified(|current| {
            if *current == Some(TerminationReason::Fault) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    pub fn listener(&self) -> TerminationListener {
        TerminationListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl TerminationListener {
    pub fn requested(&self) -> Option<TerminationReason> {
        *self.rx.borrow()
    }

    /// Resolve once termination is requested. Never resolves if every
    /// [`Terminator`] is dropped first.
    pub async fn wait(&mut self) -> TerminationReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Forward Ctrl-C to `terminator` as an operator request.
pub fn spawn_ctrl_c(terminator: Terminator) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C; terminating workflow");
                terminator.terminate(TerminationReason::Operator);
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_reason_sticks() {
        let (term, mut listener) = termination_channel();
        assert_eq!(listener.requested(), None);
        term.terminate(TerminationReason::Operator);
        term.terminate(TerminationReason::Fault);
        assert_eq!(listener.wait().await, TerminationReason::Operator);
        assert_eq!(term.listener().requested(), Some(TerminationReason::Operator));
    }

    #[test]
    fn only_faults_are_cleared() {
        let (term, listener) = termination_channel();
        term.terminate(TerminationReason::Fault);
        term.clear_fault();
        assert_eq!(listener.requested(), None);

        term.terminate(TerminationReason::Operator);
        term.clear_fault();
        assert_eq!(listener.requested(), Some(TerminationReason::Operator));
    }
}
