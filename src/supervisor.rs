//! Fatal fault supervision
//!
//! Connections running under the `fatal` error policy report their first
//! unrecoverable fault here. The owner of the [`FaultSupervisor`] decides what
//! happens next; the binary logs the fault and exits with a failure status.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::FatalFault;

/// Receiving side, held by whoever owns the process lifecycle
pub struct FaultSupervisor {
    tx: mpsc::UnboundedSender<FatalFault>,
    rx: mpsc::UnboundedReceiver<FatalFault>,
}

/// Cheap handle given to each connection
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<FatalFault>,
}

impl FaultSupervisor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn reporter(&self) -> FaultReporter {
        FaultReporter {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next fault. Never resolves to `None` while `self` is alive.
    pub async fn next_fault(&mut self) -> Option<FatalFault> {
        self.rx.recv().await
    }

    /// Non-blocking check, mainly for tests.
    pub fn try_next_fault(&mut self) -> Option<FatalFault> {
        self.rx.try_recv().ok()
    }
}

impl Default for FaultSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultReporter {
    pub fn report(&self, fault: FatalFault) {
        if self.tx.send(fault).is_err() {
            debug!("Fault supervisor is gone; fault not delivered");
        }
    }
}
