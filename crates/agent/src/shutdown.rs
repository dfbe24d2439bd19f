//! Process signals that stop the agent
//!
//! The kubelet stops a DaemonSet pod with SIGTERM; SIGINT covers local runs.

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Listener for SIGINT and SIGTERM, installed on creation
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    /// Install the handlers. Must be called inside the tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}
