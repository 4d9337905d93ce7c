//! Graceful shutdown utilities, shared by every long-running binary.
//!
//! Adapted from the teacher's `shutdown` module: a broadcast-backed token
//! that every consumer loop, the sampling loop, and the scheduler tick poll
//! at their suspension points so a SIGINT/SIGTERM drains in-flight work
//! instead of dropping it.

use std::time::Duration;

use tokio::sync::watch;

/// Why shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Manual,
}

/// A cheaply-cloneable handle every loop polls for cancellation.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|v| *v).await;
    }
}

/// Process-wide shutdown coordinator. One instance is built at boot; every
/// long-running task is handed a `ShutdownToken` cloned from it.
pub struct GracefulShutdown {
    sender: watch::Sender<bool>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn request(&self, _signal: ShutdownSignal) {
        let _ = self.sender.send(true);
    }

    /// Wait for SIGINT/SIGTERM and request shutdown.
    #[cfg(unix)]
    pub async fn wait_for_os_signal(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => self.request(ShutdownSignal::Interrupt),
            _ = sigterm.recv() => self.request(ShutdownSignal::Terminate),
        }
    }

    #[cfg(not(unix))]
    pub async fn wait_for_os_signal(&self) {
        let _ = tokio::signal::ctrl_c().await;
        self.request(ShutdownSignal::Interrupt);
    }

    /// Block until shutdown has been requested, with a maximum drain
    /// period afterward for callers that want a hard cutoff.
    pub async fn wait_then_drain(&self, drain_timeout: Duration) {
        let mut token = self.token();
        token.cancelled().await;
        tokio::time::sleep(drain_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_resolves_after_request() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.token();
        assert!(!token.is_shutdown());

        shutdown.request(ShutdownSignal::Manual);
        token.cancelled().await;
        assert!(token.is_shutdown());
    }

    #[tokio::test]
    async fn multiple_tokens_all_observe_the_same_request() {
        let shutdown = GracefulShutdown::new();
        let mut t1 = shutdown.token();
        let mut t2 = shutdown.token();
        shutdown.request(ShutdownSignal::Interrupt);
        t1.cancelled().await;
        t2.cancelled().await;
        assert!(t1.is_shutdown() && t2.is_shutdown());
    }
}
