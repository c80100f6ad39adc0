//! Shutdown coordination.
//!
//! Triggers come from termination signals, the inbound stream closing, or a panic
//! anywhere in the process. Teardown runs once no matter how many triggers overlap;
//! a fault seen at any point forces a non-zero exit.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    StreamClosed,
    Fault,
}

impl ShutdownReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Fault => 1,
            Self::Signal(_) | Self::StreamClosed => 0,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::StreamClosed => f.write_str("inbound stream closed"),
            Self::Fault => f.write_str("fault"),
        }
    }
}

struct Inner {
    started: AtomicBool,
    faulted: AtomicBool,
    trigger: watch::Sender<Option<ShutdownReason>>,
}

/// Shared shutdown state. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (trigger, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                started: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
                trigger,
            }),
        }
    }

    /// Request shutdown from outside the main loop. Only the first reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) {
        if reason == ShutdownReason::Fault {
            self.inner.faulted.store(true, Ordering::SeqCst);
        }
        let first = self.inner.trigger.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if !first {
            tracing::debug!(%reason, "Shutdown already requested");
        }
    }

    /// Resolves with the first triggered reason.
    pub fn triggered(&self) -> impl Future<Output = ShutdownReason> + Send + 'static {
        let mut rx = self.inner.trigger.subscribe();
        async move {
            let reason = rx.wait_for(Option::is_some).await.ok().and_then(|r| *r);
            match reason {
                Some(reason) => reason,
                // Sender dropped with the coordinator.
                None => std::future::pending().await,
            }
        }
    }

    /// Flip the shutting-down flag. Returns true for the caller that should run teardown.
    pub fn begin(&self, reason: ShutdownReason) -> bool {
        if reason == ShutdownReason::Fault {
            self.inner.faulted.store(true, Ordering::SeqCst);
        }
        let first = self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            tracing::info!(%reason, "Shutting down");
        } else {
            tracing::debug!(%reason, "Shutdown already in progress");
        }
        first
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.faulted.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self, reason: ShutdownReason) -> u8 {
        if self.is_faulted() { 1 } else { reason.exit_code() }
    }
}

/// Route panics into the coordinator as faults.
pub fn install_panic_hook(coordinator: ShutdownCoordinator) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "Uncaught fault");
        coordinator.trigger(ShutdownReason::Fault);
        previous(info);
    }));
}

/// Resolves on the first SIGTERM or SIGINT.
#[cfg(unix)]
pub fn termination_signal() -> io::Result<impl Future<Output = ShutdownReason> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => ShutdownReason::Signal("SIGTERM"),
            _ = interrupt.recv() => ShutdownReason::Signal("SIGINT"),
        }
    })
}

#[cfg(not(unix))]
pub fn termination_signal() -> io::Result<impl Future<Output = ShutdownReason> + Send + 'static> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownReason::Signal("ctrl-c"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending().await
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exit_codes() {
        assert_eq!(ShutdownReason::Signal("SIGTERM").exit_code(), 0);
        assert_eq!(ShutdownReason::StreamClosed.exit_code(), 0);
        assert_eq!(ShutdownReason::Fault.exit_code(), 1);
    }

    #[test]
    fn begin_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());
        assert!(coordinator.begin(ShutdownReason::Signal("SIGTERM")));
        assert!(!coordinator.begin(ShutdownReason::StreamClosed));
        assert!(coordinator.is_shutting_down());
        assert_eq!(coordinator.exit_code(ShutdownReason::Signal("SIGTERM")), 0);
    }

    #[test]
    fn fault_during_shutdown_forces_failure() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.begin(ShutdownReason::Signal("SIGTERM")));
        assert!(!coordinator.begin(ShutdownReason::Fault));
        assert!(coordinator.is_faulted());
        assert_eq!(coordinator.exit_code(ShutdownReason::Signal("SIGTERM")), 1);
    }

    #[tokio::test]
    async fn triggered_resolves_with_first_reason() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.triggered();

        coordinator.trigger(ShutdownReason::StreamClosed);
        coordinator.trigger(ShutdownReason::Fault);

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::StreamClosed);
        assert!(coordinator.is_faulted());
    }

    #[tokio::test]
    async fn triggered_after_the_fact() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger(ShutdownReason::Signal("SIGINT"));
        let reason = tokio::time::timeout(Duration::from_secs(1), coordinator.triggered())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Signal("SIGINT"));
    }

    #[test]
    fn reasons_display() {
        assert_eq!(ShutdownReason::Signal("SIGTERM").to_string(), "signal SIGTERM");
        assert_eq!(ShutdownReason::StreamClosed.to_string(), "inbound stream closed");
    }
}
