//! Readiness gate - blocks bridge usage until the worker's ready handshake.
//!
//! `NotStarted -> AwaitingReady -> Ready | Failed`, then `Closed` once the
//! worker is gone. Traversed once per bridge; never re-entered.

use tokio::sync::watch;

use crate::error::{BridgeError, StartupError};
use crate::supervisor::Termination;

/// Observable readiness of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    NotStarted,
    AwaitingReady,
    Ready,
    /// Startup failed; the bridge never became ready.
    Failed(StartupError),
    /// The worker went away after (or instead of) becoming ready.
    Closed(Termination),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
            Self::Closed(_) => "closed",
        }
    }
}

pub(crate) struct ReadinessGate {
    tx: watch::Sender<Readiness>,
}

impl ReadinessGate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(Readiness::NotStarted);
        Self { tx }
    }

    pub(crate) fn current(&self) -> Readiness {
        self.tx.borrow().clone()
    }

    /// `NotStarted -> AwaitingReady`.
    pub(crate) fn begin(&self) -> Result<(), StartupError> {
        let mut refused = None;
        self.tx.send_if_modified(|state| match state {
            Readiness::NotStarted => {
                *state = Readiness::AwaitingReady;
                true
            }
            Readiness::Closed(_) => {
                refused = Some(StartupError::Stopped);
                false
            }
            _ => {
                refused = Some(StartupError::AlreadyStarted);
                false
            }
        });
        refused.map_or(Ok(()), Err)
    }

    /// `AwaitingReady -> Ready`. Returns false for a duplicate or late handshake.
    pub(crate) fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == Readiness::AwaitingReady {
                *state = Readiness::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Startup failure; only applies while not yet ready.
    pub(crate) fn fail(&self, error: StartupError) {
        self.tx.send_if_modified(|state| match state {
            Readiness::NotStarted | Readiness::AwaitingReady => {
                *state = Readiness::Failed(error);
                true
            }
            _ => false,
        });
    }

    /// The worker is gone.
    pub(crate) fn close(&self, cause: &Termination) {
        self.tx.send_if_modified(|state| match state {
            Readiness::AwaitingReady => {
                *state = Readiness::Failed(cause.to_startup_error());
                true
            }
            Readiness::NotStarted | Readiness::Ready => {
                *state = Readiness::Closed(cause.clone());
                true
            }
            Readiness::Failed(_) | Readiness::Closed(_) => false,
        });
    }

    /// Gate for every send operation.
    pub(crate) fn ensure_ready(&self) -> Result<(), BridgeError> {
        match &*self.tx.borrow() {
            Readiness::Ready => Ok(()),
            Readiness::Closed(cause) => Err(cause.to_error()),
            Readiness::NotStarted | Readiness::AwaitingReady | Readiness::Failed(_) => {
                Err(BridgeError::NotReady)
            }
        }
    }

    /// Wait until the gate leaves `AwaitingReady`.
    pub(crate) async fn wait_ready(&self) -> Result<(), StartupError> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, Readiness::NotStarted | Readiness::AwaitingReady))
            .await
            .map_err(|_| StartupError::Stopped)?
            .clone();
        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(e) => Err(e),
            Readiness::Closed(cause) => Err(cause.to_startup_error()),
            Readiness::NotStarted | Readiness::AwaitingReady => Err(StartupError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_are_refused_until_ready() {
        let gate = ReadinessGate::new();
        assert_eq!(gate.ensure_ready(), Err(BridgeError::NotReady));

        gate.begin().unwrap();
        assert_eq!(gate.ensure_ready(), Err(BridgeError::NotReady));

        assert!(gate.mark_ready());
        assert_eq!(gate.ensure_ready(), Ok(()));
    }

    #[test]
    fn handshake_counts_once() {
        let gate = ReadinessGate::new();
        assert!(!gate.mark_ready(), "ready before start is ignored");
        gate.begin().unwrap();
        assert!(gate.mark_ready());
        assert!(!gate.mark_ready());
    }

    #[test]
    fn begin_is_not_reentrant() {
        let gate = ReadinessGate::new();
        gate.begin().unwrap();
        assert_eq!(gate.begin(), Err(StartupError::AlreadyStarted));

        let stopped = ReadinessGate::new();
        stopped.close(&Termination::Stopped);
        assert_eq!(stopped.begin(), Err(StartupError::Stopped));
    }

    #[test]
    fn exit_while_awaiting_ready_fails_startup() {
        let gate = ReadinessGate::new();
        gate.begin().unwrap();
        gate.close(&Termination::Exited { exit_code: Some(1) });

        assert_eq!(
            gate.current(),
            Readiness::Failed(StartupError::Exited { exit_code: Some(1) })
        );
        assert_eq!(gate.ensure_ready(), Err(BridgeError::NotReady));
    }

    #[test]
    fn close_after_ready_reports_termination() {
        let gate = ReadinessGate::new();
        gate.begin().unwrap();
        gate.mark_ready();
        gate.close(&Termination::Stopped);

        assert_eq!(gate.ensure_ready(), Err(BridgeError::EngineStopped));
        assert_eq!(gate.current().as_str(), "closed");
    }

    #[test]
    fn failure_is_sticky() {
        let gate = ReadinessGate::new();
        gate.begin().unwrap();
        gate.fail(StartupError::Timeout(std::time::Duration::from_secs(30)));
        gate.close(&Termination::Stopped);
        assert!(!gate.mark_ready());
        assert!(matches!(gate.current(), Readiness::Failed(StartupError::Timeout(_))));
    }

    #[tokio::test]
    async fn wait_ready_resolves_on_handshake() {
        let gate = std::sync::Arc::new(ReadinessGate::new());
        gate.begin().unwrap();

        let waiter = {
            let gate = std::sync::Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_ready().await })
        };
        tokio::task::yield_now().await;
        gate.mark_ready();

        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
}
