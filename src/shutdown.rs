use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The four severities of shutdown, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    /// Normal operation.
    Working,
    /// Acceptors should stop taking new connections; running sessions continue.
    Requested,
    /// Running sessions are terminated; cleanup still runs.
    Demanded,
    /// Even cleanup is abandoned.
    Forced,
    /// All registered jobs have drained.
    Done,
}

struct State {
    phase: ShutdownPhase,
    waiter_started: bool,
}

struct Shared {
    state: Mutex<State>,
    request_deadline: Option<Duration>,
    demand_deadline: Option<Duration>,

    // Closed (set to true) on Request.
    request_tx: watch::Sender<bool>,
    // Cancelled on Force; parent of the shutdown token.
    cleanup: CancellationToken,
    // Cancelled on Demand.
    shutdown: CancellationToken,

    jobs: AtomicUsize,
    jobs_drained: Notify,
    done_tx: watch::Sender<bool>,
}

/// Coordinates graceful shutdown across every long-running task in the
/// process. Transitions are monotonic and idempotent: advancing to a phase at
/// or below the current one is a no-op. The first transition out of `Working`
/// starts a waiter that marks the controller `Done` once the job counter
/// drains.
#[derive(Clone)]
pub struct ShutdownController {
    shared: Arc<Shared>,
}

/// RAII job registration: the controller will not report `Done` while any
/// guard is alive.
pub struct JobGuard {
    shared: Arc<Shared>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.shared.jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.jobs_drained.notify_waiters();
        }
    }
}

impl ShutdownController {
    /// `request_deadline` auto-advances Requested -> Demanded after the given
    /// duration; `demand_deadline` likewise Demanded -> Forced.
    pub fn new(request_deadline: Option<Duration>, demand_deadline: Option<Duration>) -> Self {
        let cleanup = CancellationToken::new();
        let shutdown = cleanup.child_token();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    phase: ShutdownPhase::Working,
                    waiter_started: false,
                }),
                request_deadline,
                demand_deadline,
                request_tx: watch::channel(false).0,
                cleanup,
                shutdown,
                jobs: AtomicUsize::new(0),
                jobs_drained: Notify::new(),
                done_tx: watch::channel(false).0,
            }),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.shared.state.lock().unwrap().phase
    }

    /// True while a shutdown is in progress (Requested, Demanded or Forced).
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.phase(),
            ShutdownPhase::Requested | ShutdownPhase::Demanded | ShutdownPhase::Forced
        )
    }

    /// Register a job that must finish before the controller reports `Done`.
    pub fn job(&self) -> JobGuard {
        self.shared.jobs.fetch_add(1, Ordering::AcqRel);
        JobGuard {
            shared: self.shared.clone(),
        }
    }

    /// Cancelled once shutdown is Demanded: in-flight sessions must abort.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Cancelled once shutdown is Forced: even cleanup must abort. Runtime
    /// calls that have to complete during teardown run under this token.
    pub fn cleanup_token(&self) -> CancellationToken {
        self.shared.cleanup.clone()
    }

    /// Resolves once shutdown has been requested (any severity).
    pub async fn requested(&self) {
        let mut rx = self.shared.request_tx.subscribe();
        // Outcome over error: a dropped sender means the controller is gone.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Resolves once every registered job has drained after a shutdown began.
    pub async fn done(&self) {
        let mut rx = self.shared.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn advance(&self, target: ShutdownPhase) {
        let mut state = self.shared.state.lock().unwrap();
        if state.phase >= target {
            return;
        }
        if !state.waiter_started {
            state.waiter_started = true;
            tokio::spawn(self.clone().wait_for_jobs());
        }
        state.phase = target;
        drop(state);

        match target {
            ShutdownPhase::Requested => {
                self.shared.request_tx.send_replace(true);
                if let Some(deadline) = self.shared.request_deadline {
                    let ctrl = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(deadline).await;
                        ctrl.demand();
                    });
                }
            }
            ShutdownPhase::Demanded => {
                self.shared.request_tx.send_replace(true);
                self.shared.shutdown.cancel();
                if let Some(deadline) = self.shared.demand_deadline {
                    let ctrl = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(deadline).await;
                        ctrl.force();
                    });
                }
            }
            ShutdownPhase::Forced => {
                self.shared.request_tx.send_replace(true);
                self.shared.shutdown.cancel();
                self.shared.cleanup.cancel();
            }
            ShutdownPhase::Working | ShutdownPhase::Done => unreachable!(),
        }
    }

    /// Acceptors should deny new connections.
    pub fn request(&self) {
        self.advance(ShutdownPhase::Requested);
    }

    /// Running sessions should terminate; cleanup proceeds.
    pub fn demand(&self) {
        self.advance(ShutdownPhase::Demanded);
    }

    /// Extreme measure: abandon cleanup as well.
    pub fn force(&self) {
        self.advance(ShutdownPhase::Forced);
    }

    async fn wait_for_jobs(self) {
        loop {
            let drained = self.shared.jobs_drained.notified();
            tokio::pin!(drained);
            // Register before checking, or a guard dropped in between would
            // notify nobody.
            drained.as_mut().enable();
            if self.shared.jobs.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
        self.shared.state.lock().unwrap().phase = ShutdownPhase::Done;
        self.shared.done_tx.send_replace(true);
    }

    /// Escalates on each Ctrl-C: request, then demand, then force.
    pub fn install_interrupt_handler(&self) {
        let ctrl = self.clone();
        tokio::spawn(async move {
            let mut presses = 0u32;
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                presses += 1;
                match presses {
                    1 => {
                        ctrl.request();
                        info!("shutdown requested, waiting until every connection is closed");
                        info!("press Ctrl-C again to shut down the server immediately");
                    }
                    2 => {
                        ctrl.demand();
                        info!("shutdown demanded, forcibly shutting down the server");
                        info!("press Ctrl-C again to cancel cleanup procedures");
                    }
                    _ => {
                        ctrl.force();
                        info!("shutdown forced");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_monotonic_and_idempotent() {
        let ctrl = ShutdownController::new(None, None);
        assert_eq!(ctrl.phase(), ShutdownPhase::Working);
        assert!(!ctrl.is_shutting_down());

        ctrl.demand();
        assert_eq!(ctrl.phase(), ShutdownPhase::Demanded);
        assert!(ctrl.is_shutting_down());
        assert!(ctrl.shutdown_token().is_cancelled());
        assert!(!ctrl.cleanup_token().is_cancelled());

        // Requesting after demanding must not regress.
        ctrl.request();
        assert_eq!(ctrl.phase(), ShutdownPhase::Demanded);

        ctrl.force();
        assert!(ctrl.cleanup_token().is_cancelled());
    }

    #[tokio::test]
    async fn done_waits_for_jobs() {
        let ctrl = ShutdownController::new(None, None);
        let job = ctrl.job();
        ctrl.request();

        let waiter = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.done().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(job);
        waiter.await.unwrap();
        assert_eq!(ctrl.phase(), ShutdownPhase::Done);
        assert!(!ctrl.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn request_deadline_escalates_to_demand() {
        let ctrl = ShutdownController::new(Some(Duration::from_secs(10)), None);
        ctrl.request();
        assert_eq!(ctrl.phase(), ShutdownPhase::Requested);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(ctrl.phase(), ShutdownPhase::Demanded);
        assert!(ctrl.shutdown_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn demand_deadline_escalates_to_force() {
        let ctrl = ShutdownController::new(None, Some(Duration::from_secs(5)));
        ctrl.demand();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ctrl.phase(), ShutdownPhase::Forced);
        assert!(ctrl.cleanup_token().is_cancelled());
    }

    #[tokio::test]
    async fn requested_signal_fires_once() {
        let ctrl = ShutdownController::new(None, None);
        let waiter = tokio::spawn({
            let ctrl = ctrl.clone();
            async move { ctrl.requested().await }
        });
        tokio::task::yield_now().await;
        ctrl.request();
        waiter.await.unwrap();
    }
}
