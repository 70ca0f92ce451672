use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::image::Image;
use crate::core::scheduler::Candidate;
use crate::core::user::User;
use crate::runtime::{AttachedIo, RuntimeError};

/// The lifecycle counters, published after every change so observers (and the
/// invariant tests) can watch them without touching the owning task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Users currently bound to the container.
    pub concurrent_users: i32,
    /// Outstanding candidacies not yet accepted or rejected.
    pub reserved_users: i32,
    /// Distinct admissions over the container's lifetime; never decreases.
    pub total_users: i32,
}

/// Resolution of one prior candidacy: a user means accepted, `None` means
/// rejected. Acceptance is acknowledged once the counters are updated.
pub(crate) struct CandidacyResponse {
    pub user: Option<Arc<User>>,
    pub ack: Option<oneshot::Sender<()>>,
}

/// A running instance of an `Image`. All state lives in the lifecycle task;
/// this handle only carries identity and the channels into it.
pub struct Container {
    pub runtime_id: String,
    pub image: Arc<Image>,
    /// Reachable address, for web images.
    pub url: Option<String>,

    counters_rx: watch::Receiver<Counters>,
    candidacy_tx: mpsc::Sender<CandidacyResponse>,
    user_left_tx: mpsc::Sender<Arc<User>>,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Container{{id={}}}", &self.runtime_id)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Container {
    /// Wraps a freshly created and started runtime container and spawns its
    /// lifecycle. The launch that created it holds its first reservation.
    pub(crate) fn spawn(image: Arc<Image>, runtime_id: String, url: Option<String>) -> Arc<Self> {
        Self::spawn_with_counters(
            image,
            runtime_id,
            url,
            Counters {
                reserved_users: 1,
                ..Default::default()
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn spawn_seeded(
        image: Arc<Image>,
        runtime_id: String,
        counters: Counters,
    ) -> Arc<Self> {
        Self::spawn_with_counters(image, runtime_id, None, counters)
    }

    fn spawn_with_counters(
        image: Arc<Image>,
        runtime_id: String,
        url: Option<String>,
        counters: Counters,
    ) -> Arc<Self> {
        let (counters_tx, counters_rx) = watch::channel(counters);
        let (candidacy_tx, candidacy_rx) = mpsc::channel(4);
        let (user_left_tx, user_left_rx) = mpsc::channel(4);

        let container = Arc::new(Self {
            runtime_id,
            image,
            url,
            counters_rx,
            candidacy_tx,
            user_left_tx,
        });

        let job = container.image.state.shutdown.job();
        tokio::spawn(run_lifecycle(
            container.clone(),
            counters,
            counters_tx,
            candidacy_rx,
            user_left_rx,
            job,
        ));
        container
    }

    pub fn counters(&self) -> Counters {
        *self.counters_rx.borrow()
    }

    pub fn counters_watch(&self) -> watch::Receiver<Counters> {
        self.counters_rx.clone()
    }

    /// Binds the user this candidacy was accepted for; resolves once the
    /// lifecycle has updated its counters.
    pub(crate) async fn accept_user(&self, user: Arc<User>) -> Result<(), ()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.candidacy_tx
            .send(CandidacyResponse {
                user: Some(user),
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| ())?;
        ack_rx.await.map_err(|_| ())
    }

    /// Releases the reservation of a losing candidacy.
    pub(crate) async fn reject_candidacy(&self) {
        let _ = self
            .candidacy_tx
            .send(CandidacyResponse {
                user: None,
                ack: None,
            })
            .await;
    }

    pub(crate) async fn notify_user_left(&self, user: Arc<User>) {
        let _ = self.user_left_tx.send(user).await;
    }

    pub async fn attach(&self) -> Result<AttachedIo, RuntimeError> {
        self.image.state.runtime.attach(&self.runtime_id).await
    }

    pub async fn resize_tty(&self, height: u16, width: u16) -> Result<(), RuntimeError> {
        self.image
            .state
            .runtime
            .resize_tty(&self.runtime_id, height, width)
            .await
    }
}

/// The owning task: every counter mutation happens here, in response to
/// election signals, candidacy responses, departures, the idle timer and
/// shutdown.
async fn run_lifecycle(
    container: Arc<Container>,
    mut counters: Counters,
    counters_tx: watch::Sender<Counters>,
    mut candidacy_rx: mpsc::Receiver<CandidacyResponse>,
    mut user_left_rx: mpsc::Receiver<Arc<User>>,
    job: crate::shutdown::JobGuard,
) {
    let _job = job;
    let image = container.image.clone();
    let shutdown = image.state.shutdown.shutdown_token();
    let mut election_watch = image.election_watch.clone();
    let mut elections_alive = true;

    let mut users: HashMap<String, Arc<User>> = HashMap::new();
    let mut end_of_life = false;
    let mut idle_deadline: Option<Instant> = None;
    let mut seen_epoch = 0u64;

    debug!("{container}: entering lifecycle management");

    loop {
        end_of_life =
            end_of_life || (image.total_users >= 0 && counters.total_users >= image.total_users);

        if counters.concurrent_users == 0 && counters.reserved_users == 0 {
            if end_of_life || image.state.shutdown.is_shutting_down() {
                break;
            }
            if idle_deadline.is_none() {
                idle_deadline = Some(Instant::now() + image.state.scheduling.idle_deletion);
            }
        } else if counters.concurrent_users != 0 {
            idle_deadline = None;
        }

        tokio::select! {
            changed = election_watch.changed(), if elections_alive => {
                if changed.is_err() {
                    elections_alive = false;
                    continue;
                }
                let open = election_watch.borrow_and_update().clone();
                let Some(open) = open else { continue };
                if open.epoch <= seen_epoch {
                    continue;
                }
                seen_epoch = open.epoch;

                let bound = image.concurrent_users;
                let admissible = !end_of_life
                    && (bound < 0 || counters.reserved_users + counters.concurrent_users < bound);
                if !admissible {
                    continue;
                }
                let bid = Candidate {
                    container: container.clone(),
                    concurrent_users: counters.concurrent_users,
                    total_users: counters.total_users,
                };
                // A full mailbox means this round is missed; no reservation.
                if open.candidates.try_send(bid).is_ok() {
                    debug!("{container}: sent candidacy");
                    counters.reserved_users += 1;
                    counters_tx.send_replace(counters);
                }
            }

            response = candidacy_rx.recv() => {
                let Some(response) = response else { continue };
                counters.reserved_users -= 1;
                if let Some(user) = response.user {
                    counters.concurrent_users += 1;
                    counters.total_users += 1;
                    users.insert(user.id.clone(), user);
                }
                counters_tx.send_replace(counters);
                if let Some(ack) = response.ack {
                    let _ = ack.send(());
                }
            }

            left = user_left_rx.recv() => {
                let Some(user) = left else { continue };
                debug!("{container}: user {} has left", user.id);
                counters.concurrent_users -= 1;
                users.remove(&user.id);
                counters_tx.send_replace(counters);
            }

            _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                if idle_deadline.is_some() =>
            {
                debug!("{container}: idle deletion timer fired");
                end_of_life = true;
                idle_deadline = None;
            }

            _ = shutdown.cancelled() => {
                debug!("{container}: shutdown");
                break;
            }
        }
    }

    // The lifecycle is authoritative about removal: failures are logged,
    // never surfaced.
    debug!("{container}: lifecycle is over, removing");
    let cleanup = image.state.shutdown.cleanup_token();
    tokio::select! {
        removed = image.state.runtime.remove_container(&container.runtime_id) => {
            if let Err(err) = removed {
                warn!("can't remove {container}: {err}");
            }
        }
        _ = cleanup.cancelled() => {
            warn!("removal of {container} aborted by forced shutdown");
        }
    }
}
