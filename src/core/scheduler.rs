use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::container::Container;
use crate::core::image::{Image, ImageKind};
use crate::runtime::RuntimeError;
use crate::shutdown::ShutdownController;

/// Candidacies queued per election; a lifecycle that cannot submit into this
/// mailbox before the window closes simply misses the round.
const ELECTION_MAILBOX: usize = 16;

#[derive(Debug, Clone, Error)]
pub enum StartError {
    #[error("container launch failed: {0}")]
    Launch(String),
    #[error("server is shutting down")]
    ShuttingDown,
}

/// A container's bid in an election, carrying the counters the placement
/// decision is made on. The decision uses this snapshot even if the
/// container's state changes mid-election.
pub(crate) struct Candidate {
    pub container: Arc<Container>,
    pub concurrent_users: i32,
    #[allow(dead_code)]
    pub total_users: i32,
}

/// Published to container lifecycles while an election is collecting bids.
#[derive(Clone)]
pub(crate) struct OpenElection {
    pub epoch: u64,
    pub candidates: mpsc::Sender<Candidate>,
}

pub(crate) struct ElectionRequest {
    pub candidates: mpsc::Sender<Candidate>,
    /// Resolves when the requester closes the window; also resolves if the
    /// requester is dropped mid-election, so a cancelled requester cannot
    /// leave the election open.
    pub stopped: oneshot::Receiver<()>,
}

/// One coordinator task per image serializes its elections: at most one is
/// open at a time, and each is published to the lifecycles through the watch.
pub(crate) fn spawn_election_coordinator(
    shutdown: &ShutdownController,
) -> (mpsc::Sender<ElectionRequest>, watch::Receiver<Option<OpenElection>>) {
    let (request_tx, mut request_rx) = mpsc::channel::<ElectionRequest>(1);
    let (watch_tx, watch_rx) = watch::channel(None::<OpenElection>);
    let token = shutdown.shutdown_token();

    tokio::spawn(async move {
        let mut epoch = 0u64;
        loop {
            let request = tokio::select! {
                request = request_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = token.cancelled() => break,
            };

            epoch += 1;
            debug!("election {epoch} started");
            watch_tx.send_replace(Some(OpenElection {
                epoch,
                candidates: request.candidates,
            }));

            let mut stopped = request.stopped;
            tokio::select! {
                _ = &mut stopped => {}
                _ = token.cancelled() => {
                    watch_tx.send_replace(None);
                    break;
                }
            }
            debug!("election {epoch} stopped");
            watch_tx.send_replace(None);
        }
    });

    (request_tx, watch_rx)
}

impl Image {
    /// Finds a container with a free spot via an election; launches a new
    /// container when the election draws no candidate.
    pub(crate) async fn acquire_container(self: &Arc<Self>) -> Result<Arc<Container>, StartError> {
        if let Some(winner) = self.run_election().await? {
            return Ok(winner);
        }

        // No candidates: launch, with fixed-backoff retries.
        let scheduling = self.state.scheduling;
        let token = self.state.shutdown.shutdown_token();
        let mut attempts_remaining = scheduling.launch_attempts.max(1);
        loop {
            attempts_remaining -= 1;
            debug!("requesting container creation for image {}", self.name);
            match self.launch_container().await {
                Ok(container) => return Ok(container),
                Err(err) if attempts_remaining > 0 => {
                    warn!(
                        "container creation error for {}: {err}; {attempts_remaining} attempts left",
                        self.name
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(scheduling.launch_retry_delay) => {}
                        _ = token.cancelled() => return Err(StartError::ShuttingDown),
                    }
                }
                Err(err) => {
                    warn!("failed to create container for {}: {err}", self.name);
                    return Err(StartError::Launch(err.to_string()));
                }
            }
        }
    }

    /// Runs one election round and returns the winning container, if any.
    async fn run_election(self: &Arc<Self>) -> Result<Option<Arc<Container>>, StartError> {
        let (candidates_tx, mut candidates_rx) = mpsc::channel(ELECTION_MAILBOX);
        let (stop_tx, stop_rx) = oneshot::channel();
        self.election_tx
            .send(ElectionRequest {
                candidates: candidates_tx,
                stopped: stop_rx,
            })
            .await
            .map_err(|_| StartError::ShuttingDown)?;

        let deadline = Instant::now() + self.state.scheduling.election_window;
        let mut candidates: Vec<Candidate> = Vec::new();
        while let Ok(candidate) = tokio::time::timeout_at(deadline, candidates_rx.recv()).await {
            match candidate {
                Some(candidate) => candidates.push(candidate),
                None => break,
            }
        }
        let _ = stop_tx.send(());

        // Late bids already in the mailbox still joined this election; every
        // submitted candidacy must see exactly one response.
        candidates_rx.close();
        while let Ok(candidate) = candidates_rx.try_recv() {
            candidates.push(candidate);
        }
        debug!("election for {} drew {} candidates", self.name, candidates.len());
        if candidates.is_empty() {
            return Ok(None);
        }

        // Pack users into as few containers as possible: the fullest
        // admissible container wins, ties broken by arrival order.
        let mut best = 0;
        for (n, candidate) in candidates.iter().enumerate() {
            if candidate.concurrent_users > candidates[best].concurrent_users {
                best = n;
            }
        }
        let winner = candidates.swap_remove(best).container;

        if !candidates.is_empty() {
            let job = self.state.shutdown.job();
            let token = self.state.shutdown.shutdown_token();
            tokio::spawn(async move {
                let _job = job;
                for loser in candidates {
                    tokio::select! {
                        _ = loser.container.reject_candidacy() => {}
                        _ = token.cancelled() => break,
                    }
                }
            });
        }
        Ok(Some(winner))
    }

    async fn launch_container(self: &Arc<Self>) -> Result<Arc<Container>, RuntimeError> {
        let runtime = self.state.runtime.clone();
        debug!("creating a container of {}", self.name);

        let mut template = self.template.clone();
        if self.kind == ImageKind::Web {
            if let Some(format) = &self.state.container_url_format {
                template
                    .env
                    .push(format!("ORCA_INTERNAL_CONTAINER_URL={}", format.replace("{}", &self.name)));
            }
        }

        let id = runtime.create_container(&template).await?;

        let post_create: Result<Option<String>, RuntimeError> = async {
            runtime.start_container(&id).await?;
            if self.kind == ImageKind::Web {
                let details = runtime.inspect_container(&id).await?;
                let ip = details.ip_address.ok_or_else(|| {
                    RuntimeError::Api(format!("container {id} has no ip address"))
                })?;
                Ok(Some(format!("http://{}:{}", ip, self.port)))
            } else {
                Ok(None)
            }
        }
        .await;

        match post_create {
            Ok(url) => Ok(Container::spawn(self.clone(), id, url)),
            Err(err) => {
                // The half-launched container must not linger.
                let cleanup = self.state.shutdown.cleanup_token();
                tokio::select! {
                    removed = runtime.remove_container(&id) => {
                        if let Err(remove_err) = removed {
                            warn!("can't remove half-launched container {id}: {remove_err}");
                        }
                    }
                    _ = cleanup.cancelled() => {
                        warn!("removal of half-launched container {id} aborted");
                    }
                }
                Err(err)
            }
        }
    }
}
