use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::core::container::Container;
use crate::core::image::Image;
use crate::core::scheduler::StartError;
use crate::core::user::User;

/// Session state as seen through a ContainerUser. Monotone: once a terminal
/// state is reached it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the scheduler to produce a container.
    Starting,
    /// Bound to a working container.
    Working,
    /// The scheduler gave up launching a container.
    StartErr,
    /// The container exited cleanly.
    Shutdown,
    /// The inactivity timer fired.
    ShutdownInactivity,
    /// The total-session timer fired.
    ShutdownSessionLen,
    /// Waiting on the container failed.
    ShutdownWithErr,
    /// The container exited with a runtime-reported error.
    ShutdownWithErrMsg,
    /// The instance ended without a session outcome (process shutdown, or
    /// abandoned before binding).
    Dead,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Starting | SessionState::Working)
    }
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    /// The container's exit code, for Shutdown / ShutdownWithErrMsg.
    pub exit_code: i64,
    pub message: Option<String>,
}

impl SessionStatus {
    fn starting() -> Self {
        Self {
            state: SessionState::Starting,
            exit_code: 0,
            message: None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.state)?;
        if let Some(message) = &self.message {
            write!(f, " ({message})")?;
        }
        if self.state == SessionState::Shutdown {
            write!(f, " exit code {}", self.exit_code)?;
        }
        Ok(())
    }
}

enum Command {
    GetContainer(oneshot::Sender<(Option<Arc<Container>>, SessionStatus)>),
    ConnectionClosed,
    NoMoreConnections,
}

struct Shared {
    instance: u64,
    user: Arc<User>,
    cmd_tx: mpsc::Sender<Command>,
    activity_tx: mpsc::Sender<()>,
    status_rx: watch::Receiver<SessionStatus>,
}

/// Bridges one user to one container across reconnects. One owning task per
/// instance drives all state; a dead instance never blocks its callers.
#[derive(Clone)]
pub struct ContainerUser {
    shared: Arc<Shared>,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl ContainerUser {
    pub(crate) fn spawn(image: Arc<Image>, user: Arc<User>) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        // Size-1 and lossy: activity must never block I/O.
        let (activity_tx, activity_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(SessionStatus::starting());

        debug!("created ContainerUser {instance} for {} on {}", user, image);
        let job = image.state.shutdown.job();
        tokio::spawn(run(
            image,
            user.clone(),
            instance,
            cmd_rx,
            activity_rx,
            status_tx,
            job,
        ));

        Self {
            shared: Arc::new(Shared {
                instance,
                user,
                cmd_tx,
                activity_tx,
                status_rx,
            }),
        }
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.shared.instance
    }

    pub fn user(&self) -> &Arc<User> {
        &self.shared.user
    }

    /// Marks the user active, resetting the inactivity timer. Never blocks.
    pub fn activity(&self) {
        let _ = self.shared.activity_tx.try_send(());
    }

    /// A handle the byte pump can clone to mark activity as data flows.
    pub fn activity_sender(&self) -> mpsc::Sender<()> {
        self.shared.activity_tx.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status_rx.borrow().clone()
    }

    /// False once the instance is terminal or its task is gone; such an
    /// instance is replaced on the next request.
    pub fn is_alive(&self) -> bool {
        !self.status().state.is_terminal() && !self.shared.cmd_tx.is_closed()
    }

    /// Blocks until a working container is available (counting a connection)
    /// or a terminal status is known.
    pub async fn get_container(&self) -> (Option<Arc<Container>>, SessionStatus) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .cmd_tx
            .send(Command::GetContainer(reply_tx))
            .await
            .is_ok()
        {
            if let Ok(reply) = reply_rx.await {
                return reply;
            }
        }
        (None, self.status())
    }

    /// Strictly once per successful `get_container`.
    pub async fn notify_connection_closed(&self) {
        let _ = self.shared.cmd_tx.send(Command::ConnectionClosed).await;
    }

    /// After this the instance is guaranteed to be handed out to no new
    /// connections. Called on the replaced instance when the image table
    /// swaps it out.
    pub(crate) fn no_more_connections(&self) {
        let _ = self.shared.cmd_tx.try_send(Command::NoMoreConnections);
    }

    /// Resolves with the terminal status.
    pub async fn shutdown_done(&self) -> SessionStatus {
        let mut status_rx = self.shared.status_rx.clone();
        let result = match status_rx.wait_for(|status| status.state.is_terminal()).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        result
    }
}

/// What the starting phase resolved to.
enum Acquired {
    Bound(Arc<Container>),
    /// The scheduler reported failure; nothing is reserved for us.
    FailedStart,
    /// The phase ended (timer, shutdown, drain) with the acquisition still
    /// in flight.
    Abandoned,
}

struct Actor {
    image: Arc<Image>,
    user: Arc<User>,
    instance: u64,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    connection_count: i64,
    no_more_connections: bool,
    pending_gets: Vec<oneshot::Sender<(Option<Arc<Container>>, SessionStatus)>>,
    session_deadline: Instant,
    inactive_deadline: Instant,
}

impl Actor {
    fn set_state(&mut self, state: SessionState) {
        self.status.state = state;
        self.status_tx.send_replace(self.status.clone());
    }

    fn reset_inactivity(&mut self) {
        self.inactive_deadline = Instant::now() + self.image.timeouts.inactive;
    }

    /// Waits for the scheduler while already honoring timers, commands and
    /// shutdown.
    async fn starting(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        activity_rx: &mut mpsc::Receiver<()>,
        acquire_rx: &mut oneshot::Receiver<Result<Arc<Container>, StartError>>,
    ) -> Acquired {
        let shutdown = self.image.state.shutdown.shutdown_token();
        let mut cmd_open = true;
        let mut activity_open = true;
        loop {
            tokio::select! {
                acquired = &mut *acquire_rx => {
                    match acquired {
                        Ok(Ok(container)) => return Acquired::Bound(container),
                        Ok(Err(err)) => {
                            self.status.message = Some(err.to_string());
                            self.set_state(SessionState::StartErr);
                        }
                        Err(_) => self.set_state(SessionState::Dead),
                    }
                    return Acquired::FailedStart;
                }
                cmd = cmd_rx.recv(), if cmd_open => {
                    if cmd.is_none() {
                        cmd_open = false;
                    }
                    match cmd {
                        Some(Command::GetContainer(reply)) => self.pending_gets.push(reply),
                        Some(Command::ConnectionClosed) => self.connection_count -= 1,
                        Some(Command::NoMoreConnections) | None => {
                            self.no_more_connections = true;
                            if self.connection_count <= 0 {
                                self.set_state(SessionState::Dead);
                                return Acquired::Abandoned;
                            }
                        }
                    }
                }
                activity = activity_rx.recv(), if activity_open => match activity {
                    Some(()) => self.reset_inactivity(),
                    None => activity_open = false,
                },
                _ = tokio::time::sleep_until(self.session_deadline) => {
                    self.status.message = Some("total timeout expired".to_string());
                    self.set_state(SessionState::ShutdownSessionLen);
                    return Acquired::Abandoned;
                }
                _ = tokio::time::sleep_until(self.inactive_deadline) => {
                    self.status.message = Some("inactivity timeout expired".to_string());
                    self.set_state(SessionState::ShutdownInactivity);
                    return Acquired::Abandoned;
                }
                _ = shutdown.cancelled() => {
                    self.set_state(SessionState::Dead);
                    return Acquired::Abandoned;
                }
            }
        }
    }

    /// Serves connections against a bound container until a timer fires, the
    /// container exits, or the instance is drained.
    async fn working(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<Command>,
        activity_rx: &mut mpsc::Receiver<()>,
        container: &Arc<Container>,
    ) {
        let shutdown = self.image.state.shutdown.shutdown_token();

        // Forward the runtime's exit notification into the loop.
        let (exit_tx, mut exit_rx) = oneshot::channel();
        {
            let runtime = self.image.state.runtime.clone();
            let id = container.runtime_id.clone();
            let job = self.image.state.shutdown.job();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let _job = job;
                tokio::select! {
                    result = runtime.wait(&id) => {
                        let _ = exit_tx.send(result);
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        self.set_state(SessionState::Working);
        for reply in self.pending_gets.drain(..) {
            if reply
                .send((Some(container.clone()), self.status.clone()))
                .is_ok()
            {
                self.connection_count += 1;
            }
        }

        let mut cmd_open = true;
        let mut activity_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if cmd_open => {
                    if cmd.is_none() {
                        cmd_open = false;
                    }
                    match cmd {
                        Some(Command::GetContainer(reply)) => {
                            if reply
                                .send((Some(container.clone()), self.status.clone()))
                                .is_ok()
                            {
                                self.connection_count += 1;
                            }
                        }
                        Some(Command::ConnectionClosed) => {
                            self.connection_count -= 1;
                            if self.connection_count <= 0 && self.no_more_connections {
                                self.set_state(SessionState::Dead);
                                return;
                            }
                        }
                        Some(Command::NoMoreConnections) | None => {
                            self.no_more_connections = true;
                            if self.connection_count <= 0 {
                                self.set_state(SessionState::Dead);
                                return;
                            }
                        }
                    }
                }
                exit = &mut exit_rx => {
                    match exit {
                        Ok(Ok(exit)) => {
                            self.status.exit_code = exit.exit_code;
                            match exit.error_message {
                                Some(message) => {
                                    self.status.message = Some(message);
                                    self.set_state(SessionState::ShutdownWithErrMsg);
                                }
                                None => self.set_state(SessionState::Shutdown),
                            }
                        }
                        Ok(Err(err)) => {
                            self.status.message = Some(err.to_string());
                            self.set_state(SessionState::ShutdownWithErr);
                        }
                        Err(_) => {
                            self.status.message = Some("container wait interrupted".to_string());
                            self.set_state(SessionState::ShutdownWithErr);
                        }
                    }
                    return;
                }
                activity = activity_rx.recv(), if activity_open => match activity {
                    Some(()) => {
                        debug!("reset inactivity timeout for ContainerUser {}", self.instance);
                        self.reset_inactivity();
                    }
                    None => activity_open = false,
                },
                _ = tokio::time::sleep_until(self.session_deadline) => {
                    self.status.message = Some("total timeout expired".to_string());
                    self.set_state(SessionState::ShutdownSessionLen);
                    return;
                }
                _ = tokio::time::sleep_until(self.inactive_deadline) => {
                    self.status.message = Some("inactivity timeout expired".to_string());
                    self.set_state(SessionState::ShutdownInactivity);
                    return;
                }
                _ = shutdown.cancelled() => {
                    self.set_state(SessionState::Dead);
                    return;
                }
            }
        }
    }
}

async fn run(
    image: Arc<Image>,
    user: Arc<User>,
    instance: u64,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut activity_rx: mpsc::Receiver<()>,
    status_tx: watch::Sender<SessionStatus>,
    job: crate::shutdown::JobGuard,
) {
    let _job = job;
    let shutdown = image.state.shutdown.shutdown_token();

    // Kick off container acquisition as its own tracked job.
    let (acquire_tx, mut acquire_rx) = oneshot::channel();
    {
        let image = image.clone();
        let job = image.state.shutdown.job();
        tokio::spawn(async move {
            let _job = job;
            let _ = acquire_tx.send(image.acquire_container().await);
        });
    }

    let now = Instant::now();
    let mut actor = Actor {
        image: image.clone(),
        user: user.clone(),
        instance,
        status: SessionStatus::starting(),
        status_tx,
        connection_count: 0,
        no_more_connections: !image.persist_between_reconnects,
        pending_gets: Vec::new(),
        session_deadline: now + image.timeouts.total,
        inactive_deadline: now + image.timeouts.inactive,
    };

    let mut bound = None;
    match actor
        .starting(&mut cmd_rx, &mut activity_rx, &mut acquire_rx)
        .await
    {
        Acquired::Bound(container) => {
            // Confirm the binding before anything observes Working; the
            // lifecycle acks once its counters reflect this user.
            let confirmed = tokio::select! {
                confirmed = container.accept_user(user.clone()) => confirmed.is_ok(),
                _ = shutdown.cancelled() => false,
            };
            if confirmed {
                bound = Some(container.clone());
                actor.working(&mut cmd_rx, &mut activity_rx, &container).await;
            } else if shutdown.is_cancelled() {
                actor.set_state(SessionState::Dead);
            } else {
                actor.status.message = Some("container ended during startup".to_string());
                actor.set_state(SessionState::StartErr);
            }
        }
        Acquired::FailedStart => {}
        Acquired::Abandoned => {
            // The acquisition is still in flight; whatever container it
            // produces holds a reservation for us that must be released.
            let job = image.state.shutdown.job();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let _job = job;
                tokio::select! {
                    acquired = acquire_rx => {
                        if let Ok(Ok(container)) = acquired {
                            container.reject_candidacy().await;
                        }
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
    }

    debug!(
        "ContainerUser {instance} for {} finished: {}",
        actor.user, actor.status
    );

    // Drain: anyone still waiting learns the terminal status.
    let status = actor.status.clone();
    for reply in actor.pending_gets.drain(..) {
        let _ = reply.send((None, status.clone()));
    }

    if let Some(container) = bound {
        tokio::select! {
            _ = container.notify_user_left(user.clone()) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    image.deregister_container_user(&user.id, instance);
}
