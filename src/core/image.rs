use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::core::container_user::ContainerUser;
use crate::core::scheduler::{self, ElectionRequest, OpenElection};
use crate::core::user::User;
use crate::core::CoreState;
use crate::runtime::{normalize, ContainerTemplate, RuntimeImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Web,
    Ssh,
    /// Reserved; parses but is rejected as unimplemented.
    Tcp,
}

impl ImageKind {
    pub const ALL: [ImageKind; 3] = [ImageKind::Web, ImageKind::Ssh, ImageKind::Tcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Web => "web",
            ImageKind::Ssh => "ssh",
            ImageKind::Tcp => "tcp",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Cap on the whole session, regardless of activity.
    pub total: Duration,
    /// Cap on the gap between two activity marks.
    pub inactive: Duration,
}

#[derive(Debug, Error)]
pub enum ImageParseError {
    #[error("can't find the name")]
    MissingName,
    #[error("can't find the kind")]
    MissingKind,
    #[error("unknown image kind {0:?}")]
    UnknownKind(String),
    #[error("image kind {0:?} is not implemented")]
    UnimplementedKind(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("unknown connection method {0:?}")]
    UnknownConnectionMethod(String),
    #[error("connection method {0:?} is not implemented")]
    UnimplementedConnectionMethod(String),
}

/// A workload template discovered from a labeled runtime image, together with
/// its scheduling state: the election channels and the live ContainerUser
/// table.
pub struct Image {
    pub(crate) state: Arc<CoreState>,
    pub runtime_id: String,
    pub kind: ImageKind,
    pub name: String,
    /// Container-side port (web kind).
    pub port: u16,
    /// Max live users per container; -1 = unbounded.
    pub concurrent_users: i32,
    /// Max lifetime distinct users per container; -1 = unbounded.
    pub total_users: i32,
    pub persist_between_reconnects: bool,
    pub timeouts: Timeouts,
    pub(crate) template: ContainerTemplate,

    pub(crate) election_tx: mpsc::Sender<ElectionRequest>,
    pub(crate) election_watch: watch::Receiver<Option<OpenElection>>,

    container_users: Mutex<HashMap<String, ContainerUser>>,
    removed: AtomicBool,
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image{{name={:?}, kind={}}}", self.name, self.kind)
    }
}

impl Image {
    /// Parses a discovered runtime image into an `Image` and starts its
    /// election coordinator.
    pub fn new(state: Arc<CoreState>, img: &RuntimeImage) -> Result<Arc<Self>, ImageParseError> {
        let name = img
            .label("orca.name")
            .or_else(|| {
                img.repo_tags
                    .first()
                    .and_then(|tag| tag.split(':').next())
                    .map(normalize)
            })
            .ok_or(ImageParseError::MissingName)?;

        let kind_raw = img.label("orca.kind").ok_or(ImageParseError::MissingKind)?;
        let kind = match kind_raw.as_str() {
            "web" => ImageKind::Web,
            "ssh" => ImageKind::Ssh,
            "tcp" => return Err(ImageParseError::UnimplementedKind(kind_raw)),
            _ => return Err(ImageParseError::UnknownKind(kind_raw)),
        };
        info!("found image {} of kind {}", name, kind);

        let mut template = ContainerTemplate {
            image: img.id.clone(),
            ..Default::default()
        };

        let mut port = 0;
        let concurrent_users;
        let total_users;
        let persist_between_reconnects;
        match kind {
            ImageKind::Web => {
                persist_between_reconnects =
                    img.label_bool_or("orca.container.persistBetweenReconnects", true);
                concurrent_users = img.label_i32_or("orca.users.concurrent", -1);
                total_users = img.label_i32_or("orca.users.total", -1);
                let port_raw = img.label_or("orca.port", "80");
                port = port_raw
                    .parse()
                    .map_err(|_| ImageParseError::InvalidPort(port_raw))?;
                template.exposed_port = Some(port);
            }
            ImageKind::Ssh => {
                persist_between_reconnects =
                    img.label_bool_or("orca.container.persistBetweenReconnects", false);
                concurrent_users = img.label_i32_or("orca.users.concurrent", 1);
                total_users = img.label_i32_or("orca.users.total", 1);

                let method = img.label_or("orca.connection.method", "attach");
                match method.as_str() {
                    "attach" => {
                        template.attach_stdin = true;
                        template.attach_stdout = true;
                        template.attach_stderr = true;
                        template.open_stdin = true;
                        template.tty = img.label_bool_or("orca.container.tty", true);
                        template.network_disabled =
                            img.label_bool_or("orca.container.networkdisabled", true);
                        template.stdin_once = total_users == 1;
                    }
                    "connect" | "exec" => {
                        return Err(ImageParseError::UnimplementedConnectionMethod(method))
                    }
                    _ => return Err(ImageParseError::UnknownConnectionMethod(method)),
                }
            }
            ImageKind::Tcp => unreachable!(),
        }

        let timeouts = Timeouts {
            total: img.label_duration_or("orca.timeout.session", Duration::from_secs(24 * 3600)),
            inactive: img.label_duration_or("orca.timeout.inactive", Duration::from_secs(15 * 60)),
        };
        template.stop_signal = img.label("orca.container.stopsignal");
        template.labels = HashMap::from([
            ("orca.internal.managed".to_string(), "true".to_string()),
            ("orca.internal.imagename".to_string(), name.clone()),
        ]);

        let (election_tx, election_watch) = scheduler::spawn_election_coordinator(&state.shutdown);

        Ok(Arc::new(Self {
            state,
            runtime_id: img.id.clone(),
            kind,
            name,
            port,
            concurrent_users,
            total_users,
            persist_between_reconnects,
            timeouts,
            template,
            election_tx,
            election_watch,
            container_users: Mutex::new(HashMap::new()),
            removed: AtomicBool::new(false),
        }))
    }

    /// Visibility hook; currently every image is visible to every user.
    pub fn is_visible_to(&self, _user: &User) -> bool {
        true
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// The live ContainerUser for this user, creating one if the previous
    /// instance is gone or terminal. The replaced instance is told it will
    /// receive no further connections.
    pub fn container_user_for(self: &Arc<Self>, user: &Arc<User>) -> ContainerUser {
        let replaced;
        let fresh;
        {
            let mut table = self.container_users.lock().unwrap();
            if let Some(existing) = table.get(&user.id) {
                if existing.is_alive() {
                    debug!("reusing existing ContainerUser for {}", user);
                    return existing.clone();
                }
            }
            fresh = ContainerUser::spawn(self.clone(), user.clone());
            replaced = table.insert(user.id.clone(), fresh.clone());
        }
        if let Some(old) = replaced {
            old.no_more_connections();
        }
        fresh
    }

    /// Called by a ContainerUser when it goes terminal; only deletes the
    /// entry if it is still the registered instance.
    pub(crate) fn deregister_container_user(&self, user_id: &str, instance: u64) {
        let removed = {
            let mut table = self.container_users.lock().unwrap();
            match table.get(user_id) {
                Some(current) if current.instance_id() == instance => table.remove(user_id),
                _ => None,
            }
        };
        if let Some(old) = removed {
            old.no_more_connections();
        }
    }
}
