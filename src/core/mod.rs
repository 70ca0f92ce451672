//! The container lifecycle and multiplexing engine: per-image election
//! scheduling, per-container lifecycle tasks, and the per-(user, image)
//! bridges that span reconnects.

pub mod container;
pub mod container_user;
pub mod image;
pub mod registry;
pub mod scheduler;
pub mod user;


pub use container::{Container, Counters};
pub use container_user::{ContainerUser, SessionState, SessionStatus};
pub use image::{Image, ImageKind, Timeouts};
pub use registry::{ImageLookupError, ImageRegistry};
pub use scheduler::StartError;
pub use user::{AuthError, User, UserRegistry};

use std::sync::Arc;

use crate::config::SchedulingConfig;
use crate::runtime::ContainerRuntime;
use crate::shutdown::ShutdownController;

/// Shared dependencies every Image, Container and ContainerUser hangs off.
pub struct CoreState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub shutdown: ShutdownController,
    pub scheduling: SchedulingConfig,
    /// Format for the ORCA_INTERNAL_CONTAINER_URL env var given to web
    /// containers.
    pub container_url_format: Option<String>,
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<CoreState> {
    test_state_with(Arc::new(crate::runtime::testing::MockRuntime::default()))
}

#[cfg(test)]
pub(crate) fn test_state_with(runtime: Arc<dyn ContainerRuntime>) -> Arc<CoreState> {
    Arc::new(CoreState {
        runtime,
        shutdown: ShutdownController::new(None, None),
        scheduling: SchedulingConfig::default(),
        container_url_format: None,
    })
}
