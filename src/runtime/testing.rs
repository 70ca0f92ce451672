//! Scriptable in-memory runtime backing the concurrency tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::watch;

use super::{
    AttachedIo, ContainerDetails, ContainerExit, ContainerRuntime, ContainerTemplate, RuntimeError,
    RuntimeImage,
};

struct MockContainer {
    exit_tx: watch::Sender<Option<ContainerExit>>,
    peer: Option<DuplexStream>,
    started: bool,
    removed: bool,
}

#[derive(Default)]
struct MockState {
    images: Vec<RuntimeImage>,
    containers: HashMap<String, MockContainer>,
    create_calls: u32,
    fail_creates: u32,
    fail_listing: bool,
    next_id: u32,
    removed: Vec<String>,
    resizes: Vec<(String, u16, u16)>,
    inspect_ip: Option<String>,
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn set_images(&self, images: Vec<RuntimeImage>) {
        self.state.lock().unwrap().images = images;
    }

    /// The next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().fail_creates = n;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    /// Overrides the address inspect reports for every container.
    pub fn set_inspect_ip(&self, ip: &str) {
        self.state.lock().unwrap().inspect_ip = Some(ip.to_string());
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn created_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state.containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.state.lock().unwrap().removed.iter().any(|r| r == id)
    }

    pub fn is_started(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .is_some_and(|c| c.started)
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.state.lock().unwrap().resizes.clone()
    }

    /// Resolves the container's wait with the given exit.
    pub fn exit(&self, id: &str, exit_code: i64, error_message: Option<&str>) {
        let state = self.state.lock().unwrap();
        if let Some(container) = state.containers.get(id) {
            container.exit_tx.send_replace(Some(ContainerExit {
                exit_code,
                error_message: error_message.map(str::to_string),
            }));
        }
    }

    /// Registers a container that was not created through this runtime, so
    /// wait/inspect/remove behave for pre-seeded test containers.
    pub fn register_container(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            id.to_string(),
            MockContainer {
                exit_tx: watch::channel(None).0,
                peer: None,
                started: true,
                removed: false,
            },
        );
    }

    /// The container-side end of the attach stream, available once per
    /// container.
    pub fn take_peer(&self, id: &str) -> Option<DuplexStream> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get_mut(id)
            .and_then(|c| c.peer.take())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_labeled_images(&self) -> Result<Vec<RuntimeImage>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(RuntimeError::Api("listing failed".to_string()));
        }
        Ok(state.images.clone())
    }

    async fn create_container(&self, _template: &ContainerTemplate) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(RuntimeError::Api("create failed".to_string()));
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                exit_tx: watch::channel(None).0,
                peer: None,
                started: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.started = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        if let Some(ip) = &state.inspect_ip {
            return Ok(ContainerDetails {
                ip_address: Some(ip.clone()),
            });
        }
        let n = id.trim_start_matches("ctr-");
        Ok(ContainerDetails {
            ip_address: Some(format!("10.0.0.{n}")),
        })
    }

    async fn attach(&self, id: &str) -> Result<AttachedIo, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        container.peer = Some(theirs);
        let (reader, writer) = tokio::io::split(ours);
        Ok(AttachedIo {
            writer: Box::new(writer),
            reader: Box::new(reader),
        })
    }

    async fn resize_tty(&self, id: &str, height: u16, width: u16) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        state.resizes.push((id.to_string(), height, width));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<ContainerExit, RuntimeError> {
        let mut exit_rx = {
            let state = self.state.lock().unwrap();
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            container.exit_tx.subscribe()
        };
        let exit = exit_rx
            .wait_for(|exit| exit.is_some())
            .await
            .map_err(|_| RuntimeError::Api("wait interrupted".to_string()))?;
        Ok(exit.clone().unwrap())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !container.removed {
            container.removed = true;
            // A forced remove kills a still-running container.
            if container.exit_tx.borrow().is_none() {
                container.exit_tx.send_replace(Some(ContainerExit {
                    exit_code: 137,
                    error_message: None,
                }));
            }
            state.removed.push(id.to_string());
        }
        Ok(())
    }
}

/// A labeled image as the discovery listing would return it.
pub fn labeled_image(id: &str, repo_tags: &[&str], labels: &[(&str, &str)]) -> RuntimeImage {
    let labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    RuntimeImage::new(id, repo_tags.iter().map(|t| t.to_string()).collect(), labels)
}
