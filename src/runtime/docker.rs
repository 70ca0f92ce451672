use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, ListContainersOptions, LogOutput, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::ListImagesOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use super::{
    AttachedIo, ContainerDetails, ContainerExit, ContainerRuntime, ContainerTemplate, RuntimeError,
    RuntimeImage,
};

/// The label every discoverable image must carry.
pub const ENABLED_LABEL: &str = "orca.enabled";
/// Marks containers this gateway manages.
pub const MANAGED_LABEL: &str = "orca.internal.managed";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects over the default socket and probes the daemon.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket_defaults()?;
        let version = docker.version().await?;
        info!(
            "connected to Docker daemon version {}",
            version.version.unwrap_or_default()
        );
        Ok(Self { docker })
    }

    /// Leftover managed containers from a previous run, by id.
    pub async fn list_managed_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_labeled_images(&self) -> Result<Vec<RuntimeImage>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec!["*:latest".to_string()]);
        filters.insert("label".to_string(), vec![ENABLED_LABEL.to_string()]);

        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|img| RuntimeImage::new(img.id, img.repo_tags, img.labels))
            .collect())
    }

    async fn create_container(&self, template: &ContainerTemplate) -> Result<String, RuntimeError> {
        let exposed_ports = template.exposed_port.map(|port| {
            let mut ports = HashMap::new();
            ports.insert(format!("{port}/tcp"), HashMap::new());
            ports
        });

        let config = Config {
            image: Some(template.image.clone()),
            env: Some(template.env.clone()),
            labels: Some(template.labels.clone()),
            attach_stdin: Some(template.attach_stdin),
            attach_stdout: Some(template.attach_stdout),
            attach_stderr: Some(template.attach_stderr),
            open_stdin: Some(template.open_stdin),
            stdin_once: Some(template.stdin_once),
            tty: Some(template.tty),
            network_disabled: Some(template.network_disabled),
            stop_signal: template.stop_signal.clone(),
            exposed_ports,
            ..Default::default()
        };

        let created = self.docker.create_container::<String, _>(None, config).await?;
        for warning in &created.warnings {
            warn!("container create warning: {}", warning);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let details = self.docker.inspect_container(id, None).await?;
        Ok(ContainerDetails {
            ip_address: details
                .network_settings
                .and_then(|net| net.ip_address)
                .filter(|ip| !ip.is_empty()),
        })
    }

    async fn attach(&self, id: &str) -> Result<AttachedIo, RuntimeError> {
        let results = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let bytes = results.output.map(|chunk| {
            chunk
                .map(LogOutput::into_bytes)
                .map_err(std::io::Error::other)
        });
        Ok(AttachedIo {
            writer: Box::new(results.input),
            reader: Box::new(StreamReader::new(bytes)),
        })
    }

    async fn resize_tty(&self, id: &str, height: u16, width: u16) -> Result<(), RuntimeError> {
        self.docker
            .resize_container_tty(id, ResizeContainerTtyOptions { height, width })
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<ContainerExit, RuntimeError> {
        let mut wait = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match wait.next().await {
            Some(Ok(body)) => Ok(ContainerExit {
                exit_code: body.status_code,
                error_message: body
                    .error
                    .and_then(|e| e.message)
                    .filter(|m| !m.is_empty()),
            }),
            // bollard surfaces a non-zero exit as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                Ok(ContainerExit {
                    exit_code: code,
                    error_message: if error.is_empty() { None } else { Some(error) },
                })
            }
            Some(Err(err)) => Err(err.into()),
            None => Err(RuntimeError::Api(format!(
                "wait stream for {id} ended without a result"
            ))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
