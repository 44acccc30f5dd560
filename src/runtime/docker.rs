//! Docker runtime using the bollard crate.
//!
//! Containers are named `<project>-<service>-1` and attached to a
//! per-project network where each container answers to its service name.
//! Named volumes are prefixed with the project name; relative bind mounts
//! are resolved against the manifest directory.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::compose::{Deployment, ProbeTest, ServiceSpec};
use crate::config::load_env_file;
use crate::error::RuntimeError;
use crate::probe::ProbeOutcome;

use super::ServiceRuntime;

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Runtime that runs services as Docker containers.
pub struct DockerRuntime {
    docker: Docker,
    project: String,
    base_dir: PathBuf,
    containers: Mutex<HashMap<String, String>>,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new(project: impl Into<String>, base_dir: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_docker(docker, project, base_dir))
    }

    /// Creates a runtime from an existing bollard client.
    pub fn from_docker(docker: Docker, project: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            project: project.into(),
            base_dir: base_dir.into(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Container name for a service.
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}-1", self.project, service)
    }

    /// Name of the project network.
    pub fn network_name(&self) -> String {
        format!("{}_default", self.project)
    }

    fn container_for(&self, service: &str, spec: &ServiceSpec) -> String {
        spec.container_name
            .clone()
            .unwrap_or_else(|| self.container_name(service))
    }

    /// Container started for a service, falling back to the default name.
    fn started_container(&self, service: &str) -> String {
        let containers = match self.containers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        containers
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.container_name(service))
    }

    async fn ensure_image(&self, service: &str, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(service = %service, image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| RuntimeError::StartFailed {
                service: service.to_string(),
                reason: format!("Failed to pull image {image}: {e}"),
            })?;
        }
        Ok(())
    }

    async fn remove_if_exists(&self, container: &str) -> Result<(), BollardError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn environment(&self, service: &str, spec: &ServiceSpec) -> Result<Vec<String>, RuntimeError> {
        let mut env: HashMap<String, String> = HashMap::new();
        for file in &spec.env_file {
            let vars = load_env_file(&self.base_dir.join(file)).map_err(|e| {
                RuntimeError::StartFailed {
                    service: service.to_string(),
                    reason: e.to_string(),
                }
            })?;
            env.extend(vars);
        }
        env.extend(spec.environment.clone());

        let mut pairs: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        Ok(pairs)
    }

    fn binds(&self, spec: &ServiceSpec) -> Vec<String> {
        spec.volumes
            .iter()
            .map(|volume| resolve_volume(volume, &self.project, &self.base_dir))
            .collect()
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Resolves a short-syntax volume (`source:target[:mode]`) to a Docker bind.
fn resolve_volume(volume: &str, project: &str, base_dir: &Path) -> String {
    let Some((source, rest)) = volume.split_once(':') else {
        // Anonymous volume
        return volume.to_string();
    };

    let source = if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
        let path = Path::new(source);
        if path.is_absolute() {
            source.to_string()
        } else if let Some(home) = source.strip_prefix("~/") {
            std::env::var("HOME")
                .map(|h| format!("{}/{}", h.trim_end_matches('/'), home))
                .unwrap_or_else(|_| source.to_string())
        } else {
            let joined = base_dir.join(path);
            joined
                .canonicalize()
                .unwrap_or(joined)
                .display()
                .to_string()
        }
    } else {
        format!("{project}_{source}")
    };

    format!("{source}:{rest}")
}

/// Parses a short-syntax port mapping into (`port/proto`, binding).
fn parse_port(mapping: &str) -> Option<(String, PortBinding)> {
    let (spec, proto) = match mapping.rsplit_once('/') {
        Some((spec, proto)) => (spec, proto),
        None => (mapping, "tcp"),
    };

    let parts: Vec<&str> = spec.split(':').collect();
    let (host_ip, host_port, container_port) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host, container] => (None, Some(*host), *container),
        [ip, host, container] => (Some(*ip), Some(*host), *container),
        _ => return None,
    };
    container_port.parse::<u16>().ok()?;

    Some((
        format!("{container_port}/{proto}"),
        PortBinding {
            host_ip: host_ip.map(String::from),
            host_port: host_port.filter(|p| !p.is_empty()).map(String::from),
        },
    ))
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self, deployment: &Deployment) -> Result<(), RuntimeError> {
        let network = self.network_name();
        if self.docker.inspect_network::<String>(&network, None).await.is_err() {
            let mut labels = HashMap::new();
            labels.insert(PROJECT_LABEL.to_string(), self.project.clone());
            let options = CreateNetworkOptions {
                name: network.clone(),
                driver: "bridge".to_string(),
                labels,
                ..Default::default()
            };
            self.docker
                .create_network(options)
                .await
                .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to create network {network}: {e}")))?;
            info!(network = %network, "Created network");
        }

        for volume in deployment.volumes.keys() {
            let name = format!("{}_{}", self.project, volume);
            let mut labels = HashMap::new();
            labels.insert(PROJECT_LABEL.to_string(), self.project.clone());
            let options = CreateVolumeOptions {
                name: name.clone(),
                labels,
                ..Default::default()
            };
            // Creating an existing volume returns it unchanged
            self.docker
                .create_volume(options)
                .await
                .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to create volume {name}: {e}")))?;
            debug!(volume = %name, "Volume ready");
        }

        Ok(())
    }

    async fn start(&self, name: &str, spec: &ServiceSpec) -> Result<(), RuntimeError> {
        let start_failed = |reason: String| RuntimeError::StartFailed {
            service: name.to_string(),
            reason,
        };

        let image = spec
            .image
            .clone()
            .ok_or_else(|| RuntimeError::NoCommand(name.to_string()))?;
        self.ensure_image(name, &image).await?;

        let container = self.container_for(name, spec);
        self.remove_if_exists(&container)
            .await
            .map_err(|e| start_failed(format!("Failed to remove old container: {e}")))?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &spec.ports {
            let (port, binding) = parse_port(mapping)
                .ok_or_else(|| start_failed(format!("Invalid port mapping '{mapping}'")))?;
            exposed_ports.insert(port.clone(), HashMap::new());
            port_bindings
                .entry(port)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(binding);
        }

        let binds = self.binds(spec);
        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let mut endpoints = HashMap::new();
        endpoints.insert(
            self.network_name(),
            EndpointSettings {
                aliases: Some(vec![name.to_string()]),
                ..Default::default()
            },
        );

        let mut labels = HashMap::new();
        labels.insert(PROJECT_LABEL.to_string(), self.project.clone());
        labels.insert(SERVICE_LABEL.to_string(), name.to_string());

        let env = self.environment(name, spec)?;
        let config = Config {
            image: Some(image),
            hostname: Some(name.to_string()),
            entrypoint: spec.entrypoint.as_ref().map(|e| e.argv()),
            cmd: spec.command.as_ref().map(|c| c.argv()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            labels: Some(labels),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| start_failed(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container(&container, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| start_failed(format!("Failed to start container: {e}")))?;

        debug!(service = %name, container = %container, "Container started");
        match self.containers.lock() {
            Ok(mut containers) => containers.insert(name.to_string(), container),
            Err(poisoned) => poisoned.into_inner().insert(name.to_string(), container),
        };
        Ok(())
    }

    async fn wait_exit(&self, name: &str) -> Result<i64, RuntimeError> {
        let container = self.started_container(name);
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if status_code(&e) == Some(404) => Err(RuntimeError::NotStarted(name.to_string())),
            Some(Err(e)) => Err(RuntimeError::StartFailed {
                service: name.to_string(),
                reason: format!("Error waiting for container: {e}"),
            }),
            None => Err(RuntimeError::NotStarted(name.to_string())),
        }
    }

    async fn probe(
        &self,
        name: &str,
        test: &ProbeTest,
        timeout: Duration,
    ) -> Result<ProbeOutcome, RuntimeError> {
        let probe_failed = |reason: String| RuntimeError::ProbeFailed {
            service: name.to_string(),
            reason,
        };

        let container = self.started_container(name);
        let exec_options = CreateExecOptions {
            cmd: Some(test.argv()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let run = async {
            let exec = self
                .docker
                .create_exec(&container, exec_options)
                .await
                .map_err(|e| probe_failed(format!("Failed to create exec: {e}")))?;

            let started = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| probe_failed(format!("Failed to start exec: {e}")))?;

            let mut output = String::new();
            if let StartExecResults::Attached { output: mut stream, .. } = started {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(probe_failed(format!("Error reading output: {e}"))),
                    }
                }
            }

            let info = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| probe_failed(format!("Failed to inspect exec: {e}")))?;

            Ok::<_, RuntimeError>(ProbeOutcome::exited(info.exit_code.unwrap_or(-1), output))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Ok(ProbeOutcome::timeout()),
        }
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let container = self.started_container(name);
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.docker.stop_container(&container, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped, 404: never created
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {}
            Err(e) => {
                return Err(RuntimeError::StopFailed {
                    service: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        debug!(service = %name, container = %container, "Container stopped");
        Ok(())
    }
}
