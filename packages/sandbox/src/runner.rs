// ABOUTME: Container run driver with guaranteed stop/wait/remove teardown
// ABOUTME: Streams combined container output live through the blockquote framer

use std::collections::HashMap;
use std::future::Future;

use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blockquote::BlockquoteWriter;
use crate::error::Result;
use crate::mounts::{DeviceMap, VolumeMap};

/// Label applied to every container this crate creates.
const MANAGED_LABEL: &str = "zmk-hermit.managed";

/// Seconds the container gets to stop gracefully before being killed.
const STOP_TIMEOUT_SECS: i64 = 1;

/// Exit code reported when the real status cannot be obtained.
pub const EXIT_CODE_UNKNOWN: i64 = -1;

/// Typed passthrough options for container creation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub network_mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: String,
    pub command: Vec<String>,
    pub volumes: VolumeMap,
    pub devices: DeviceMap,
    pub user: Option<u32>,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i64,
}

/// Creates, supervises and always tears down a sandbox container.
pub struct ContainerRunner {
    client: Docker,
}

impl ContainerRunner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: Docker::connect_with_defaults()?,
        })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Run a command in an ephemeral container and relay its combined output
    /// to `sink`, framed, one chunk at a time.
    ///
    /// `shutdown` is the external interruption signal; when it resolves the
    /// log loop stops and teardown proceeds as usual. Whatever ends the
    /// streaming (end of output, interruption, a sink that went away), the
    /// container is stopped, its exit status collected and the container
    /// removed. A nonzero command exit is a normal [`RunOutcome`], never an
    /// error; errors are only possible before streaming begins.
    pub async fn run<W, F>(&self, request: RunRequest, sink: W, shutdown: F) -> Result<RunOutcome>
    where
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let volumes = request.volumes.resolve_overlaps()?;
        let binds = volumes.bindings();
        let devices = request.devices.device_mappings();
        for bind in &binds {
            debug!("bind {bind}");
        }

        let mut labels = request.options.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let config = Config {
            image: Some(request.image.clone()),
            cmd: Some(request.command.clone()),
            user: request.user.map(|uid| uid.to_string()),
            tty: Some(true),
            env: (!request.options.env.is_empty()).then(|| request.options.env.clone()),
            working_dir: request.options.working_dir.clone(),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                devices: (!devices.is_empty()).then_some(devices),
                network_mode: request.options.network_mode.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let name = format!("zmk-hermit-{}", Uuid::new_v4());
        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        debug!("created container {name} ({})", created.id);
        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // The container resource already exists at this point; a start
            // rejection (bad command, OCI failure) must not leave it behind.
            self.remove(&created.id).await;
            return Err(e.into());
        }

        self.stream_logs(&created.id, sink, shutdown).await;

        Ok(self.finalize(&created.id).await)
    }

    /// Relay the container's combined output until it ends or `shutdown`
    /// resolves. Relaying trouble is not fatal; the exit status still is the
    /// result the caller cares about.
    async fn stream_logs<W, F>(&self, id: &str, sink: W, shutdown: F)
    where
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut logs = self.client.logs(
            id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut quoted = BlockquoteWriter::new(sink);
        if let Err(e) = quoted.open().await {
            warn!("could not relay container output: {e}");
            return;
        }
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                chunk = logs.next() => match chunk {
                    Some(Ok(output)) => {
                        if let Err(e) = quoted.write_chunk(&output.into_bytes()).await {
                            warn!("could not relay container output: {e}");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("log stream interrupted: {e}");
                        break;
                    }
                    None => break,
                },
                _ = &mut shutdown => {
                    debug!("interrupted; tearing down container");
                    break;
                }
            }
        }
        if let Err(e) = quoted.close().await {
            warn!("could not relay container output: {e}");
        }
    }

    /// Stop, collect the exit status, remove. Failures here are reported and
    /// swallowed; teardown must never mask the primary result.
    async fn finalize(&self, id: &str) -> RunOutcome {
        if let Err(e) = self
            .client
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            warn!("failed to stop container: {e}");
        }

        let exit_code = self.wait_exit_code(id).await;
        self.remove(id).await;
        RunOutcome { exit_code }
    }

    async fn remove(&self, id: &str) {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => debug!("removed container"),
            Err(e) => warn!("failed to remove container: {e}"),
        }
    }

    async fn wait_exit_code(&self, id: &str) -> i64 {
        let mut wait = self
            .client
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a nonzero command exit through this error
            // variant; it is the normal failing-command path.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                warn!("could not obtain container exit status: {e}");
                EXIT_CODE_UNKNOWN
            }
            None => {
                warn!("wait stream ended without a status");
                EXIT_CODE_UNKNOWN
            }
        }
    }
}
