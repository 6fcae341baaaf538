/// Container Lifecycle Manager
///
/// **Core Responsibility:**
/// Launch one short-lived, locked-down container per run, capture its output,
/// and remove everything the run created before returning.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (Docker via bollard)
/// - Engine does NOT parse track output or evaluate rules
/// - Engine returns raw output for runners to interpret
///
/// **Security posture (every container, not configurable):**
/// - No network (or a per-run internal network for cloud runs)
/// - All capabilities dropped, no-new-privileges
/// - Non-root user
/// - Read-only root filesystem, `noexec,nosuid` tmpfs scratch mounts
/// - Memory, CPU and pid quotas enforced by the runtime
///
/// **Cleanup invariant:**
/// Containers and per-run networks are removed before `run()` / `close()`
/// return, on success, non-zero exit, timeout and launch failure. A drop
/// guard covers panics and task cancellation.

use crate::config::TrackConfig;
use crate::error::{CleanupWarning, ExecutionError};
use crate::metrics;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use bollard::Docker;
use base64::{engine::general_purpose, Engine as _};
use futures_util::stream::StreamExt;
use gradebox_common::types::Track;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-stream capture limit
pub const MAX_LOG_BYTES: usize = 1024 * 1024;
/// Largest payload accepted as a single process argument
pub const MAX_ARG_BYTES: usize = 120 * 1024;
/// Chunk size for files streamed into a session through the exec environment
const WRITE_CHUNK_BYTES: usize = 64 * 1024;
/// Upper bound on any single daemon call
const DAEMON_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CALL_TIMEOUT: Duration = Duration::from_secs(2);

pub const LABEL_MANAGED: &str = "gradebox.managed";
pub const LABEL_RUN_ID: &str = "gradebox.run_id";

/// nobody:nogroup
const SANDBOX_UID: u32 = 65534;
const SANDBOX_GID: u32 = 65534;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
}

impl ResourceLimits {
    pub fn from_track(config: &TrackConfig) -> Self {
        Self {
            memory_bytes: (config.memory_limit_mb as i64) * 1024 * 1024,
            nano_cpus: (config.cpu_limit as f64 * 1_000_000_000.0) as i64,
            pids_limit: config.pids_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScratchMount {
    pub path: String,
    pub size_mb: u32,
}

/// User and writable scratch space. Capability dropping and the read-only
/// root filesystem are applied unconditionally by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityPolicy {
    pub uid: u32,
    pub gid: u32,
    pub scratch: Vec<ScratchMount>,
}

impl SecurityPolicy {
    /// `/tmp` and `/workspace` as private tmpfs mounts of `scratch_mb` each
    pub fn sandboxed(scratch_mb: u32) -> Self {
        Self {
            uid: SANDBOX_UID,
            gid: SANDBOX_GID,
            scratch: vec![
                ScratchMount {
                    path: "/tmp".to_string(),
                    size_mb: scratch_mb,
                },
                ScratchMount {
                    path: "/workspace".to_string(),
                    size_mb: scratch_mb,
                },
            ],
        }
    }

    pub fn user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    pub fn tmpfs_mounts(&self) -> HashMap<String, String> {
        self.scratch
            .iter()
            .map(|m| {
                (
                    m.path.clone(),
                    format!(
                        "rw,noexec,nosuid,nodev,size={}m,mode=0700,uid={},gid={}",
                        m.size_mb, self.uid, self.gid
                    ),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmulatorAttachment {
    pub container: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkPolicy {
    /// `network_mode: none`
    Disabled,
    /// Per-run `internal` bridge network, optionally shared with the emulator
    Isolated { emulator: Option<EmulatorAttachment> },
}

/// Everything needed to launch one container for one run
#[derive(Debug, Clone)]
pub struct ContainerRunDescriptor {
    pub run_id: Uuid,
    pub track: Track,
    pub image: String,
    /// Empty means the image's default command
    pub command: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub limits: ResourceLimits,
    pub security: SecurityPolicy,
    pub network: NetworkPolicy,
    pub timeout: Duration,
}

impl ContainerRunDescriptor {
    pub fn new(run_id: Uuid, track: Track, image: impl Into<String>, config: &TrackConfig) -> Self {
        Self {
            run_id,
            track,
            image: image.into(),
            command: Vec::new(),
            entrypoint: None,
            env: Vec::new(),
            working_dir: None,
            limits: ResourceLimits::from_track(config),
            security: SecurityPolicy::sandboxed(config.scratch_size_mb),
            network: NetworkPolicy::Disabled,
            timeout: Duration::from_secs(config.default_timeout_seconds),
        }
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn container_name(&self) -> String {
        format!("gradebox-{}-{}", self.track, self.run_id)
    }

    pub fn network_name(&self) -> String {
        format!("gradebox-net-{}", self.run_id)
    }

    pub fn labels(&self) -> HashMap<String, String> {
        run_labels(&self.run_id)
    }

    fn host_config(&self, network: Option<&str>) -> HostConfig {
        HostConfig {
            memory: Some(self.limits.memory_bytes),
            memory_swap: Some(self.limits.memory_bytes),
            nano_cpus: Some(self.limits.nano_cpus),
            pids_limit: Some(self.limits.pids_limit),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(self.security.tmpfs_mounts()),
            network_mode: Some(network.unwrap_or("none").to_string()),
            ..Default::default()
        }
    }

    fn container_config(&self, network: Option<&str>) -> Config<String> {
        Config {
            image: Some(self.image.clone()),
            cmd: (!self.command.is_empty()).then(|| self.command.clone()),
            entrypoint: self.entrypoint.clone(),
            env: Some(self.env.clone()),
            user: Some(self.security.user()),
            working_dir: self.working_dir.clone(),
            labels: Some(self.labels()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(network.is_none()),
            host_config: Some(self.host_config(network)),
            ..Default::default()
        }
    }
}

pub fn run_labels(run_id: &Uuid) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_RUN_ID.to_string(), run_id.to_string()),
    ])
}

/// Raw outcome of one container run or one session exec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRunResult {
    pub exit_code: Option<i64>,
    /// stdout only, for result-channel parsing
    pub stdout: String,
    /// stdout and stderr interleaved in arrival order
    pub log: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub oom_killed: bool,
}

impl RawRunResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Build of a submitted Dockerfile
#[derive(Debug, Clone)]
pub struct ImageBuild {
    pub run_id: Uuid,
    pub tag: String,
    pub dockerfile: String,
    pub memory_limit_bytes: u64,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuildOutput {
    pub success: bool,
    pub log: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RuntimeHealth {
    pub runtime_reachable: bool,
    pub image_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Seam between runners and the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a container to completion under its timeout
    async fn run(&self, descriptor: &ContainerRunDescriptor) -> Result<RawRunResult, ExecutionError>;

    /// Start a container that stays up for several exec phases
    async fn open_session(
        &self,
        descriptor: &ContainerRunDescriptor,
    ) -> Result<Box<dyn ContainerSession>, ExecutionError>;

    /// A failing Dockerfile is `Ok` with `success == false`
    async fn build_image(&self, build: &ImageBuild) -> Result<ImageBuildOutput, ExecutionError>;

    async fn remove_image(&self, tag: &str) -> Result<(), CleanupWarning>;

    async fn health(&self, image: &str) -> RuntimeHealth;

    /// Containers still carrying this run's label
    async fn leftover_containers(&self, run_id: &Uuid) -> Result<Vec<String>, ExecutionError>;
}

#[async_trait]
pub trait ContainerSession: Send + Sync {
    fn container_id(&self) -> &str;

    /// On timeout the session container is killed and later calls fail
    async fn exec(
        &mut self,
        command: &[String],
        env: &[String],
        timeout: Duration,
    ) -> Result<RawRunResult, ExecutionError>;

    async fn write_file(&mut self, path: &str, contents: &str, timeout: Duration)
        -> Result<(), ExecutionError>;

    async fn is_running(&self) -> Result<bool, ExecutionError>;

    async fn probe_port(&self, port: u16, timeout: Duration) -> bool;

    /// Remove the container and any per-run network
    async fn close(self: Box<Self>) -> Vec<CleanupWarning>;
}

/// Map bollard errors: answers from the daemon are launch failures,
/// everything else means the daemon is not reachable.
fn classify(action: &str, error: bollard::errors::Error) -> ExecutionError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => ExecutionError::ContainerLaunch(format!("{}: {} (HTTP {})", action, message, status_code)),
        other => ExecutionError::RuntimeUnavailable(format!("{}: {}", action, other)),
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Bound a daemon call so an unresponsive daemon cannot stall a run
/// Consume an image pull stream; a stalled registry counts against the run
async fn drain_pull<S, T, E>(stream: S, image: &str, budget: Duration) -> Result<(), ExecutionError>
where
    S: futures_util::Stream<Item = Result<T, E>>,
    E: std::fmt::Display,
{
    let drain = async {
        let mut stream = std::pin::pin!(stream);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                ExecutionError::ContainerLaunch(format!("image '{}' not available: {}", image, e))
            })?;
        }
        Ok::<(), ExecutionError>(())
    };

    match tokio::time::timeout(budget, drain).await {
        Ok(result) => result,
        Err(_) => {
            warn!(image = %image, budget_secs = budget.as_secs(), "Image pull did not finish in time");
            Err(ExecutionError::Timeout {
                seconds: budget.as_secs(),
            })
        }
    }
}

async fn daemon<T, F>(action: &str, call: F) -> Result<T, ExecutionError>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    match tokio::time::timeout(DAEMON_CALL_TIMEOUT, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(classify(action, e)),
        Err(_) => Err(ExecutionError::RuntimeUnavailable(format!(
            "{}: daemon did not answer within {}s",
            action,
            DAEMON_CALL_TIMEOUT.as_secs()
        ))),
    }
}

/// Bounded capture of container output
#[derive(Debug, Default)]
struct LogBuffer {
    stdout: String,
    log: String,
    truncated: bool,
}

impl LogBuffer {
    fn push(&mut self, output: LogOutput) {
        match output {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                let text = String::from_utf8_lossy(&message);
                self.append(&text, true);
            }
            LogOutput::StdErr { message } => {
                let text = String::from_utf8_lossy(&message);
                self.append(&text, false);
            }
            LogOutput::StdIn { .. } => {}
        }
    }

    fn append(&mut self, text: &str, is_stdout: bool) {
        if self.log.len() + text.len() > MAX_LOG_BYTES {
            if !self.truncated {
                self.truncated = true;
                self.log.push_str("\n[output truncated]\n");
            }
            return;
        }
        self.log.push_str(text);
        if is_stdout {
            self.stdout.push_str(text);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NetworkHandle {
    name: String,
    emulator: Option<String>,
}

/// Backstop removal on panic or cancellation. Explicit teardown disarms it.
struct RunGuard {
    docker: Docker,
    container_id: Option<String>,
    network: Option<NetworkHandle>,
    armed: bool,
}

impl RunGuard {
    fn new(docker: Docker, network: Option<NetworkHandle>) -> Self {
        Self {
            docker,
            container_id: None,
            network,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot await in Drop; hand the removal to the runtime if one exists
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let docker = self.docker.clone();
        let container_id = self.container_id.take();
        let network = self.network.take();

        handle.spawn(async move {
            for warning in teardown(&docker, container_id.as_deref(), network.as_ref()).await {
                warn!(%warning, "Deferred cleanup incomplete");
            }
        });
    }
}

/// Remove container, detach emulator, remove network. Never fails; problems
/// come back as warnings.
async fn teardown(
    docker: &Docker,
    container_id: Option<&str>,
    network: Option<&NetworkHandle>,
) -> Vec<CleanupWarning> {
    let mut warnings = Vec::new();

    if let Some(id) = container_id {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match daemon("remove container", docker.remove_container(id, Some(options))).await {
            Ok(()) => {
                metrics::CONTAINERS_ACTIVE.dec();
                debug!(container = %id, "Container removed");
            }
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to remove container");
                warnings.push(CleanupWarning::new(format!("container {} not removed: {}", id, e)));
            }
        }
    }

    if let Some(network) = network {
        if let Some(emulator) = &network.emulator {
            let options = DisconnectNetworkOptions {
                container: emulator.clone(),
                force: true,
            };
            if let Err(e) = daemon(
                "disconnect emulator",
                docker.disconnect_network(&network.name, options),
            )
            .await
            {
                warn!(network = %network.name, error = %e, "Failed to disconnect emulator");
                warnings.push(CleanupWarning::new(format!(
                    "emulator not disconnected from {}: {}",
                    network.name, e
                )));
            }
        }

        if let Err(e) = daemon("remove network", docker.remove_network(&network.name)).await {
            warn!(network = %network.name, error = %e, "Failed to remove network");
            warnings.push(CleanupWarning::new(format!(
                "network {} not removed: {}",
                network.name, e
            )));
        }
    }

    warnings
}

/// Docker-based Container Lifecycle Manager
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    pull_missing_images: bool,
}

impl DockerEngine {
    /// Connect with local defaults. Connection is lazy; reachability is
    /// checked with [`DockerEngine::ping`].
    pub fn connect(pull_missing_images: bool) -> Result<Self, ExecutionError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutionError::RuntimeUnavailable(format!("connect: {}", e)))?;

        Ok(Self {
            docker,
            pull_missing_images,
        })
    }

    pub async fn ping(&self) -> Result<(), ExecutionError> {
        match tokio::time::timeout(HEALTH_CALL_TIMEOUT, self.docker.ping()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ExecutionError::RuntimeUnavailable(e.to_string())),
            Err(_) => Err(ExecutionError::RuntimeUnavailable(
                "ping timed out".to_string(),
            )),
        }
    }

    /// Remove managed containers and networks left behind by an earlier crash
    pub async fn reap_orphans(&self) -> Result<usize, ExecutionError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);

        let containers = daemon(
            "list containers",
            self.docker.list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: filters.clone(),
                ..Default::default()
            })),
        )
        .await?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            match daemon("remove container", self.docker.remove_container(&id, Some(options))).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to reap container"),
            }
        }

        let networks = daemon(
            "list networks",
            self.docker
                .list_networks(Some(ListNetworksOptions::<String> { filters })),
        )
        .await?;

        for network in networks {
            let Some(name) = network.name else { continue };
            if let Err(e) = daemon("remove network", self.docker.remove_network(&name)).await {
                warn!(network = %name, error = %e, "Failed to reap network");
            }
        }

        if removed > 0 {
            info!(removed, "Reaped orphaned containers");
        }
        Ok(removed)
    }

    /// Ensure Docker image is available (pull if allowed, within `budget`)
    async fn ensure_image(&self, image: &str, budget: Duration) -> Result<(), ExecutionError> {
        match tokio::time::timeout(DAEMON_CALL_TIMEOUT, self.docker.inspect_image(image)).await {
            Ok(Ok(_)) => {
                debug!("Image cache hit: {}", image);
                return Ok(());
            }
            Ok(Err(e)) if is_not_found(&e) => {}
            Ok(Err(e)) => return Err(classify("inspect image", e)),
            Err(_) => {
                return Err(ExecutionError::RuntimeUnavailable(
                    "inspect image: daemon did not answer".to_string(),
                ))
            }
        }

        if !self.pull_missing_images {
            return Err(ExecutionError::ContainerLaunch(format!(
                "image '{}' is not present",
                image
            )));
        }

        warn!("Image cache miss: {} (pulling now)", image);

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        drain_pull(self.docker.create_image(options, None, None), image, budget).await?;

        info!("Image pulled successfully: {}", image);
        Ok(())
    }

    /// Create the per-run network and attach the emulator to it
    async fn prepare_network(
        &self,
        descriptor: &ContainerRunDescriptor,
    ) -> Result<Option<NetworkHandle>, ExecutionError> {
        let NetworkPolicy::Isolated { emulator } = &descriptor.network else {
            return Ok(None);
        };

        let name = descriptor.network_name();
        let options = CreateNetworkOptions {
            name: name.clone(),
            driver: "bridge".to_string(),
            internal: true,
            labels: descriptor.labels(),
            ..Default::default()
        };
        daemon("create network", self.docker.create_network(options)).await?;

        let mut handle = NetworkHandle {
            name: name.clone(),
            emulator: None,
        };

        if let Some(emulator) = emulator {
            let options = ConnectNetworkOptions {
                container: emulator.container.clone(),
                endpoint_config: EndpointSettings {
                    aliases: Some(vec![emulator.alias.clone()]),
                    ..Default::default()
                },
            };
            if let Err(e) = daemon("attach emulator", self.docker.connect_network(&name, options)).await {
                teardown(&self.docker, None, Some(&handle)).await;
                return Err(e);
            }
            handle.emulator = Some(emulator.container.clone());
        }

        Ok(Some(handle))
    }

    async fn create_and_start(
        &self,
        descriptor: &ContainerRunDescriptor,
        guard: &mut RunGuard,
    ) -> Result<String, ExecutionError> {
        let network = guard.network.as_ref().map(|n| n.name.clone());
        let config = descriptor.container_config(network.as_deref());
        let container_name = descriptor.container_name();
        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let created = daemon(
            "create container",
            self.docker.create_container(Some(options), config),
        )
        .await?;
        metrics::CONTAINERS_ACTIVE.inc();

        // Register with the guard before anything else can fail
        guard.container_id = Some(created.id.clone());

        daemon(
            "start container",
            self.docker
                .start_container(&created.id, None::<StartContainerOptions<String>>),
        )
        .await?;

        Ok(created.id)
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = daemon(
            "kill container",
            self.docker
                .kill_container(container_id, None::<KillContainerOptions<String>>),
        )
        .await
        {
            warn!(container = %container_id, error = %e, "Failed to kill container");
        }
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match daemon(
            "inspect container",
            self.docker
                .inspect_container(container_id, None::<InspectContainerOptions>),
        )
        .await
        {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Race log collection and exit against the descriptor timeout
    async fn supervise(
        &self,
        descriptor: &ContainerRunDescriptor,
        container_id: &str,
    ) -> RawRunResult {
        let start_time = Instant::now();
        let mut buffer = LogBuffer::default();
        let mut exit_code: Option<i64> = None;

        let execution = async {
            let options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(container_id, options);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(output) => buffer.push(output),
                    Err(e) => {
                        warn!(container = %container_id, error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(container_id, Some(wait_options));
            match wait.next().await {
                Some(Ok(response)) => exit_code = Some(response.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    exit_code = Some(code)
                }
                Some(Err(e)) => warn!(container = %container_id, error = %e, "Failed to get exit code"),
                None => warn!(container = %container_id, "No wait response from container"),
            }
        };

        let timed_out = tokio::time::timeout(descriptor.timeout, execution)
            .await
            .is_err();

        if timed_out {
            warn!(
                container = %container_id,
                timeout_ms = descriptor.timeout.as_millis() as u64,
                "Execution timed out - killing container"
            );
            self.kill(container_id).await;
            buffer.append("\n[Execution timed out]\n", false);
        }

        let oom_killed = !timed_out && self.oom_killed(container_id).await;
        if oom_killed {
            buffer.append("\n[Container killed: exceeded memory limit]\n", false);
        } else if exit_code == Some(139) {
            buffer.append("\n[Container killed: segmentation fault]\n", false);
        }

        RawRunResult {
            exit_code,
            stdout: buffer.stdout,
            log: buffer.log,
            duration: start_time.elapsed(),
            timed_out,
            oom_killed,
        }
    }

    async fn inspect_ip(&self, container_id: &str, network: &str) -> Option<String> {
        let info = daemon(
            "inspect container",
            self.docker
                .inspect_container(container_id, None::<InspectContainerOptions>),
        )
        .await
        .ok()?;

        info.network_settings?
            .networks?
            .get(network)?
            .ip_address
            .clone()
            .filter(|ip| !ip.is_empty())
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    #[tracing::instrument(skip(self, descriptor), fields(run_id = %descriptor.run_id, image = %descriptor.image))]
    async fn run(&self, descriptor: &ContainerRunDescriptor) -> Result<RawRunResult, ExecutionError> {
        self.ensure_image(&descriptor.image, descriptor.timeout).await?;

        let network = self.prepare_network(descriptor).await?;
        let mut guard = RunGuard::new(self.docker.clone(), network);

        let outcome = match self.create_and_start(descriptor, &mut guard).await {
            Ok(container_id) => Ok(self.supervise(descriptor, &container_id).await),
            Err(e) => Err(e),
        };

        let warnings = teardown(
            &self.docker,
            guard.container_id.as_deref(),
            guard.network.as_ref(),
        )
        .await;
        guard.disarm();

        if let Ok(result) = &outcome {
            info!(
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                execution_ms = result.duration_ms(),
                cleanup_warnings = warnings.len(),
                "Container run finished"
            );
        }
        outcome
    }

    async fn open_session(
        &self,
        descriptor: &ContainerRunDescriptor,
    ) -> Result<Box<dyn ContainerSession>, ExecutionError> {
        self.ensure_image(&descriptor.image, descriptor.timeout).await?;

        let network = self.prepare_network(descriptor).await?;
        let mut guard = RunGuard::new(self.docker.clone(), network);

        match self.create_and_start(descriptor, &mut guard).await {
            Ok(container_id) => {
                debug!(container = %container_id, "Session started");
                Ok(Box::new(DockerSession {
                    engine: self.clone(),
                    container_id,
                    guard,
                    dead: false,
                }))
            }
            Err(e) => {
                teardown(
                    &self.docker,
                    guard.container_id.as_deref(),
                    guard.network.as_ref(),
                )
                .await;
                guard.disarm();
                Err(e)
            }
        }
    }

    async fn build_image(&self, build: &ImageBuild) -> Result<ImageBuildOutput, ExecutionError> {
        let context = dockerfile_context(&build.dockerfile)
            .map_err(|e| ExecutionError::ContainerLaunch(format!("build context: {}", e)))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: build.tag.clone(),
            rm: true,
            forcerm: true,
            networkmode: "none".to_string(),
            memory: Some(build.memory_limit_bytes),
            labels: run_labels(&build.run_id),
            ..Default::default()
        };

        let mut log = String::new();
        let mut error = None;

        let building = async {
            let mut stream = self.docker.build_image(options, None, Some(context.into()));
            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        if let Some(line) = info.stream {
                            log.push_str(&line);
                        }
                        if let Some(message) = info.error {
                            error = Some(message);
                            break;
                        }
                    }
                    Err(bollard::errors::Error::DockerStreamError { error: message }) => {
                        error = Some(message);
                        break;
                    }
                    Err(e) => return Err(classify("build image", e)),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(build.timeout, building).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ExecutionError::Timeout {
                    seconds: build.timeout.as_secs(),
                })
            }
        }

        Ok(ImageBuildOutput {
            success: error.is_none(),
            log,
            error,
        })
    }

    async fn remove_image(&self, tag: &str) -> Result<(), CleanupWarning> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match tokio::time::timeout(
            DAEMON_CALL_TIMEOUT,
            self.docker.remove_image(tag, Some(options), None),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if is_not_found(&e) => Ok(()),
            Ok(Err(e)) => Err(CleanupWarning::new(format!("image {} not removed: {}", tag, e))),
            Err(_) => Err(CleanupWarning::new(format!(
                "image {} not removed: daemon did not answer",
                tag
            ))),
        }
    }

    async fn health(&self, image: &str) -> RuntimeHealth {
        if let Err(e) = self.ping().await {
            return RuntimeHealth {
                runtime_reachable: false,
                image_present: false,
                detail: Some(e.to_string()),
            };
        }

        match tokio::time::timeout(HEALTH_CALL_TIMEOUT, self.docker.inspect_image(image)).await {
            Ok(Ok(_)) => RuntimeHealth {
                runtime_reachable: true,
                image_present: true,
                detail: None,
            },
            Ok(Err(e)) => RuntimeHealth {
                runtime_reachable: true,
                image_present: false,
                detail: Some(e.to_string()),
            },
            Err(_) => RuntimeHealth {
                runtime_reachable: true,
                image_present: false,
                detail: Some("image inspection timed out".to_string()),
            },
        }
    }

    async fn leftover_containers(&self, run_id: &Uuid) -> Result<Vec<String>, ExecutionError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", LABEL_RUN_ID, run_id)],
        )]);
        let containers = daemon(
            "list containers",
            self.docker.list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            })),
        )
        .await?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Tar archive holding a single Dockerfile
fn dockerfile_context(dockerfile: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    builder.into_inner()
}

/// Long-lived container used for multi-phase runs
struct DockerSession {
    engine: DockerEngine,
    container_id: String,
    guard: RunGuard,
    dead: bool,
}

impl DockerSession {
    fn ensure_alive(&self) -> Result<(), ExecutionError> {
        if self.dead {
            return Err(ExecutionError::ContainerRuntime {
                exit_code: None,
                message: "session container is no longer running".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerSession for DockerSession {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn exec(
        &mut self,
        command: &[String],
        env: &[String],
        timeout: Duration,
    ) -> Result<RawRunResult, ExecutionError> {
        self.ensure_alive()?;
        let docker = &self.engine.docker;
        let start_time = Instant::now();

        let exec_config = CreateExecOptions {
            cmd: Some(command.to_vec()),
            env: Some(env.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some("/workspace".to_string()),
            ..Default::default()
        };
        let exec = daemon("create exec", docker.create_exec(&self.container_id, exec_config)).await?;

        let mut buffer = LogBuffer::default();
        let execution = async {
            let start_config = StartExecOptions {
                detach: false,
                ..Default::default()
            };
            let output = daemon("start exec", docker.start_exec(&exec.id, Some(start_config))).await?;
            if let StartExecResults::Attached { mut output, .. } = output {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(out) => buffer.push(out),
                        Err(e) => {
                            buffer.append(&format!("\n[Execution error: {}]\n", e), false);
                            break;
                        }
                    }
                }
            }
            let inspect = daemon("inspect exec", docker.inspect_exec(&exec.id)).await?;
            Ok::<Option<i64>, ExecutionError>(inspect.exit_code)
        };

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(code)) => (code, false),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    container = %self.container_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Exec timed out - killing session container"
                );
                self.engine.kill(&self.container_id).await;
                self.dead = true;
                buffer.append("\n[Execution timed out]\n", false);
                (None, true)
            }
        };

        Ok(RawRunResult {
            exit_code,
            stdout: buffer.stdout,
            log: buffer.log,
            duration: start_time.elapsed(),
            timed_out,
            oom_killed: false,
        })
    }

    /// Streams the file as base64 through the exec environment; the
    /// scratch tmpfs cannot be reached through the archive API.
    async fn write_file(
        &mut self,
        path: &str,
        contents: &str,
        timeout: Duration,
    ) -> Result<(), ExecutionError> {
        let encoded = general_purpose::STANDARD.encode(contents);
        let target = format!("GB_TARGET={}", path);
        let sh = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];

        let reset = self
            .exec(&sh(": > \"$GB_TARGET.b64\""), &[target.clone()], timeout)
            .await?;
        let mut results = vec![reset];

        for chunk in encoded.as_bytes().chunks(WRITE_CHUNK_BYTES) {
            let env = vec![
                target.clone(),
                format!("GB_CHUNK={}", String::from_utf8_lossy(chunk)),
            ];
            results.push(
                self.exec(&sh("printf '%s' \"$GB_CHUNK\" >> \"$GB_TARGET.b64\""), &env, timeout)
                    .await?,
            );
        }

        results.push(
            self.exec(
                &sh("base64 -d \"$GB_TARGET.b64\" > \"$GB_TARGET\" && rm -f \"$GB_TARGET.b64\""),
                &[target],
                timeout,
            )
            .await?,
        );

        match results.iter().find(|r| !r.succeeded()) {
            None => Ok(()),
            Some(failed) if failed.timed_out => Err(ExecutionError::Timeout {
                seconds: timeout.as_secs(),
            }),
            Some(failed) => Err(ExecutionError::ContainerLaunch(format!(
                "failed to write {}: {}",
                path,
                failed.log.trim()
            ))),
        }
    }

    async fn is_running(&self) -> Result<bool, ExecutionError> {
        let info = daemon(
            "inspect container",
            self.engine
                .docker
                .inspect_container(&self.container_id, None::<InspectContainerOptions>),
        )
        .await?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn probe_port(&self, port: u16, timeout: Duration) -> bool {
        let Some(network) = self.guard.network.as_ref() else {
            return false;
        };
        let Some(ip) = self.engine.inspect_ip(&self.container_id, &network.name).await else {
            return false;
        };

        matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect((ip.as_str(), port))).await,
            Ok(Ok(_))
        )
    }

    async fn close(mut self: Box<Self>) -> Vec<CleanupWarning> {
        let warnings = teardown(
            &self.engine.docker,
            self.guard.container_id.as_deref(),
            self.guard.network.as_ref(),
        )
        .await;
        self.guard.disarm();
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackConfigManager;

    fn descriptor() -> ContainerRunDescriptor {
        let manager = TrackConfigManager::built_in();
        let config = manager.get_config(Track::Data).unwrap();
        ContainerRunDescriptor::new(Uuid::new_v4(), Track::Data, "gradebox-data:latest", config)
    }

    #[test]
    fn test_host_config_enforces_posture() {
        let d = descriptor();
        let host = d.host_config(None);

        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));

        let tmpfs = host.tmpfs.unwrap();
        let scratch = &tmpfs["/tmp"];
        assert!(scratch.contains("noexec"));
        assert!(scratch.contains("nosuid"));
        assert!(scratch.contains("size=64m"));
        assert!(tmpfs.contains_key("/workspace"));
    }

    #[test]
    fn test_container_config_runs_as_nobody() {
        let d = descriptor().with_command(vec!["run".to_string()]);
        let config = d.container_config(None);

        assert_eq!(config.user.as_deref(), Some("65534:65534"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.cmd, Some(vec!["run".to_string()]));

        let labels = config.labels.unwrap();
        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_RUN_ID], d.run_id.to_string());
    }

    #[test]
    fn test_isolated_network_is_attached() {
        let d = descriptor().with_network(NetworkPolicy::Isolated { emulator: None });
        let name = d.network_name();
        let config = d.container_config(Some(&name));

        assert_eq!(config.network_disabled, Some(false));
        assert_eq!(config.host_config.unwrap().network_mode, Some(name));
    }

    #[test]
    fn test_empty_command_uses_image_default() {
        assert_eq!(descriptor().container_config(None).cmd, None);
    }

    #[test]
    fn test_names_are_unique_per_run() {
        let a = descriptor();
        let b = descriptor();
        assert_ne!(a.container_name(), b.container_name());
        assert!(a.container_name().starts_with("gradebox-data-"));
        assert!(a.network_name().starts_with("gradebox-net-"));
    }

    #[test]
    fn test_log_buffer_caps_output() {
        let mut buffer = LogBuffer::default();
        buffer.append("hello ", true);
        buffer.append("warn ", false);
        assert_eq!(buffer.stdout, "hello ");
        assert_eq!(buffer.log, "hello warn ");

        let big = "x".repeat(MAX_LOG_BYTES);
        buffer.append(&big, true);
        buffer.append(&big, true);
        assert!(buffer.truncated);
        assert!(buffer.log.len() <= MAX_LOG_BYTES + 64);
        assert_eq!(buffer.log.matches("[output truncated]").count(), 1);
    }

    #[test]
    fn test_raw_result_success() {
        let ok = RawRunResult {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded());

        let timed_out = RawRunResult {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.succeeded());
        assert!(!RawRunResult::default().succeeded());
    }

    #[test]
    fn test_classify_daemon_errors() {
        let answered = classify(
            "create container",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such image".to_string(),
            },
        );
        assert!(matches!(answered, ExecutionError::ContainerLaunch(_)));

        let unreachable = classify(
            "create container",
            bollard::errors::Error::RequestTimeoutError,
        );
        assert!(matches!(unreachable, ExecutionError::RuntimeUnavailable(_)));
    }

    #[test]
    fn test_dockerfile_context_is_tar() {
        let bytes = dockerfile_context("FROM alpine:3.19\n").unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile".to_string()]);
    }

    #[tokio::test]
    async fn test_stalled_pull_times_out() {
        let stalled = futures_util::stream::pending::<Result<(), String>>();
        let err = drain_pull(stalled, "gradebox-data:latest", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Timeout { seconds: 0 });
    }

    #[tokio::test]
    async fn test_pull_errors_are_launch_failures() {
        let progress = futures_util::stream::iter(vec![Ok(()), Err("manifest unknown".to_string())]);
        let err = drain_pull(progress, "nope:latest", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ContainerLaunch(m) if m.contains("manifest unknown")));

        let done = futures_util::stream::iter(vec![Ok::<(), String>(()), Ok(())]);
        assert!(drain_pull(done, "ok:latest", Duration::from_secs(5)).await.is_ok());
    }
}
