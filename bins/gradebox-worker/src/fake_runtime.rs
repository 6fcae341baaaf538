// Scripted in-memory ContainerRuntime for unit tests

use crate::engine::{
    ContainerRunDescriptor, ContainerRuntime, ContainerSession, ImageBuild, ImageBuildOutput,
    RawRunResult, RuntimeHealth,
};
use crate::error::{CleanupWarning, ExecutionError};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub type ExecHandler = Arc<dyn Fn(&[String]) -> RawRunResult + Send + Sync>;

pub fn exited(code: i64, stdout: &str) -> RawRunResult {
    RawRunResult {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        log: stdout.to_string(),
        duration: Duration::from_millis(5),
        ..Default::default()
    }
}

pub fn timed_out() -> RawRunResult {
    RawRunResult {
        exit_code: None,
        log: "\n[Execution timed out]\n".to_string(),
        timed_out: true,
        ..Default::default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionRecord {
    pub run_id: Option<Uuid>,
    pub image: String,
    pub execs: Vec<Vec<String>>,
    pub files: BTreeMap<String, String>,
    pub closed: bool,
}

#[derive(Default)]
pub struct FakeState {
    pub descriptors: Vec<ContainerRunDescriptor>,
    pub sessions: Vec<SessionRecord>,
    pub builds: Vec<ImageBuild>,
    pub removed_images: Vec<String>,
    /// run id -> containers not yet removed
    pub live: BTreeMap<Uuid, usize>,
    pub open_sessions: usize,
    pub peak_sessions: usize,
}

pub struct FakeRuntime {
    runs: Mutex<VecDeque<Result<RawRunResult, ExecutionError>>>,
    builds: Mutex<VecDeque<Result<ImageBuildOutput, ExecutionError>>>,
    exec_handler: ExecHandler,
    session_error: Option<ExecutionError>,
    container_running: bool,
    open_ports: Vec<u16>,
    health: RuntimeHealth,
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(VecDeque::new()),
            builds: Mutex::new(VecDeque::new()),
            exec_handler: Arc::new(|_| exited(0, "")),
            session_error: None,
            container_running: true,
            open_ports: Vec::new(),
            health: RuntimeHealth {
                runtime_reachable: true,
                image_present: true,
                detail: None,
            },
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn with_run(self, result: Result<RawRunResult, ExecutionError>) -> Self {
        self.runs.lock().unwrap().push_back(result);
        self
    }

    pub fn with_build(self, result: Result<ImageBuildOutput, ExecutionError>) -> Self {
        self.builds.lock().unwrap().push_back(result);
        self
    }

    pub fn with_exec(mut self, handler: impl Fn(&[String]) -> RawRunResult + Send + Sync + 'static) -> Self {
        self.exec_handler = Arc::new(handler);
        self
    }

    pub fn with_session_error(mut self, error: ExecutionError) -> Self {
        self.session_error = Some(error);
        self
    }

    pub fn with_container(mut self, running: bool, open_ports: &[u16]) -> Self {
        self.container_running = running;
        self.open_ports = open_ports.to_vec();
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.health = RuntimeHealth {
            runtime_reachable: false,
            image_present: false,
            detail: Some("connection refused".to_string()),
        };
        self
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().unwrap().sessions.clone()
    }

    pub fn last_descriptor(&self) -> Option<ContainerRunDescriptor> {
        self.state.lock().unwrap().descriptors.last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, descriptor: &ContainerRunDescriptor) -> Result<RawRunResult, ExecutionError> {
        self.state.lock().unwrap().descriptors.push(descriptor.clone());
        self.runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(exited(0, "")))
    }

    async fn open_session(
        &self,
        descriptor: &ContainerRunDescriptor,
    ) -> Result<Box<dyn ContainerSession>, ExecutionError> {
        if let Some(error) = &self.session_error {
            return Err(error.clone());
        }

        let index = {
            let mut state = self.state.lock().unwrap();
            state.descriptors.push(descriptor.clone());
            *state.live.entry(descriptor.run_id).or_default() += 1;
            state.open_sessions += 1;
            state.peak_sessions = state.peak_sessions.max(state.open_sessions);
            state.sessions.push(SessionRecord {
                run_id: Some(descriptor.run_id),
                image: descriptor.image.clone(),
                ..Default::default()
            });
            state.sessions.len() - 1
        };

        Ok(Box::new(FakeSession {
            index,
            run_id: descriptor.run_id,
            state: self.state.clone(),
            handler: self.exec_handler.clone(),
            running: self.container_running,
            open_ports: self.open_ports.clone(),
            dead: false,
        }))
    }

    async fn build_image(&self, build: &ImageBuild) -> Result<ImageBuildOutput, ExecutionError> {
        self.state.lock().unwrap().builds.push(build.clone());
        self.builds.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ImageBuildOutput {
                success: true,
                log: "Successfully built".to_string(),
                error: None,
            })
        })
    }

    async fn remove_image(&self, tag: &str) -> Result<(), CleanupWarning> {
        self.state.lock().unwrap().removed_images.push(tag.to_string());
        Ok(())
    }

    async fn health(&self, _image: &str) -> RuntimeHealth {
        self.health.clone()
    }

    async fn leftover_containers(&self, run_id: &Uuid) -> Result<Vec<String>, ExecutionError> {
        let state = self.state.lock().unwrap();
        let live = state.live.get(run_id).copied().unwrap_or(0);
        Ok((0..live).map(|i| format!("{}-{}", run_id, i)).collect())
    }
}

struct FakeSession {
    index: usize,
    run_id: Uuid,
    state: Arc<Mutex<FakeState>>,
    handler: ExecHandler,
    running: bool,
    open_ports: Vec<u16>,
    dead: bool,
}

#[async_trait]
impl ContainerSession for FakeSession {
    fn container_id(&self) -> &str {
        "fake-container"
    }

    async fn exec(
        &mut self,
        command: &[String],
        _env: &[String],
        _timeout: Duration,
    ) -> Result<RawRunResult, ExecutionError> {
        if self.dead {
            return Err(ExecutionError::ContainerRuntime {
                exit_code: None,
                message: "session container is no longer running".to_string(),
            });
        }
        self.state.lock().unwrap().sessions[self.index]
            .execs
            .push(command.to_vec());
        // Let concurrent runs interleave as they would against a daemon
        tokio::task::yield_now().await;

        let result = (self.handler)(command);
        if result.timed_out {
            self.dead = true;
        }
        Ok(result)
    }

    async fn write_file(
        &mut self,
        path: &str,
        contents: &str,
        _timeout: Duration,
    ) -> Result<(), ExecutionError> {
        self.state.lock().unwrap().sessions[self.index]
            .files
            .insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, ExecutionError> {
        Ok(self.running && !self.dead)
    }

    async fn probe_port(&self, port: u16, _timeout: Duration) -> bool {
        self.open_ports.contains(&port)
    }

    async fn close(self: Box<Self>) -> Vec<CleanupWarning> {
        let mut state = self.state.lock().unwrap();
        state.sessions[self.index].closed = true;
        state.open_sessions = state.open_sessions.saturating_sub(1);
        if let Some(live) = state.live.get_mut(&self.run_id) {
            *live = live.saturating_sub(1);
        }
        Vec::new()
    }
}
