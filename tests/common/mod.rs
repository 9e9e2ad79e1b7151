//! In-memory LXD server and output channel shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use lxd_buildhost::config::LxdConfig;
use lxd_buildhost::lxd::{
    ChannelConnector, ChannelEvent, ContainerStatus, ExecChannel, ExecHandle, ExecRequest,
    ImageAlias, ImageInfo, ImageSource, LxdApi, LxdError, OperationStatus, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub const API: &str = "https://lxd.test:8443";

/// Configuration with timings short enough for tests.
pub fn fast_config() -> LxdConfig {
    let mut config = LxdConfig::new(API).unwrap();
    config.timing.poll_attempts = 5;
    config.timing.poll_interval = Duration::from_millis(5);
    config.timing.readiness_timeout = Duration::from_millis(200);
    config.timing.readiness_interval = Duration::from_millis(5);
    config
}

/// Mutable server state and failure switches.
#[derive(Default)]
pub struct FakeState {
    /// Aliases registered on the LXD host
    pub aliases: HashMap<String, String>,
    /// Images the remote image server offers, by alias
    pub remote_images: HashMap<String, String>,
    pub containers: HashMap<String, ContainerStatus>,
    pub files: HashMap<(String, String), Vec<u8>>,
    pub exec_requests: Vec<(String, ExecRequest)>,
    /// Every API call as `"<method> <argument>"`
    pub calls: Vec<String>,

    pub fail_lookup: bool,
    pub fail_alias_registration: bool,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub fail_delete: bool,
    /// Start is accepted but the container never reaches Running
    pub start_never_runs: bool,
    pub omit_stream_secret: bool,
    pub fetch_delay: Duration,

    /// Exit codes of successive readiness probes; 0 once exhausted
    pub probe_exit_codes: VecDeque<i64>,
    /// Exit code of streamed commands
    pub exec_exit_code: i64,
    pub exec_exit_signal: Option<i64>,

    operations: HashMap<String, i64>,
    next_operation: usize,
}

pub struct FakeLxd {
    base: Url,
    pub state: Mutex<FakeState>,
}

impl FakeLxd {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Url::parse(API).unwrap(),
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn with(configure: impl FnOnce(&mut FakeState)) -> Arc<Self> {
        let fake = Self::new();
        configure(&mut fake.state.lock().unwrap());
        fake
    }

    pub fn with_running_container(name: &str) -> Arc<Self> {
        Self::with(|state| {
            state
                .containers
                .insert(name.to_string(), ContainerStatus::Running);
        })
    }

    /// Number of calls to `method`.
    pub fn calls_to(&self, method: &str) -> usize {
        let prefix = format!("{} ", method);
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    pub fn container(&self, name: &str) -> Option<ContainerStatus> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn last_exec(&self) -> Option<(String, ExecRequest)> {
        self.state.lock().unwrap().exec_requests.last().cloned()
    }

    fn record(&self, method: &str, argument: &str) -> std::sync::MutexGuard<'_, FakeState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", method, argument));
        state
    }
}

fn rejected(message: &str) -> LxdError {
    LxdError::Api {
        status: 500,
        message: message.to_string(),
    }
}

#[async_trait]
impl LxdApi for FakeLxd {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn image_by_alias(&self, alias: &str) -> Result<ImageAlias> {
        let state = self.record("image_by_alias", alias);
        if state.fail_lookup {
            return Err(rejected("alias index unavailable"));
        }

        state
            .aliases
            .get(alias)
            .map(|target| ImageAlias {
                name: alias.to_string(),
                target: target.clone(),
            })
            .ok_or_else(|| LxdError::NotFound(alias.to_string()))
    }

    async fn create_image_from_remote(
        &self,
        source: &ImageSource,
        alias: &str,
    ) -> Result<ImageInfo> {
        let delay = {
            let state = self.record("create_image_from_remote", alias);
            assert_eq!(source.protocol, "simplestreams");
            state.fetch_delay
        };
        tokio::time::sleep(delay).await;

        let state = self.state.lock().unwrap();
        state
            .remote_images
            .get(alias)
            .map(|fingerprint| ImageInfo {
                fingerprint: fingerprint.clone(),
            })
            .ok_or_else(|| rejected("image not on remote server"))
    }

    async fn create_image_alias(&self, fingerprint: &str, alias: &str) -> Result<()> {
        let mut state = self.record("create_image_alias", alias);
        if state.fail_alias_registration {
            return Err(rejected("alias registration failed"));
        }
        state
            .aliases
            .insert(alias.to_string(), fingerprint.to_string());
        Ok(())
    }

    async fn create_container(&self, name: &str, _fingerprint: &str) -> Result<()> {
        let mut state = self.record("create_container", name);
        if state.fail_create {
            return Err(rejected("create failed"));
        }
        state
            .containers
            .insert(name.to_string(), ContainerStatus::Stopped);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut state = self.record("start_container", name);
        if state.fail_start {
            return Err(rejected("start failed"));
        }
        if !state.start_never_runs {
            state
                .containers
                .insert(name.to_string(), ContainerStatus::Running);
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.record("stop_container", name);
        if state.fail_stop {
            return Err(rejected("stop failed"));
        }
        match state.containers.get_mut(name) {
            Some(status) => {
                *status = ContainerStatus::Stopped;
                Ok(())
            }
            None => Err(LxdError::NotFound(name.to_string())),
        }
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete_container", name);
        if state.fail_delete {
            return Err(rejected("delete failed"));
        }
        match state.containers.get(name) {
            Some(ContainerStatus::Stopped) => {
                state.containers.remove(name);
                Ok(())
            }
            Some(_) => Err(LxdError::Api {
                status: 400,
                message: "container is running".to_string(),
            }),
            None => Err(LxdError::NotFound(name.to_string())),
        }
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus> {
        let state = self.record("container_status", name);
        state
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| LxdError::NotFound(name.to_string()))
    }

    async fn execute_command(&self, name: &str, request: &ExecRequest) -> Result<ExecHandle> {
        let mut state = self.record("execute_command", name);
        if state.containers.get(name) != Some(&ContainerStatus::Running) {
            return Err(LxdError::Api {
                status: 400,
                message: "container is not running".to_string(),
            });
        }

        state.next_operation += 1;
        let id = format!("op-{}", state.next_operation);
        let exit_code = if request.command == ["true"] {
            state.probe_exit_codes.pop_front().unwrap_or(0)
        } else {
            state.exec_exit_code
        };
        state.operations.insert(id.clone(), exit_code);
        state
            .exec_requests
            .push((name.to_string(), request.clone()));

        let stream_secret = (request.interactive && !state.omit_stream_secret)
            .then(|| format!("secret-{}", state.next_operation));

        Ok(ExecHandle {
            operation_id: id,
            stream_secret,
        })
    }

    async fn operation_status(&self, operation_id: &str) -> Result<OperationStatus> {
        let state = self.record("operation_status", operation_id);
        let exit_code = *state
            .operations
            .get(operation_id)
            .ok_or_else(|| LxdError::NotFound(operation_id.to_string()))?;

        Ok(OperationStatus {
            status: "Success".to_string(),
            exit_code: Some(exit_code),
            exit_signal: state.exec_exit_signal,
        })
    }

    async fn push_file(&self, name: &str, path: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.record("push_file", path);
        state
            .files
            .insert((name.to_string(), path.to_string()), data);
        Ok(())
    }

    async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.record("pull_file", path);
        state
            .files
            .get(&(name.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| LxdError::NotFound(path.to_string()))
    }
}

/// One scripted step of a fake output channel.
#[derive(Debug, Clone)]
pub enum Step {
    Event(ChannelEvent),
    /// Block until the channel is dropped
    Hang,
}

pub fn data(text: &str) -> Step {
    Step::Event(ChannelEvent::Data(text.as_bytes().to_vec()))
}

pub fn bytes(raw: &[u8]) -> Step {
    Step::Event(ChannelEvent::Data(raw.to_vec()))
}

pub fn opened() -> Step {
    Step::Event(ChannelEvent::Opened)
}

pub fn end_of_output() -> Step {
    Step::Event(ChannelEvent::Data(Vec::new()))
}

/// Connector handing out channels that replay scripts in order.
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub urls: Mutex<Vec<Url>>,
    pub delivered: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn with_script(steps: Vec<Step>) -> Arc<Self> {
        let connector = Self::default();
        connector.scripts.lock().unwrap().push_back(steps);
        Arc::new(connector)
    }

    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn ExecChannel>> {
        self.urls.lock().unwrap().push(url.clone());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LxdError::UnexpectedResponse("no scripted channel".to_string()))?;

        Ok(Box::new(FakeChannel {
            steps: steps.into(),
            delivered: self.delivered.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct FakeChannel {
    steps: VecDeque<Step>,
    delivered: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ExecChannel for FakeChannel {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        match self.steps.pop_front() {
            Some(Step::Event(event)) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                Some(event)
            }
            Some(Step::Hang) => std::future::pending().await,
            None => None,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
