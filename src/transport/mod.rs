//! # Streaming Execution Transport
//!
//! Runs shell commands inside a build host and streams their output into a
//! log sink as they run.
//!
//! ## Core Components
//!
//! - **[`LxdTransport`]**: per-host transport with `exec`, `upload` and
//!   `download`
//! - **[`command`]**: login-shell command lines and the session environment
//! - **[`sanitize`]**: line ending normalization and escape sequence removal
//!   for terminal output
//!
//! ## Execution Flow
//!
//! ```text
//!   exec(command, dir)
//!         ↓
//!   execute_command (interactive, wait-for-websocket)
//!         ↓
//!   operation id + stream secret
//!         ↓
//!   connect {wss}/1.0/operations/{id}/websocket?secret=...
//!         ↓
//!   pump task: data → sanitize → log sink
//!         ↓                ↑
//!   empty frame / close    deadline / cancel → stop
//!         ↓
//!   operation_status → exit code
//! ```
//!
//! A non-zero exit code is not an error: `exec` returns `Ok(false)` and the
//! code is available from [`LxdTransport::last_exit_code`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use lxd_buildhost::builder::{BuildRequest, Provisioner};
//! use lxd_buildhost::config::LxdConfig;
//! use lxd_buildhost::lxd::{LxdClient, WebSocketConnector};
//! use lxd_buildhost::transport::{LogSink, LxdTransport};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LxdConfig::new("https://lxd.example.com:8443")?;
//!     let client = Arc::new(LxdClient::from_config(&config)?);
//!     let connector = Arc::new(WebSocketConnector::from_config(&config)?);
//!
//!     let provisioner = Provisioner::new(client.clone(), &config);
//!     let host = provisioner.acquire(&BuildRequest::new()).await?;
//!
//!     let log: LogSink = Arc::new(Mutex::new(tokio::io::stdout()));
//!     let mut transport = LxdTransport::new(client, connector, &host, log)
//!         .with_exec_timeout(config.timing.exec_timeout);
//!     let passed = transport.exec("make test", Some("/root/src")).await?;
//!     println!("passed: {}, exit code: {:?}", passed, transport.last_exit_code());
//!
//!     provisioner.release(&host).await;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod sanitize;

pub use sanitize::{OutputSanitizer, sanitize};

use crate::builder::BuildHost;
use crate::config::Timing;
use crate::lxd::channel::stream_url;
use crate::lxd::{ChannelConnector, ChannelEvent, ExecChannel, ExecRequest, LxdApi, LxdError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Destination of sanitized command output.
pub type LogSink = Arc<Mutex<dyn AsyncWrite + Send + Unpin>>;

/// How long the output pump gets to wind down after being told to stop.
const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The LXD API rejected a request
    #[error("LXD API error: {0}")]
    Api(#[source] LxdError),

    /// The output channel could not be opened
    #[error("Output channel error: {0}")]
    Channel(#[source] LxdError),

    /// Writing to the log sink failed
    #[error("Log sink error: {0}")]
    Log(#[source] std::io::Error),

    /// The final status of the command could not be read
    #[error("Failed to read exit status: {0}")]
    Status(#[source] LxdError),

    /// Command exceeded its deadline
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command cancelled")]
    Cancelled,

    /// The server accepted the exec but returned no output stream
    #[error("Operation {0} has no output stream")]
    MissingStreamSecret(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Command transport into one build host.
pub struct LxdTransport {
    api: Arc<dyn LxdApi>,
    connector: Arc<dyn ChannelConnector>,
    container: String,
    workspace: String,
    log: LogSink,
    env: HashMap<String, String>,
    exec_timeout: Option<Duration>,
    last_exit_code: Option<i64>,
    last_exit_signal: Option<i64>,
}

impl LxdTransport {
    /// Create a transport into an acquired build host.
    pub fn new(
        api: Arc<dyn LxdApi>,
        connector: Arc<dyn ChannelConnector>,
        host: &BuildHost,
        log: LogSink,
    ) -> Self {
        Self::for_container(api, connector, &host.host, &host.workspace, log)
    }

    /// Create a transport into a named container.
    ///
    /// Commands get the default exec timeout; see
    /// [`with_exec_timeout`](Self::with_exec_timeout).
    pub fn for_container(
        api: Arc<dyn LxdApi>,
        connector: Arc<dyn ChannelConnector>,
        container: &str,
        workspace: &str,
        log: LogSink,
    ) -> Self {
        Self {
            api,
            connector,
            container: container.to_string(),
            workspace: workspace.to_string(),
            log,
            env: HashMap::new(),
            exec_timeout: Timing::default().exec_timeout,
            last_exit_code: None,
            last_exit_signal: None,
        }
    }

    /// Limit how long a single command may run. `None` lets commands run
    /// forever.
    pub fn with_exec_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout
    }

    /// Set the caller environment for subsequent commands. `HOME` and `TERM`
    /// are always overridden.
    pub fn set_env(&mut self, env: HashMap<String, String>) {
        self.env = env;
    }

    /// Exit code of the last completed command.
    pub fn last_exit_code(&self) -> Option<i64> {
        self.last_exit_code
    }

    /// Signal that terminated the last completed command, if reported.
    pub fn last_exit_signal(&self) -> Option<i64> {
        self.last_exit_signal
    }

    /// Run a command, streaming its output to the log sink.
    ///
    /// Returns whether the command exited with code 0.
    ///
    /// # Errors
    ///
    /// Returns error if the command cannot be submitted, its output cannot be
    /// streamed, it exceeds the exec timeout, or its exit status cannot be
    /// read.
    pub async fn exec(&mut self, command: &str, working_directory: Option<&str>) -> Result<bool> {
        self.exec_with_cancel(command, working_directory, &CancellationToken::new())
            .await
    }

    /// [`exec`](Self::exec), abandoning the command when `cancel` fires.
    pub async fn exec_with_cancel(
        &mut self,
        command: &str,
        working_directory: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let session = Uuid::new_v4();
        self.last_exit_code = None;
        self.last_exit_signal = None;

        info!("[{}] {}: {}", session, self.container, command);

        let request = ExecRequest::streaming(
            command::build_command(command, working_directory),
            command::merge_env(&self.env, &self.workspace),
        );
        let handle = self
            .api
            .execute_command(&self.container, &request)
            .await
            .map_err(ExecutionError::Api)?;

        let secret = handle
            .stream_secret
            .as_deref()
            .ok_or_else(|| ExecutionError::MissingStreamSecret(handle.operation_id.clone()))?;
        let url = stream_url(self.api.base_url(), &handle.operation_id, secret)
            .map_err(ExecutionError::Channel)?;
        let channel = self
            .connector
            .connect(&url)
            .await
            .map_err(ExecutionError::Channel)?;

        let stop = CancellationToken::new();
        let mut pump_task = tokio::spawn(pump(channel, self.log.clone(), stop.clone(), session));

        let exec_timeout = self.exec_timeout;
        let deadline = async move {
            match exec_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let interrupted = tokio::select! {
            joined = &mut pump_task => {
                joined.map_err(std::io::Error::from)??;
                None
            }
            _ = deadline => Some(ExecutionError::Timeout(exec_timeout.unwrap_or_default())),
            _ = cancel.cancelled() => Some(ExecutionError::Cancelled),
        };

        if let Some(error) = interrupted {
            warn!("[{}] {} on {}, closing output stream", session, error, self.container);
            stop.cancel();
            if tokio::time::timeout(PUMP_SHUTDOWN_GRACE, &mut pump_task)
                .await
                .is_err()
            {
                pump_task.abort();
            }
            return Err(error);
        }

        let status = self
            .api
            .operation_status(&handle.operation_id)
            .await
            .map_err(ExecutionError::Status)?;

        self.last_exit_code = status.exit_code;
        self.last_exit_signal = status.exit_signal;
        debug!(
            "[{}] finished with {} (exit code {:?})",
            session, status.status, status.exit_code
        );

        Ok(status.exit_code == Some(0))
    }

    /// Copy everything `reader` yields to `remote_path` in the host.
    pub async fn upload<R>(&self, mut reader: R, remote_path: &str) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        debug!("Uploading {} bytes to {}:{}", data.len(), self.container, remote_path);
        self.api
            .push_file(&self.container, remote_path, data)
            .await
            .map_err(ExecutionError::Api)
    }

    /// Copy `remote_path` from the host into `writer`.
    pub async fn download<W>(&self, remote_path: &str, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let data = self
            .api
            .pull_file(&self.container, remote_path)
            .await
            .map_err(ExecutionError::Api)?;

        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Forward channel output to the log sink until the channel ends or `stop`
/// fires.
async fn pump(
    mut channel: Box<dyn ExecChannel>,
    log: LogSink,
    stop: CancellationToken,
    session: Uuid,
) -> Result<()> {
    let mut sanitizer = OutputSanitizer::new();

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => {
                close_channel(channel.as_mut(), session).await;
                break;
            }
            event = channel.next_event() => event,
        };

        match event {
            Some(ChannelEvent::Opened) => debug!("[{}] output stream opened", session),
            Some(ChannelEvent::Data(data)) if data.is_empty() => {
                debug!("[{}] end of output", session);
                close_channel(channel.as_mut(), session).await;
                break;
            }
            Some(ChannelEvent::Data(data)) => write_log(&log, &sanitizer.push(&data)).await?,
            Some(ChannelEvent::Closed(reason)) => {
                debug!("[{}] output stream closed: {:?}", session, reason);
                break;
            }
            Some(ChannelEvent::Error(message)) => {
                debug!("[{}] output stream error: {}", session, message)
            }
            None => break,
        }
    }

    write_log(&log, &sanitizer.finish()).await?;
    log.lock().await.flush().await.map_err(ExecutionError::Log)
}

async fn close_channel(channel: &mut dyn ExecChannel, session: Uuid) {
    if let Err(e) = channel.close().await {
        debug!("[{}] closing output stream failed: {}", session, e);
    }
}

async fn write_log(log: &LogSink, text: &str) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }

    log.lock()
        .await
        .write_all(text.as_bytes())
        .await
        .map_err(ExecutionError::Log)
}
