//! Container lifecycle management.
//!
//! Drives a container through `Creating -> Running -> Stopped -> Deleted`.
//! The server applies state changes asynchronously, so every transition is
//! confirmed by polling the container's status.

use crate::config::Timing;
use crate::lxd::{ContainerStatus, ExecRequest, LxdApi, LxdError};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle timing.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Status polls before a wait gives up
    pub poll_attempts: u32,
    /// Delay between status polls
    pub poll_interval: Duration,
    /// How long a started container may take to run commands
    pub readiness_timeout: Duration,
    /// Delay between readiness probes
    pub readiness_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&Timing::default())
    }
}

impl From<&Timing> for LifecycleConfig {
    fn from(timing: &Timing) -> Self {
        Self {
            poll_attempts: timing.poll_attempts,
            poll_interval: timing.poll_interval,
            readiness_timeout: timing.readiness_timeout,
            readiness_interval: timing.readiness_interval,
        }
    }
}

/// Lifecycle state of a container managed by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Creating,
    Running,
    Stopped,
    Deleted,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Creating => write!(f, "creating"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Deleted => write!(f, "deleted"),
        }
    }
}

/// A container and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    name: String,
    state: ContainerState,
}

impl Container {
    /// Refer to a container that was brought up earlier, e.g. by another
    /// process, so it can be torn down.
    pub fn attach_running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ContainerState::Running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }
}

/// Container lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to create container {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: LxdError,
    },

    #[error("Failed to start container {name}: {source}")]
    Start {
        name: String,
        #[source]
        source: LxdError,
    },

    #[error("Failed to stop container {name}: {source}")]
    Stop {
        name: String,
        #[source]
        source: LxdError,
    },

    #[error("Failed to delete container {name}: {source}")]
    Delete {
        name: String,
        #[source]
        source: LxdError,
    },

    #[error("Failed to query container {name}: {source}")]
    Status {
        name: String,
        #[source]
        source: LxdError,
    },

    /// Operation not allowed from the container's current state
    #[error("Cannot {operation} container {name} while {state}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: ContainerState,
    },

    /// Status polling gave up
    #[error("Container {name} not {target} after {attempts} status checks")]
    Timeout {
        name: String,
        target: ContainerStatus,
        attempts: u32,
    },

    /// Container runs but does not execute commands
    #[error("Container {name} not ready after {waited:?}")]
    NotReady { name: String, waited: Duration },

    #[error("Operation on container {name} cancelled")]
    Cancelled { name: String },
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Generate a unique container name: the prefix and 128 random bits as hex.
pub fn generate_name(prefix: &str) -> String {
    format!("{}-{:032x}", prefix, rand::rng().random::<u128>())
}

/// Creates, polls and destroys containers.
pub struct ContainerLifecycleManager {
    api: Arc<dyn LxdApi>,
    config: LifecycleConfig,
}

impl ContainerLifecycleManager {
    pub fn new(api: Arc<dyn LxdApi>, config: LifecycleConfig) -> Self {
        Self { api, config }
    }

    /// Create a container from an image.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Create`] if the server rejects the container.
    pub async fn create(&self, name: &str, fingerprint: &str) -> Result<Container> {
        info!("Creating container {} from image {}", name, fingerprint);

        self.api
            .create_container(name, fingerprint)
            .await
            .map_err(|source| LifecycleError::Create {
                name: name.to_string(),
                source,
            })?;

        Ok(Container {
            name: name.to_string(),
            state: ContainerState::Creating,
        })
    }

    /// Request a freshly created container to start.
    ///
    /// Confirms the request only; use [`wait_until`](Self::wait_until) to
    /// confirm the container is running.
    pub async fn start(&self, container: &mut Container) -> Result<()> {
        expect_state(container, ContainerState::Creating, "start")?;
        info!("Starting container {}", container.name);

        self.api
            .start_container(&container.name)
            .await
            .map_err(|source| LifecycleError::Start {
                name: container.name.clone(),
                source,
            })?;

        container.state = ContainerState::Running;
        Ok(())
    }

    /// Request a running container to stop.
    pub async fn stop(&self, container: &mut Container) -> Result<()> {
        expect_state(container, ContainerState::Running, "stop")?;
        info!("Stopping container {}", container.name);

        self.api
            .stop_container(&container.name)
            .await
            .map_err(|source| LifecycleError::Stop {
                name: container.name.clone(),
                source,
            })?;

        container.state = ContainerState::Stopped;
        Ok(())
    }

    /// Delete a stopped container.
    pub async fn delete(&self, container: &mut Container) -> Result<()> {
        expect_state(container, ContainerState::Stopped, "delete")?;
        info!("Deleting container {}", container.name);

        self.api
            .delete_container(&container.name)
            .await
            .map_err(|source| LifecycleError::Delete {
                name: container.name.clone(),
                source,
            })?;

        container.state = ContainerState::Deleted;
        Ok(())
    }

    /// Poll until the container reports `target`.
    ///
    /// Returns `false` once `max_attempts` polls did not observe the target.
    /// Failed status queries count as attempts.
    pub async fn wait_for(
        &self,
        container: &Container,
        target: &ContainerStatus,
        max_attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled(container));
            }

            match self.api.container_status(&container.name).await {
                Ok(status) if &status == target => {
                    debug!("Container {} is {}", container.name, status);
                    return Ok(true);
                }
                Ok(status) => debug!(
                    "Container {} is {}, waiting for {} ({}/{})",
                    container.name, status, target, attempt, max_attempts
                ),
                Err(e) => debug!(
                    "Status of container {} unavailable ({}/{}): {}",
                    container.name, attempt, max_attempts, e
                ),
            }

            if attempt < max_attempts {
                pause(container, interval, cancel).await?;
            }
        }

        Ok(false)
    }

    /// Poll with the configured attempts and interval until the container
    /// reports `target`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Timeout`] if the target is never observed.
    pub async fn wait_until(
        &self,
        container: &Container,
        target: ContainerStatus,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reached = self
            .wait_for(
                container,
                &target,
                self.config.poll_attempts,
                self.config.poll_interval,
                cancel,
            )
            .await?;

        if reached {
            Ok(())
        } else {
            Err(LifecycleError::Timeout {
                name: container.name.clone(),
                target,
                attempts: self.config.poll_attempts,
            })
        }
    }

    /// Wait until a running container executes commands.
    ///
    /// Runs `true` inside the container until it exits 0 or the readiness
    /// timeout elapses.
    pub async fn probe_ready(&self, container: &Container, cancel: &CancellationToken) -> Result<()> {
        expect_state(container, ContainerState::Running, "probe")?;

        let started = Instant::now();
        let deadline = started + self.config.readiness_timeout;
        let mut probes = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(container));
            }

            probes += 1;
            match self.probe(&container.name).await {
                Ok(true) => {
                    info!(
                        "Container {} ready after {} probe(s) in {:?}",
                        container.name,
                        probes,
                        started.elapsed()
                    );
                    return Ok(());
                }
                Ok(false) => debug!("Container {} not ready yet", container.name),
                Err(e) => debug!("Readiness probe on {} failed: {}", container.name, e),
            }

            if Instant::now() + self.config.readiness_interval > deadline {
                return Err(LifecycleError::NotReady {
                    name: container.name.clone(),
                    waited: started.elapsed(),
                });
            }

            pause(container, self.config.readiness_interval, cancel).await?;
        }
    }

    async fn probe(&self, name: &str) -> std::result::Result<bool, LxdError> {
        let handle = self
            .api
            .execute_command(name, &ExecRequest::detached(vec!["true".to_string()]))
            .await?;
        let status = self.api.operation_status(&handle.operation_id).await?;
        Ok(status.exit_code == Some(0))
    }

    /// Remove a container regardless of where its lifecycle stopped.
    ///
    /// Stops the container if the server reports it as anything but stopped,
    /// then deletes it. A container the server does not know counts as
    /// deleted.
    pub async fn discard(&self, container: &mut Container) -> Result<()> {
        if container.state == ContainerState::Deleted {
            return Ok(());
        }

        let status = match self.api.container_status(&container.name).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => {
                debug!("Container {} already gone", container.name);
                container.state = ContainerState::Deleted;
                return Ok(());
            }
            Err(source) => {
                return Err(LifecycleError::Status {
                    name: container.name.clone(),
                    source,
                });
            }
        };

        if status != ContainerStatus::Stopped {
            warn!("Discarding container {} ({})", container.name, status);
            self.api
                .stop_container(&container.name)
                .await
                .map_err(|source| LifecycleError::Stop {
                    name: container.name.clone(),
                    source,
                })?;
            self.wait_until(container, ContainerStatus::Stopped, &CancellationToken::new())
                .await?;
        }

        container.state = ContainerState::Stopped;
        self.delete(container).await
    }
}

fn expect_state(
    container: &Container,
    expected: ContainerState,
    operation: &'static str,
) -> Result<()> {
    if container.state == expected {
        Ok(())
    } else {
        Err(LifecycleError::InvalidState {
            name: container.name.clone(),
            operation,
            state: container.state,
        })
    }
}

fn cancelled(container: &Container) -> LifecycleError {
    LifecycleError::Cancelled {
        name: container.name.clone(),
    }
}

async fn pause(container: &Container, interval: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled(container)),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}
