//! Build host acquisition and release.

use super::image::ImageResolver;
use super::lifecycle::{
    Container, ContainerLifecycleManager, LifecycleConfig, LifecycleError, generate_name,
};
use super::{
    AcquisitionError, BuildHost, BuildRequest, ReleaseOutcome, TeardownError, TeardownStage,
    parse_os,
};
use crate::config::LxdConfig;
use crate::env;
use crate::lxd::{ContainerStatus, ImageSource, LxdApi};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Transports a provisioned host can be reached with.
const TRANSPORTS: &[&str] = &[env::host::TRANSPORT_KIND];

/// Acquires and releases build hosts.
///
/// A provisioner can serve concurrent acquisitions; they share the image
/// resolver, so an image needed by several builds is fetched once.
pub struct Provisioner {
    resolver: ImageResolver,
    lifecycle: ContainerLifecycleManager,
    instance_name: String,
    default_distro: String,
    default_release: String,
}

impl Provisioner {
    pub fn new(api: Arc<dyn LxdApi>, config: &LxdConfig) -> Self {
        let source = ImageSource {
            server: config.image_server.clone(),
            protocol: config.image_protocol.clone(),
        };

        Self {
            resolver: ImageResolver::new(api.clone(), source),
            lifecycle: ContainerLifecycleManager::new(api, LifecycleConfig::from(&config.timing)),
            instance_name: config.instance_name.clone(),
            default_distro: config.default_distro.clone(),
            default_release: config.default_release.clone(),
        }
    }

    /// Transport kinds hosts from this provisioner accept.
    pub fn transports(&self) -> &'static [&'static str] {
        TRANSPORTS
    }

    /// Acquire a build host.
    ///
    /// Resolves the requested OS image, creates a uniquely named container
    /// from it, starts it, waits for it to run and to execute commands.
    ///
    /// # Errors
    ///
    /// Returns [`AcquisitionError`] if any step fails. A container created
    /// before the failure is discarded first.
    pub async fn acquire(&self, request: &BuildRequest) -> Result<BuildHost, AcquisitionError> {
        self.acquire_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// [`acquire`](Self::acquire), giving up when `cancel` fires.
    pub async fn acquire_with_cancel(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildHost, AcquisitionError> {
        let (distro, release) = parse_os(
            request.os.as_deref(),
            &self.default_distro,
            &self.default_release,
        );
        let alias = ImageResolver::alias_for(&distro, &release);

        let image = self.resolver.resolve(&alias).await?;
        let name = generate_name(&self.instance_name);
        let mut container = self.lifecycle.create(&name, &image.fingerprint).await?;

        if let Err(e) = self.bring_up(&mut container, cancel).await {
            warn!("Acquisition of {} failed, discarding container: {}", name, e);
            if let Err(discard) = self.lifecycle.discard(&mut container).await {
                error!("Failed to discard container {}: {}", name, discard);
            }
            return Err(e.into());
        }

        info!("Build host {} ready ({} {})", name, distro, release);

        Ok(BuildHost {
            host: name.clone(),
            name,
            username: env::host::USERNAME.to_string(),
            workspace: env::host::WORKSPACE.to_string(),
            distro,
            release,
            transports: TRANSPORTS.iter().map(|t| t.to_string()).collect(),
            acquired_at: Utc::now(),
        })
    }

    async fn bring_up(
        &self,
        container: &mut Container,
        cancel: &CancellationToken,
    ) -> super::lifecycle::Result<()> {
        self.lifecycle.start(container).await?;
        self.lifecycle
            .wait_until(container, ContainerStatus::Running, cancel)
            .await?;
        self.lifecycle.probe_ready(container, cancel).await
    }

    /// Stop and delete a build host.
    ///
    /// Never fails: teardown errors are logged and reported in the outcome.
    pub async fn release(&self, host: &BuildHost) -> ReleaseOutcome {
        let mut container = Container::attach_running(&host.host);

        match self.teardown(&mut container).await {
            Ok(()) => {
                info!("Released build host {}", host.host);
                ReleaseOutcome::Released
            }
            Err((stage, source)) => {
                let failure = TeardownError {
                    host: host.host.clone(),
                    stage,
                    source,
                };
                error!("{}", failure);
                ReleaseOutcome::Failed(failure)
            }
        }
    }

    async fn teardown(
        &self,
        container: &mut Container,
    ) -> Result<(), (TeardownStage, LifecycleError)> {
        self.lifecycle
            .stop(container)
            .await
            .map_err(|e| (TeardownStage::Stop, e))?;
        self.lifecycle
            .wait_until(container, ContainerStatus::Stopped, &CancellationToken::new())
            .await
            .map_err(|e| (TeardownStage::WaitStopped, e))?;
        self.lifecycle
            .delete(container)
            .await
            .map_err(|e| (TeardownStage::Delete, e))
    }
}
