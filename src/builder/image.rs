//! OS image resolution.
//!
//! Images are looked up by alias (`<distro>/<release>`) on the LXD host
//! first. When the host does not know the alias, the image is pulled from the
//! configured image server and the alias is registered against it, so later
//! builds find it locally.

use crate::lxd::{ImageSource, LxdApi, LxdError};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A resolved image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub alias: String,
    pub fingerprint: String,
}

/// Image resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// Neither the local lookup nor the remote fetch produced an image
    #[error("Image {alias} unavailable (lookup: {lookup}): {fetch}")]
    Unavailable {
        alias: String,
        lookup: String,
        #[source]
        fetch: LxdError,
    },
}

/// Resolves OS aliases to image fingerprints.
///
/// Resolutions are memoised for the lifetime of the resolver. Concurrent
/// first-time resolutions of the same alias are serialized so the image is
/// fetched once.
pub struct ImageResolver {
    api: Arc<dyn LxdApi>,
    source: ImageSource,
    resolved: DashMap<String, String>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ImageResolver {
    pub fn new(api: Arc<dyn LxdApi>, source: ImageSource) -> Self {
        Self {
            api,
            source,
            resolved: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Image alias for a distro and release.
    pub fn alias_for(distro: &str, release: &str) -> String {
        format!("{}/{}", distro, release)
    }

    /// Previously resolved reference for an alias, if any.
    pub fn cached(&self, alias: &str) -> Option<ImageReference> {
        self.resolved
            .get(alias)
            .map(|fingerprint| ImageReference {
                alias: alias.to_string(),
                fingerprint: fingerprint.value().clone(),
            })
    }

    /// Resolve an alias to an image present on the LXD host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::Unavailable`] if the alias is unknown to the
    /// host and the image cannot be fetched from the image server.
    pub async fn resolve(&self, alias: &str) -> Result<ImageReference, ResolutionError> {
        if let Some(reference) = self.cached(alias) {
            return Ok(reference);
        }

        let lock = self
            .in_flight
            .entry(alias.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(reference) = self.cached(alias) {
            return Ok(reference);
        }

        let reference = self.lookup_or_fetch(alias).await?;
        self.resolved
            .insert(alias.to_string(), reference.fingerprint.clone());
        Ok(reference)
    }

    async fn lookup_or_fetch(&self, alias: &str) -> Result<ImageReference, ResolutionError> {
        let lookup = match self.api.image_by_alias(alias).await {
            Ok(found) => {
                debug!("Image {} found locally as {}", alias, found.target);
                return Ok(ImageReference {
                    alias: alias.to_string(),
                    fingerprint: found.target,
                });
            }
            Err(e) if e.is_not_found() => {
                debug!("Image {} not present locally", alias);
                e.to_string()
            }
            Err(e) => {
                warn!("Image alias lookup for {} failed, fetching instead: {}", alias, e);
                e.to_string()
            }
        };

        info!(
            "Fetching image {} from {} ({})",
            alias, self.source.server, self.source.protocol
        );

        let image = self
            .api
            .create_image_from_remote(&self.source, alias)
            .await
            .map_err(|fetch| ResolutionError::Unavailable {
                alias: alias.to_string(),
                lookup,
                fetch,
            })?;

        if let Err(e) = self.api.create_image_alias(&image.fingerprint, alias).await {
            warn!(
                "Fetched image {} but could not register alias {}: {}",
                image.fingerprint, alias, e
            );
        } else {
            info!("Registered image {} as {}", image.fingerprint, alias);
        }

        Ok(ImageReference {
            alias: alias.to_string(),
            fingerprint: image.fingerprint,
        })
    }
}
