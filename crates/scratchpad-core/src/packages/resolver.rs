//! Making referenced packages available before a run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared, try_join_all};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::execute::CancelToken;
use crate::record::ResultRecord;

use super::cache::PackageCache;
use super::directive::{self, PackageReference};
use super::source::{CommandPackageSource, LocalFeedSource, NoPackageSource, PackageSource};

type Install = Shared<BoxFuture<'static, std::result::Result<PathBuf, String>>>;

/// Ensures packages referenced by scripts are present in the local cache.
///
/// Concurrent requests for the same id and version share one installation;
/// unrelated packages install in parallel.
pub struct PackageResolver {
    cache: PackageCache,
    source: Arc<dyn PackageSource>,
    in_flight: Arc<Mutex<FxHashMap<String, Install>>>,
}

impl PackageResolver {
    pub fn new(cache: PackageCache, source: Arc<dyn PackageSource>) -> Self {
        Self {
            cache,
            source,
            in_flight: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Resolver over the configured cache, installing with the configured
    /// restore command, else from the configured feed.
    pub fn from_config(config: &ResolverConfig) -> Self {
        let command = config
            .restore_command
            .as_deref()
            .and_then(CommandPackageSource::from_command_line);
        let source: Arc<dyn PackageSource> = match (command, &config.feed_dir) {
            (Some(command), _) => Arc::new(command),
            (None, Some(feed)) => Arc::new(LocalFeedSource::new(feed)),
            (None, None) => Arc::new(NoPackageSource),
        };
        tracing::debug!(source = %source.describe(), "package source selected");
        Self::new(PackageCache::new(&config.cache_dir), source)
    }

    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    /// Package references among a script's `#r` directives.
    pub fn extract_references<S: AsRef<str>>(directives: &[S]) -> Vec<PackageReference> {
        directive::extract_references(directives)
    }

    /// Make every referenced package available.
    ///
    /// Returns the install directories in reference order. Packages already in
    /// the cache cost nothing; the rest install in parallel and the first
    /// failure ends the request with [`Error::DependencyResolution`]. Installs
    /// the request stops waiting on still run to completion and stay in the
    /// cache. Progress notices go to `progress`.
    pub async fn ensure_available(
        &self,
        references: &[PackageReference],
        cancel: &CancelToken,
        progress: Option<&mpsc::Sender<ResultRecord>>,
    ) -> Result<Vec<PathBuf>> {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let missing: Vec<&PackageReference> = references
            .iter()
            .filter(|r| !self.cache.is_installed(r))
            .collect();

        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|r| r.to_string()).collect();
            tracing::info!(count = missing.len(), "restoring packages: {}", names.join(", "));
            notify(
                progress,
                format!("Restoring {} package(s): {}", missing.len(), names.join(", ")),
            )
            .await;

            let installs: Vec<_> = missing
                .iter()
                .map(|reference| {
                    let install = self.install_shared(reference);
                    let reference = (*reference).clone();
                    async move {
                        install
                            .await
                            .map_err(|message| Error::DependencyResolution {
                                package_id: reference.id.clone(),
                                message,
                            })?;
                        notify(progress, format!("Restored {}", reference)).await;
                        Ok::<_, Error>(())
                    }
                })
                .collect();

            let result = tokio::select! {
                result = try_join_all(installs) => result.map(|_| ()),
                _ = cancel.canceled() => Err(Error::Canceled),
            };

            if let Err(e) = result {
                tracing::warn!("package restore failed: {}", e);
                return Err(e);
            }
        }

        Ok(references
            .iter()
            .map(|r| self.cache.package_dir(r))
            .collect())
    }

    /// The shared installation of `reference`.
    ///
    /// Each install runs as its own task and leaves the in-flight map when it
    /// finishes, so it outlives every request that stops waiting on it.
    fn install_shared(&self, reference: &PackageReference) -> Install {
        let key = reference.key();
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = in_flight.get(&key) {
            tracing::debug!(package = %reference, "joining in-flight install");
            return existing.clone();
        }

        let cache = self.cache.clone();
        let source = Arc::clone(&self.source);
        let registry = Arc::clone(&self.in_flight);
        let reference = reference.clone();
        let install_key = key.clone();

        let task = tokio::spawn(async move {
            let result = install_one(&cache, source.as_ref(), &reference)
                .await
                .map_err(|e| match e {
                    Error::DependencyResolution { message, .. } => message,
                    other => other.to_string(),
                });
            let mut in_flight = match registry.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            in_flight.remove(&install_key);
            result
        });

        let install = async move {
            task.await
                .unwrap_or_else(|e| Err(format!("install task failed: {}", e)))
        }
        .boxed()
        .shared();

        in_flight.insert(key, install.clone());
        install
    }
}

async fn install_one(
    cache: &PackageCache,
    source: &dyn PackageSource,
    reference: &PackageReference,
) -> Result<PathBuf> {
    // Another resolver or process may have finished it meanwhile.
    if cache.is_installed(reference) {
        return Ok(cache.package_dir(reference));
    }

    tracing::debug!(package = %reference, source = %source.describe(), "installing package");
    let dest = cache.prepare(reference).await?;
    source.install(reference, &dest).await?;
    let dir = cache.mark_complete(reference).await?;
    tracing::info!(package = %reference, "package installed");
    Ok(dir)
}

async fn notify(progress: Option<&mpsc::Sender<ResultRecord>>, message: String) {
    if let Some(progress) = progress {
        let _ = progress.send(ResultRecord::restore(message, false)).await;
    }
}
