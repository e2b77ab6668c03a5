//! Configuration for the execution core.
//!
//! Defaults match interactive use. Front ends build a [`ScratchpadConfig`]
//! with [`ScratchpadConfig::from_env`] and override fields as needed.

use std::path::PathBuf;
use std::time::Duration;

use crate::platform::Platform;

/// Environment variable pointing at the worker binary.
pub const WORKER_PATH_ENV: &str = "SCRATCHPAD_WORKER_PATH";

/// Environment variable overriding the package cache directory.
pub const PACKAGE_CACHE_ENV: &str = "SCRATCHPAD_PACKAGE_CACHE";

/// Environment variable naming a local package feed directory.
pub const PACKAGE_FEED_ENV: &str = "SCRATCHPAD_PACKAGE_FEED";

/// Environment variable holding an external restore command line.
pub const PACKAGE_COMMAND_ENV: &str = "SCRATCHPAD_PACKAGE_COMMAND";

/// Default time the worker has to report `Ready`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a cooperative cancel has before the worker is killed.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the record channel between the pump and the consumer.
/// When full, the pump stops reading and the worker blocks on its writes.
pub const DEFAULT_RECORD_BUFFER: usize = 256;

/// Worker supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Explicit worker binary; discovery is used when `None`.
    pub worker_path: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub cancel_grace: Duration,
    /// Time a worker gets to exit after `Shutdown` before it is killed.
    pub shutdown_grace: Duration,
    pub record_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            shutdown_grace: Duration::from_millis(500),
            record_buffer: DEFAULT_RECORD_BUFFER,
        }
    }
}

/// Package resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Root of the local package cache.
    pub cache_dir: PathBuf,
    /// Local feed to install packages from, if any.
    pub feed_dir: Option<PathBuf>,
    /// External restore command, program first. Arguments may use `{id}`,
    /// `{version}` and `{dest}`. Takes precedence over `feed_dir`.
    pub restore_command: Option<Vec<String>>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_package_cache(),
            feed_dir: None,
            restore_command: None,
        }
    }
}

/// Per-document coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub platform: Platform,
    /// Start every run in a fresh worker process.
    pub fresh_worker_per_run: bool,
    /// Capacity of each subscriber channel.
    pub subscriber_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            platform: Platform::host(),
            fresh_worker_per_run: false,
            subscriber_buffer: DEFAULT_RECORD_BUFFER,
        }
    }
}

/// All settings of the execution core.
#[derive(Debug, Clone, Default)]
pub struct ScratchpadConfig {
    pub supervisor: SupervisorConfig,
    pub resolver: ResolverConfig,
    pub coordinator: CoordinatorConfig,
}

impl ScratchpadConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides from `lookup`; blank values are ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = var(WORKER_PATH_ENV) {
            config.supervisor.worker_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var(PACKAGE_CACHE_ENV) {
            config.resolver.cache_dir = PathBuf::from(path);
        }
        if let Some(path) = var(PACKAGE_FEED_ENV) {
            config.resolver.feed_dir = Some(PathBuf::from(path));
        }
        if let Some(line) = var(PACKAGE_COMMAND_ENV) {
            config.resolver.restore_command =
                Some(line.split_whitespace().map(str::to_string).collect());
        }

        config
    }
}

/// `<user cache dir>/scratchpad/packages`, or a temp dir fallback.
pub fn default_package_cache() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("scratchpad")
        .join("packages")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ScratchpadConfig::default();
        assert_eq!(config.supervisor.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.supervisor.cancel_grace, Duration::from_secs(2));
        assert_eq!(config.supervisor.record_buffer, DEFAULT_RECORD_BUFFER);
        assert!(!config.coordinator.fresh_worker_per_run);
        assert!(config.resolver.cache_dir.ends_with("scratchpad/packages"));
        assert!(config.resolver.restore_command.is_none());
    }

    #[test]
    fn test_overrides_from_vars() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (PACKAGE_CACHE_ENV, "/tmp/cache"),
            (PACKAGE_FEED_ENV, "  "),
            (PACKAGE_COMMAND_ENV, "restore-tool  install {id}=={version} --out {dest}"),
        ]);
        let config = ScratchpadConfig::from_vars(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.resolver.cache_dir, PathBuf::from("/tmp/cache"));
        assert!(config.resolver.feed_dir.is_none());
        assert_eq!(
            config.resolver.restore_command,
            Some(vec![
                "restore-tool".to_string(),
                "install".to_string(),
                "{id}=={version}".to_string(),
                "--out".to_string(),
                "{dest}".to_string(),
            ])
        );
        assert!(config.supervisor.worker_path.is_none());
    }
}
