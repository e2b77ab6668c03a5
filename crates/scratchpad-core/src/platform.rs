//! Execution platforms.
//!
//! A [`Platform`] names the architecture and runtime a worker is launched
//! under. It is chosen by the user and decides which worker binary runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Processor architecture of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86,
    X64,
}

/// Runtime flavour of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Desktop,
    Core,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86 => write!(f, "x86"),
            Self::X64 => write!(f, "x64"),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Desktop => write!(f, "desktop"),
            Self::Core => write!(f, "core"),
        }
    }
}

/// Architecture/runtime combination a worker runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Human-readable name.
    pub name: String,
    pub architecture: Architecture,
    pub runtime: RuntimeKind,
    /// Optional runtime version (e.g. "8.0").
    pub runtime_version: Option<String>,
}

impl Platform {
    pub fn new(
        architecture: Architecture,
        runtime: RuntimeKind,
        runtime_version: Option<String>,
    ) -> Self {
        let name = match &runtime_version {
            Some(v) => format!("{} {} ({})", runtime, v, architecture),
            None => format!("{} ({})", runtime, architecture),
        };
        Self {
            name,
            architecture,
            runtime,
            runtime_version,
        }
    }

    /// Default platform for the running machine.
    pub fn host() -> Self {
        let architecture = if cfg!(target_pointer_width = "32") {
            Architecture::X86
        } else {
            Architecture::X64
        };
        Self::new(architecture, RuntimeKind::Core, None)
    }

    /// All platforms a worker can be requested for.
    pub fn known() -> Vec<Self> {
        vec![
            Self::new(Architecture::X64, RuntimeKind::Core, None),
            Self::new(Architecture::X86, RuntimeKind::Core, None),
            Self::new(Architecture::X64, RuntimeKind::Desktop, None),
            Self::new(Architecture::X86, RuntimeKind::Desktop, None),
        ]
    }

    /// Short identifier, e.g. `x64-core` or `x64-core-8.0`.
    pub fn short_id(&self) -> String {
        match &self.runtime_version {
            Some(v) => format!("{}-{}-{}", self.architecture, self.runtime, v),
            None => format!("{}-{}", self.architecture, self.runtime),
        }
    }

    /// Worker executable name for this platform, without extension.
    ///
    /// The host-native combination uses the plain name; every other
    /// combination has its own binary.
    pub fn worker_binary_name(&self) -> String {
        let native = Self::host();
        if self.architecture == native.architecture && self.runtime == native.runtime {
            "scratchpad-worker".to_string()
        } else {
            format!("scratchpad-worker-{}-{}", self.architecture, self.runtime)
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');

        let architecture = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("x86") => Architecture::X86,
            Some("x64") => Architecture::X64,
            other => {
                return Err(Error::Config(format!(
                    "unknown architecture {:?} in platform '{}'",
                    other.unwrap_or_default(),
                    s
                )));
            }
        };

        let runtime = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("core") | None => RuntimeKind::Core,
            Some("desktop") => RuntimeKind::Desktop,
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown runtime '{}' in platform '{}'",
                    other, s
                )));
            }
        };

        let runtime_version = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self::new(architecture, runtime, runtime_version))
    }
}
