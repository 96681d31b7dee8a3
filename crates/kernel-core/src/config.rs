//! Kernel-wide configuration: the default `Options` that a subscription
//! falls back to when the host doesn't override them, plus state store
//! retention/GC tunables.
//!
//! Loadable from layered TOML + environment overrides via the `config`
//! crate, with canonical defaults layered under environment-specific
//! overrides — but `KernelConfig::default()` always works with no file
//! present, since the kernel must not require one to function (no
//! persisted state, no required env vars).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-engine default options, overridable per subscription at `subscribe` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDefaults {
    pub worker_count: usize,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub continue_on_error: bool,
}

impl Default for EventDefaults {
    fn default() -> Self {
        EventDefaults {
            worker_count: 10,
            timeout: Duration::from_secs(30),
            continue_on_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub worker_count: usize,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub continue_on_error: bool,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        TaskDefaults {
            worker_count: 10,
            timeout: Duration::from_secs(5 * 60),
            continue_on_error: true,
            max_retries: 0,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// State store retention and sweep cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreDefaults {
    #[serde(with = "duration_secs")]
    pub gc_interval: Duration,
    #[serde(with = "duration_secs")]
    pub retention: Duration,
}

impl Default for StateStoreDefaults {
    fn default() -> Self {
        StateStoreDefaults {
            gc_interval: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(30 * 60),
        }
    }
}

/// The progress-reporting tick cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressDefaults {
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
}

impl Default for ProgressDefaults {
    fn default() -> Self {
        ProgressDefaults {
            tick_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub events: EventDefaults,
    pub tasks: TaskDefaults,
    pub state_store: StateStoreDefaults,
    pub progress: ProgressDefaults,
}

impl KernelConfig {
    /// Load configuration by layering `kernel.toml` (if present) under
    /// `KERNEL_` prefixed environment overrides, falling back to
    /// [`KernelConfig::default`] entirely when neither is present.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("kernel").required(false))
            .add_source(config::Environment::with_prefix("KERNEL").separator("__"));
        match builder.build() {
            Ok(built) => built.try_deserialize(),
            Err(err) => Err(err),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
