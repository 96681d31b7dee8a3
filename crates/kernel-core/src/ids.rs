//! Identifiers attached to task publications.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fresh, unique identifier minted per task publish.
///
/// Backed by a UUIDv7 so that identifiers sort roughly by creation time,
/// which is convenient for log correlation and for the state store's GC
/// sweep ordering, without the kernel needing to store a separate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Mint a fresh task id.
    pub fn new() -> Self {
        TaskId(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        TaskId(uuid)
    }
}

/// Opaque correlation id attached to a task publication (organisation,
/// tenant, or any other caller-defined grouping). The kernel never inspects
/// its contents — it is only ever compared for equality when filtering
/// observers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtensionId(String);

impl ExtensionId {
    pub fn new(value: impl Into<String>) -> Self {
        ExtensionId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExtensionId {
    fn from(value: &str) -> Self {
        ExtensionId(value.to_string())
    }
}

impl From<String> for ExtensionId {
    fn from(value: String) -> Self {
        ExtensionId(value)
    }
}
