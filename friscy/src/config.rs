//! The host-facing configuration surface: what a boot needs beyond the
//! rootfs tar bytes themselves, serialized the way `libkrun`'s `VzSpec`
//! is (`examples/orbstack-swift-nio/src/libkrun/src/lib.rs`) so an embedder
//! can hand this over as one JSON blob.

use serde::{Deserialize, Serialize};

fn default_rows() -> u32 {
    24
}

fn default_cols() -> u32 {
    80
}

/// Everything `GuestState::new` needs besides the raw rootfs tar bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestConfig {
    /// `argv[0]` is resolved against the VFS and loaded as the main binary.
    pub argv: Vec<String>,
    #[serde(default)]
    pub envp: Vec<String>,
    #[serde(default = "default_rows")]
    pub term_rows: u32,
    #[serde(default = "default_cols")]
    pub term_cols: u32,
    /// See spec.md's open question on `futex(WAIT)` with no other runnable
    /// thread: `false` (the default) returns immediately instead of
    /// deadlocking the single host thread (resolved in DESIGN.md).
    #[serde(default)]
    pub strict_futex_deadlock: bool,
}

impl GuestConfig {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
