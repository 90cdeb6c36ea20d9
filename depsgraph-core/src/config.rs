//! Graph Configuration
//!
//! Behaviour switches and debug output selection for a graph. The defaults
//! match what an interactive session wants; `DEPSGRAPH_DEBUG` turns on extra
//! diagnostics without recompiling.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Environment variable read by [`GraphConfig::from_env`].
pub const DEBUG_ENV_VAR: &str = "DEPSGRAPH_DEBUG";

bitflags! {
    /// Which stages emit verbose diagnostics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DebugFlags: u32 {
        const BUILD = 1 << 0;
        const TAG   = 1 << 1;
        const EVAL  = 1 << 2;
        const COW   = 1 << 3;
    }
}

impl DebugFlags {
    /// Parse a comma separated list such as `build,tag` or `all`.
    ///
    /// Unknown names are ignored.
    pub fn parse(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .fold(DebugFlags::empty(), |flags, name| {
                flags
                    | match name.to_ascii_lowercase().as_str() {
                        "build" => DebugFlags::BUILD,
                        "tag" => DebugFlags::TAG,
                        "eval" => DebugFlags::EVAL,
                        "cow" => DebugFlags::COW,
                        "all" => DebugFlags::all(),
                        _ => DebugFlags::empty(),
                    }
            })
    }
}

/// Per-graph configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Reset per-flush state on the rayon pool.
    pub parallel_reset: bool,
    /// Drop no-op operations nothing depends on after building relations.
    pub remove_unused_noops: bool,
    pub debug: DebugFlags,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            parallel_reset: true,
            remove_unused_noops: true,
            debug: DebugFlags::empty(),
        }
    }
}

impl GraphConfig {
    /// Default configuration with debug flags taken from the environment.
    pub fn from_env() -> Self {
        let debug = std::env::var(DEBUG_ENV_VAR)
            .map(|value| DebugFlags::parse(&value))
            .unwrap_or_default();
        Self {
            debug,
            ..Self::default()
        }
    }
}
