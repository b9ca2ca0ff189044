//! Event bus configuration.

use serde::{Deserialize, Serialize};

/// Listener limit applied to new buses.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Behavior flags for an [`EventBus`](super::EventBus).
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-event listener count above which a leak warning is logged.
    /// `0` disables the check.
    pub max_listeners: usize,

    /// Register a given listener at most once per event.
    pub dedup_listeners: bool,

    /// Report duplicate registrations to lifecycle observers.
    pub emit_duplicate_diagnostics: bool,

    /// Route failures of asynchronous listeners to the rejection hook
    /// instead of logging them as unhandled.
    pub capture_rejections: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_listeners: DEFAULT_MAX_LISTENERS,
            dedup_listeners: false,
            emit_duplicate_diagnostics: false,
            capture_rejections: false,
        }
    }
}

impl BusConfig {
    /// Configuration used by the runtime's internal buses: unbounded and
    /// deduplicating.
    pub fn internal() -> Self {
        Self {
            max_listeners: 0,
            dedup_listeners: true,
            ..Self::default()
        }
    }
}
