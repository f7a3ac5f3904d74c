//! Runtime configuration

use serde::{Deserialize, Serialize};

/// Default name of the standard device-side helper module
pub const DEFAULT_STDLIB: &str = "libpulse.vso";

/// Configuration for a [`crate::Runtime`]
///
/// Every field has a sensible default; `from_env` layers process-environment
/// overrides on top, which is how deployments tune a runtime they do not
/// construct themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Name or path of the standard helper module loaded into every context
    pub stdlib: String,
    /// Per-context worker-count cap; 0 means "use the device core count"
    pub workers: usize,
    /// Report every still-live allocation when a context is destroyed
    pub mem_trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stdlib: DEFAULT_STDLIB.to_string(),
            workers: 0,
            mem_trace: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `PULSE_STDLIB`, `PULSE_NUM_WORKERS` and
    /// `PULSE_MEM_TRACE`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(stdlib) = std::env::var("PULSE_STDLIB") {
            if !stdlib.is_empty() {
                config.stdlib = stdlib;
            }
        }
        if let Ok(workers) = std::env::var("PULSE_NUM_WORKERS") {
            if let Ok(n) = workers.parse() {
                config.workers = n;
            }
        }
        if let Ok(trace) = std::env::var("PULSE_MEM_TRACE") {
            config.mem_trace = trace != "0" && !trace.is_empty();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stdlib, DEFAULT_STDLIB);
        assert_eq!(config.workers, 0);
        assert!(!config.mem_trace);
    }
}
