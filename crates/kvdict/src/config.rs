//! Configuration for dictionary handles

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Form;

/// Default initial map size in bytes; the smallest size that is always safe.
pub const DEFAULT_MAP_SIZE: u64 = 8192;

/// Default staleness grace period in seconds.
pub const DEFAULT_STALE_GRACE_SECS: u64 = 100;

/// Configuration for dictionary handles.
///
/// Built once at process start and passed to every open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DictConfig {
    /// Initial memory map size for new databases. When a map fills up it is
    /// doubled, and other processes pick up the change.
    pub map_size: u64,

    /// Log engine size transitions.
    pub verbose: bool,

    /// Form written by a handle that has not yet seen either form.
    pub default_form: Form,

    /// A source file newer than the database only triggers a warning once
    /// it is older than this many seconds.
    pub stale_grace_secs: u64,
}

impl Default for DictConfig {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            verbose: false,
            default_form: Form::Bare,
            stale_grace_secs: DEFAULT_STALE_GRACE_SECS,
        }
    }
}

impl DictConfig {
    /// Set the initial map size
    #[must_use]
    pub const fn with_map_size(mut self, size: u64) -> Self {
        self.map_size = size;
        self
    }

    /// Enable or disable size-transition logging
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the form written by undecided handles
    #[must_use]
    pub const fn with_default_form(mut self, form: Form) -> Self {
        self.default_form = form;
        self
    }

    /// Set the staleness grace period
    #[must_use]
    pub const fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace_secs = grace.as_secs();
        self
    }

    /// Staleness grace period.
    pub const fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DictConfig::default();
        assert_eq!(config.map_size, 8192);
        assert!(!config.verbose);
        assert_eq!(config.default_form, Form::Bare);
        assert_eq!(config.stale_grace(), Duration::from_secs(100));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DictConfig =
            serde_json::from_str(r#"{"map_size": 65536, "default_form": "terminated"}"#)
                .expect("parse");
        assert_eq!(config.map_size, 65536);
        assert_eq!(config.default_form, Form::Terminated);
        assert_eq!(config.stale_grace_secs, DEFAULT_STALE_GRACE_SECS);
    }

    #[test]
    fn test_builder() {
        let config = DictConfig::default()
            .with_map_size(1 << 20)
            .with_verbose(true)
            .with_default_form(Form::Terminated)
            .with_stale_grace(Duration::from_secs(5));
        assert_eq!(config.map_size, 1 << 20);
        assert!(config.verbose);
        assert_eq!(config.stale_grace_secs, 5);
    }
}
