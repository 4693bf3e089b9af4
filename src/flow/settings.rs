use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{GateError, Result};

/// Framework settings
///
/// Missing keys take their defaults when loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Include expressions and causes in error responses
    pub verbose_errors: bool,

    /// Upper bound of the per-request identity cache
    pub entity_cache_capacity: usize,

    /// Page size used when a load asks for pagination without a limit
    pub default_page_size: usize,

    /// Largest accepted page size
    pub max_page_size: usize,

    /// Emit audit messages on commit
    pub audit_enabled: bool,

    /// Requests slower than this are logged as warnings
    pub slow_request_threshold: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            verbose_errors: false,
            entity_cache_capacity: 1024,
            default_page_size: 500,
            max_page_size: 10000,
            audit_enabled: true,
            slow_request_threshold: Duration::from_secs(5),
        }
    }
}

impl GateSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    pub fn entity_cache_capacity(mut self, capacity: usize) -> Self {
        self.entity_cache_capacity = capacity;
        self
    }

    pub fn default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size;
        self
    }

    pub fn max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn audit_enabled(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn slow_request_threshold(mut self, threshold: Duration) -> Self {
        self.slow_request_threshold = threshold;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| GateError::InvalidConfiguration(format!("settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity_cache_capacity == 0 {
            return Err(GateError::InvalidConfiguration(
                "entity_cache_capacity must be > 0".into(),
            ));
        }
        if self.max_page_size == 0 {
            return Err(GateError::InvalidConfiguration("max_page_size must be > 0".into()));
        }
        if self.default_page_size > self.max_page_size {
            return Err(GateError::InvalidConfiguration(
                "default_page_size cannot exceed max_page_size".into(),
            ));
        }
        Ok(())
    }
}
