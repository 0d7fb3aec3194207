//! Provider configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{ProviderError, ProviderResult};
use crate::variant::VariantKind;
use crate::wait::WaitObj;

/// How outstanding operations are driven to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Progress runs only inside application calls on CQs and counters.
    #[default]
    Manual,
    /// A background thread per domain drains completions.
    Auto,
}

/// Configuration for a provider domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Transport variant whose wire conventions are decoded.
    pub variant: VariantKind,
    /// Lock tiers up to and including this level are taken (0..=2).
    pub lock_level: u8,
    /// Progress scheduling policy.
    pub progress: ProgressMode,
    /// Background poll timeout and blocking-wait re-progress period.
    pub progress_interval_us: u64,
    /// Maximum raw completions drained per context per progress call.
    pub progress_batch: usize,
    /// CQ size used when the caller asks for zero.
    pub cq_default_size: usize,
    /// Transfer entries added to a pool each time it grows.
    pub xfer_pool_chunk: usize,
    /// Largest payload accepted by inject operations.
    pub inject_size: usize,
    /// Wait object substituted when the caller leaves it unspecified.
    pub default_wait: WaitObj,
    /// Largest single registration segment.
    pub max_mr_size: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            variant: VariantKind::Stream,
            lock_level: 2,
            progress: ProgressMode::Manual,
            progress_interval_us: 1000,
            progress_batch: 64,
            cq_default_size: 1024,
            xfer_pool_chunk: 16,
            inject_size: 64,
            default_wait: WaitObj::PollFd,
            max_mr_size: 64 * 1024 * 1024,
        }
    }
}

impl ProviderConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> ProviderResult<Self> {
        let config: ProviderConfig = serde_json::from_str(text)
            .map_err(|e| ProviderError::invalid(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the provider cannot run with.
    pub fn validate(&self) -> ProviderResult<()> {
        if self.lock_level > 2 {
            return Err(ProviderError::invalid(format!(
                "lock_level {} out of range 0..=2",
                self.lock_level
            )));
        }
        if self.progress_batch == 0 {
            return Err(ProviderError::invalid("progress_batch must be non-zero"));
        }
        if self.cq_default_size == 0 {
            return Err(ProviderError::invalid("cq_default_size must be non-zero"));
        }
        if self.xfer_pool_chunk == 0 {
            return Err(ProviderError::invalid("xfer_pool_chunk must be non-zero"));
        }
        if matches!(self.default_wait, WaitObj::Unspec) {
            return Err(ProviderError::invalid("default_wait must be concrete"));
        }
        Ok(())
    }

    /// Returns the configuration the domain actually runs with.
    ///
    /// An automatic progress thread means at least two threads touch the
    /// domain, so tier 1 locks are forced on.
    pub fn effective(&self) -> Self {
        let mut config = self.clone();
        if config.progress == ProgressMode::Auto && config.lock_level < 1 {
            info!(
                requested = config.lock_level,
                "auto progress raises lock level to 1"
            );
            config.lock_level = 1;
        }
        config
    }

    /// Background poll timeout and blocking-wait slice.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_micros(self.progress_interval_us.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.cq_default_size, 1024);
        assert_eq!(config.lock_level, 2);
        assert_eq!(config.default_wait, WaitObj::PollFd);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            ProviderConfig::from_json(r#"{"lock_level": 0, "progress": "auto"}"#).unwrap();
        assert_eq!(config.lock_level, 0);
        assert_eq!(config.progress, ProgressMode::Auto);
        assert_eq!(config.inject_size, 64);
    }

    #[test]
    fn test_from_json_variant() {
        let config = ProviderConfig::from_json(r#"{"variant": "datagram"}"#).unwrap();
        assert_eq!(config.variant, VariantKind::Datagram);
    }

    #[test]
    fn test_invalid_lock_level() {
        let err = ProviderConfig::from_json(r#"{"lock_level": 3}"#).unwrap_err();
        assert_eq!(err.errno(), crate::error::errno::EINVAL);
    }

    #[test]
    fn test_malformed_json() {
        assert!(ProviderConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_effective_auto_raises_lock_level() {
        let config = ProviderConfig {
            lock_level: 0,
            progress: ProgressMode::Auto,
            ..Default::default()
        };
        assert_eq!(config.effective().lock_level, 1);

        let manual = ProviderConfig {
            lock_level: 0,
            ..Default::default()
        };
        assert_eq!(manual.effective().lock_level, 0);
    }
}
