//! config.rs - Sync configuration, validated at construction.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which kind of remote relay this device talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Neutral,
    GoogleAppdata,
    OnedriveApproot,
    IcloudCloudkit,
    CloudManaged,
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Neutral
    }
}

/// Which device class this instance runs as, used only to pick defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

/// Validated sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub auto_sync_interval_seconds: u32,
    pub background_sync_interval_seconds: u32,
    pub push_limit: u32,
    pub pull_limit: u32,
    pub max_pull_pages: u32,
    pub provider: Provider,
    pub push_url: Option<String>,
    pub pull_url: Option<String>,
}

impl SyncConfig {
    /// Defaults matching the reference desktop profile.
    pub fn desktop_defaults() -> Self {
        Self {
            auto_sync_interval_seconds: 60,
            background_sync_interval_seconds: 300,
            push_limit: 200,
            pull_limit: 200,
            max_pull_pages: 5,
            provider: Provider::Neutral,
            push_url: None,
            pull_url: None,
        }
    }

    /// Defaults matching the reference mobile profile.
    pub fn mobile_defaults() -> Self {
        Self {
            auto_sync_interval_seconds: 120,
            background_sync_interval_seconds: 600,
            push_limit: 120,
            pull_limit: 120,
            max_pull_pages: 3,
            provider: Provider::Neutral,
            push_url: None,
            pull_url: None,
        }
    }

    pub fn for_device_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Desktop => Self::desktop_defaults(),
            DeviceClass::Mobile => Self::mobile_defaults(),
        }
    }

    /// Validates every range and cross-field rule. Never mutates `self`;
    /// callers decide whether to clamp or reject.
    pub fn validate(&self) -> Result<()> {
        in_range(
            "auto_sync_interval_seconds",
            self.auto_sync_interval_seconds,
            15,
            3600,
        )?;
        in_range(
            "background_sync_interval_seconds",
            self.background_sync_interval_seconds,
            30,
            7200,
        )?;
        if self.background_sync_interval_seconds < self.auto_sync_interval_seconds {
            return Err(Error::Validation(
                "background_sync_interval_seconds must be >= auto_sync_interval_seconds"
                    .to_string(),
            ));
        }
        in_range("push_limit", self.push_limit, 20, 500)?;
        in_range("pull_limit", self.pull_limit, 20, 500)?;
        in_range("max_pull_pages", self.max_pull_pages, 1, 20)?;

        match (&self.push_url, &self.pull_url) {
            (None, None) => {}
            (Some(push), Some(pull)) => {
                require_http_url("push_url", push)?;
                require_http_url("pull_url", pull)?;
            }
            _ => {
                return Err(Error::Validation(
                    "SYNC_ENDPOINTS_REQUIRE_BOTH: push_url and pull_url must both be set or both empty"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn in_range(field: &str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(Error::Validation(format!(
            "{field} must be in [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

fn require_http_url(field: &str, value: &str) -> Result<()> {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(Error::Validation(format!(
            "{field} must be an http(s) URL, got {value:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_defaults_validate() {
        SyncConfig::desktop_defaults().validate().unwrap();
    }

    #[test]
    fn mobile_defaults_validate() {
        SyncConfig::mobile_defaults().validate().unwrap();
    }

    #[test]
    fn rejects_one_sided_endpoints() {
        let mut cfg = SyncConfig::desktop_defaults();
        cfg.push_url = Some("https://example.com/push".to_string());
        cfg.pull_url = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_http_url() {
        let mut cfg = SyncConfig::desktop_defaults();
        cfg.push_url = Some("ftp://example.com/push".to_string());
        cfg.pull_url = Some("https://example.com/pull".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_push_limit() {
        let mut cfg = SyncConfig::desktop_defaults();
        cfg.push_limit = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_background_interval_below_auto_interval() {
        let mut cfg = SyncConfig::desktop_defaults();
        cfg.auto_sync_interval_seconds = 600;
        cfg.background_sync_interval_seconds = 300;
        assert!(cfg.validate().is_err());
    }
}
