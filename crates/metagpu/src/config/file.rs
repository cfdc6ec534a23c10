use core::error::Error;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use api_types::VisibilityLevel;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use crate::auth::methods;

#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read configuration file {path}")]
    Read { path: String },
    #[display("Failed to parse configuration")]
    Parse,
    #[display("Invalid configuration: {reason}")]
    Invalid { reason: String },
    #[display("Failed to watch configuration directory {path}")]
    Watch { path: String },
}

impl Error for ConfigError {}

/// Plugin configuration file.
///
/// ```yaml
/// resourceName: cnvrg.io/metagpu
/// metaGpusPerDevice: 4
/// jwtSecret: topsecret
/// visibility:
///   methodLevels:
///     KillGpuProcess: l0
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetaGpuConfig {
    /// Extended resource advertised to the kubelet
    pub resource_name: String,
    /// Number of metagpu units carved out of every healthy device
    pub meta_gpus_per_device: u32,
    pub device_cache_ttl_secs: u64,
    pub processes_discovery_period_secs: u64,
    pub stream_interval_millis: u64,
    pub allocation_sync_period_secs: u64,
    /// HMAC secret used to verify caller tokens
    pub jwt_secret: String,
    pub visibility: VisibilityConfig,
}

impl Default for MetaGpuConfig {
    fn default() -> Self {
        Self {
            resource_name: "cnvrg.io/metagpu".to_string(),
            meta_gpus_per_device: 2,
            device_cache_ttl_secs: 5,
            processes_discovery_period_secs: 5,
            stream_interval_millis: 1000,
            allocation_sync_period_secs: 10,
            jwt_secret: String::new(),
            visibility: VisibilityConfig::default(),
        }
    }
}

/// Minimum visibility level required per management method.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisibilityConfig {
    pub method_levels: BTreeMap<String, VisibilityLevel>,
}

impl VisibilityConfig {
    /// Level needed to call `method` (short name), unknown methods need device level.
    pub fn minimum_level(&self, method: &str) -> VisibilityLevel {
        self.method_levels
            .get(method)
            .copied()
            .unwrap_or_else(|| default_method_level(method))
    }
}

fn default_method_level(method: &str) -> VisibilityLevel {
    match method {
        methods::LIST_DEVICE_PROCESSES_NAME | methods::STREAM_DEVICE_PROCESSES_NAME => {
            VisibilityLevel::Process
        }
        methods::KILL_GPU_PROCESS_NAME => VisibilityLevel::Container,
        _ => VisibilityLevel::Device,
    }
}

impl MetaGpuConfig {
    /// Reads, parses and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let content = std::fs::read_to_string(path).change_context(ConfigError::Read {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&content).attach_printable_lazy(|| format!("file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self, Report<ConfigError>> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content).change_context(ConfigError::Parse)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |reason: String| Err(Report::new(ConfigError::Invalid { reason }));

        match self.resource_name.split_once('/') {
            Some((domain, name)) if !domain.is_empty() && !name.is_empty() => {}
            _ => {
                return invalid(format!(
                    "resourceName '{}' must have the form <domain>/<name>",
                    self.resource_name
                ))
            }
        }
        if self.meta_gpus_per_device == 0 {
            return invalid("metaGpusPerDevice must be at least 1".to_string());
        }
        if self.device_cache_ttl_secs == 0 {
            return invalid("deviceCacheTtlSecs must be at least 1".to_string());
        }
        if self.processes_discovery_period_secs == 0 {
            return invalid("processesDiscoveryPeriodSecs must be at least 1".to_string());
        }
        if self.allocation_sync_period_secs == 0 {
            return invalid("allocationSyncPeriodSecs must be at least 1".to_string());
        }
        if self.stream_interval_millis < 100 {
            return invalid("streamIntervalMillis must be at least 100".to_string());
        }
        if self.jwt_secret.trim().is_empty() {
            return invalid("jwtSecret is required".to_string());
        }
        if let Some(unknown) = self
            .visibility
            .method_levels
            .keys()
            .find(|method| !methods::is_managed(method))
        {
            return invalid(format!(
                "visibility.methodLevels names unknown method '{unknown}'"
            ));
        }
        Ok(())
    }

    pub fn device_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.device_cache_ttl_secs)
    }

    pub fn processes_discovery_period(&self) -> Duration {
        Duration::from_secs(self.processes_discovery_period_secs)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_millis)
    }

    pub fn allocation_sync_period(&self) -> Duration {
        Duration::from_secs(self.allocation_sync_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn mapping_with_only_secret_uses_defaults() {
        let config = MetaGpuConfig::from_yaml("jwtSecret: s3cr3t\n").expect("should load");

        assert_eq!(
            config,
            MetaGpuConfig {
                jwt_secret: "s3cr3t".to_string(),
                ..MetaGpuConfig::default()
            }
        );
        assert_eq!(config.stream_interval(), Duration::from_secs(1));
    }

    #[test]
    fn missing_secret_is_rejected() {
        let result = MetaGpuConfig::from_yaml("metaGpusPerDevice: 4\n");

        let err = result.expect_err("secret is required");
        assert!(
            matches!(err.current_context(), ConfigError::Invalid { .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn zero_fraction_is_rejected() {
        let result = MetaGpuConfig::from_yaml("jwtSecret: x\nmetaGpusPerDevice: 0\n");

        assert!(result.is_err(), "fraction of zero must be rejected");
    }

    #[test]
    fn resource_name_without_domain_is_rejected() {
        let result = MetaGpuConfig::from_yaml("jwtSecret: x\nresourceName: metagpu\n");

        assert!(result.is_err(), "resource name needs a domain");
    }

    #[test]
    fn unknown_method_level_key_is_rejected() {
        let yaml = "jwtSecret: x\nvisibility:\n  methodLevels:\n    DropTables: l0\n";

        assert!(MetaGpuConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn method_levels_fall_back_per_method() {
        let yaml = "jwtSecret: x\nvisibility:\n  methodLevels:\n    KillGpuProcess: device\n";

        let config = MetaGpuConfig::from_yaml(yaml).expect("should load");

        assert_eq!(
            config.visibility.minimum_level("KillGpuProcess"),
            VisibilityLevel::Device
        );
        assert_eq!(
            config.visibility.minimum_level("ListDeviceProcesses"),
            VisibilityLevel::Process
        );
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "jwtSecret: x\nmetaGpusPerDevice: 8\n").expect("should write");

        let config = MetaGpuConfig::load(&path).expect("should load");

        assert_eq!(config.meta_gpus_per_device, 8);
    }
}
