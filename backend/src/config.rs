// 配置加载
// JSON configuration: device registry, polling jobs and their rule tables

use crate::decode::{wire_address, WordOrder};
use crate::devices::{DecodeKind, DeviceEndpoint, DeviceRegistry, RegisterSpec};
use crate::error::ConfigError;
use crate::normalizer::{ActivePowerPolicy, FieldSpec, Normalizer};
use crate::orchestrator::ReadingOrchestrator;
use crate::poll_core::PollJob;
use crate::trigger::Schedule;
use crate::types::Granularity;
use anyhow::{Context, Result};
use chrono::FixedOffset;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_period_secs() -> u64 {
    60
}

fn default_overrun_ratio() -> f64 {
    ReadingOrchestrator::DEFAULT_OVERRUN_RATIO
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Offset applied when rendering row timestamps, in minutes east of UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub output: OutputConfig,
    pub devices: Vec<DeviceConfig>,
    pub jobs: Vec<JobConfig>,
}

/// Where rows are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    /// One CSV file per table under `dir`
    Csv { dir: PathBuf },
    /// Keep rows in memory only (dry run)
    Memory,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::Csv {
            dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub word_order: WordOrder,
}

impl From<&DeviceConfig> for DeviceEndpoint {
    fn from(cfg: &DeviceConfig) -> Self {
        DeviceEndpoint {
            name: cfg.name.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            unit_id: cfg.unit_id,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
            word_order: cfg.word_order,
        }
    }
}

/// One metric to read. Exactly one of `address` (zero-based wire address) or
/// `documented_address` (1-based, as printed in device manuals) must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub metric: String,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documented_address: Option<u32>,
    pub decode: DecodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default)]
    pub offset_secs: u64,
    #[serde(default)]
    pub run_immediately: bool,
    #[serde(default = "default_overrun_ratio")]
    pub overrun_ratio: f64,
    /// Required: there is no implicit kW policy
    pub active_power_policy: ActivePowerPolicy,
    pub registers: Vec<RegisterConfig>,
    pub fields: Vec<FieldSpec>,
}

/// A job resolved against the device registry, ready to be wired up.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job: PollJob,
    pub schedule: Schedule,
    pub run_immediately: bool,
    pub overrun_ratio: f64,
}

impl AppConfig {
    /// Load and validate configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(
            "Loaded config from {}: {} devices, {} jobs",
            path.display(),
            config.devices.len(),
            config.jobs.len()
        );
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(text).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| ConfigError::InvalidJob {
            job: "*".to_string(),
            reason: format!("invalid UTC offset {} minutes", self.utc_offset_minutes),
        })
    }

    pub fn registry(&self) -> Result<DeviceRegistry, ConfigError> {
        let mut registry = DeviceRegistry::new();
        for device in &self.devices {
            if !registry.insert(DeviceEndpoint::from(device)) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
        }
        Ok(registry)
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.utc_offset()?;
        let registry = self.registry()?;
        for job in &self.jobs {
            job.plan(&registry)?;
        }
        Ok(())
    }

    /// Resolve every job against the device registry.
    pub fn plans(&self) -> Result<Vec<JobPlan>, ConfigError> {
        let registry = self.registry()?;
        self.jobs.iter().map(|job| job.plan(&registry)).collect()
    }
}

impl JobConfig {
    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidJob {
            job: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn plan(&self, registry: &DeviceRegistry) -> Result<JobPlan, ConfigError> {
        let schedule = Schedule::new(
            Duration::from_secs(self.period_secs),
            Duration::from_secs(self.offset_secs),
        )
        .ok_or_else(|| self.invalid("offset_secs must be shorter than a non-zero period_secs"))?;

        if !(self.overrun_ratio > 0.0 && self.overrun_ratio <= 1.0) {
            return Err(self.invalid("overrun_ratio must be in (0, 1]"));
        }
        if let ActivePowerPolicy::ZeroBelowFloor { floor, ceiling } = self.active_power_policy {
            if floor > ceiling {
                return Err(self.invalid("power floor above ceiling"));
            }
        }

        let mut metrics = HashSet::new();
        let mut specs = Vec::with_capacity(self.registers.len());
        for reg in &self.registers {
            if !metrics.insert(reg.metric.as_str()) {
                return Err(ConfigError::DuplicateMetric {
                    job: self.name.clone(),
                    metric: reg.metric.clone(),
                });
            }
            let endpoint = registry.get(&reg.device).ok_or_else(|| ConfigError::UnknownDevice {
                job: self.name.clone(),
                metric: reg.metric.clone(),
                device: reg.device.clone(),
            })?;
            let address = match (reg.address, reg.documented_address) {
                (Some(wire), None) => wire,
                (None, Some(documented)) => wire_address(documented).ok_or_else(|| {
                    self.invalid(format!("{}: no wire address for {}", reg.metric, documented))
                })?,
                _ => {
                    return Err(self.invalid(format!(
                        "{}: set exactly one of address or documented_address",
                        reg.metric
                    )))
                }
            };
            if let DecodeKind::Unknown(kind) = &reg.decode {
                error!(
                    "[{}] {}: unknown decode kind '{}', metric will always fail",
                    self.name, reg.metric, kind
                );
            }
            specs.push(RegisterSpec::new(
                reg.metric.clone(),
                endpoint,
                address,
                reg.decode.clone(),
            ));
        }

        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(self.invalid(format!("duplicate field {}", field.name)));
            }
            if let Some(missing) = field.rule.sources().into_iter().find(|s| !metrics.contains(s)) {
                return Err(ConfigError::UnknownMetric {
                    job: self.name.clone(),
                    field: field.name.clone(),
                    metric: missing.to_string(),
                });
            }
        }

        Ok(JobPlan {
            job: PollJob {
                name: self.name.clone(),
                table: self.table.clone(),
                granularity: self.granularity,
                specs,
                normalizer: Normalizer::new(self.active_power_policy, self.fields.clone()),
            },
            schedule,
            run_immediately: self.run_immediately,
            overrun_ratio: self.overrun_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "utc_offset_minutes": -360,
        "devices": [
            {"name": "g22", "host": "192.168.0.130"},
            {"name": "g21", "host": "192.168.0.120", "read_timeout_ms": 1500}
        ],
        "jobs": [{
            "name": "kwreport",
            "table": "generacion",
            "offset_secs": 20,
            "active_power_policy": {"policy": "zero_is_safe"},
            "registers": [
                {"metric": "kw22", "device": "g22", "address": 1633, "decode": "holding"},
                {"metric": "kvar21", "device": "g21", "address": 1635, "decode": "signed_holding"},
                {"metric": "g21", "device": "g21", "documented_address": 10040, "decode": "discrete"}
            ],
            "fields": [
                {"name": "kw22", "class": "active_power", "source": "kw22"},
                {"name": "kvar21", "class": "reactive_power", "source": "kvar21"},
                {"name": "G21", "class": "status", "source": "g21"}
            ]
        }]
    }"#;

    #[test]
    fn sample_config_resolves_to_plans() {
        let config = AppConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.utc_offset().unwrap(), FixedOffset::west_opt(6 * 3600).unwrap());
        assert_eq!(config.output, OutputConfig::default());

        let plans = config.plans().unwrap();
        let plan = &plans[0];
        assert_eq!(plan.job.granularity, Granularity::Minute);
        assert_eq!(plan.schedule.period(), Duration::from_secs(60));
        assert_eq!(plan.overrun_ratio, 0.8);

        let specs = &plan.job.specs;
        assert_eq!(specs[0].endpoint.port, 502);
        assert_eq!(specs[1].endpoint.read_timeout, Duration::from_millis(1500));
        assert_eq!(specs[2].address, 39);
        assert_eq!(specs[2].decode, DecodeKind::Discrete);
    }

    #[test]
    fn example_file_is_valid() {
        let config = AppConfig::from_json(include_str!("../poller.example.json")).unwrap();
        let plans = config.plans().unwrap();
        let names: Vec<_> = plans.iter().map(|p| p.job.name.as_str()).collect();
        assert_eq!(names, ["kwreport", "niveles", "flujo1a", "estados"]);

        let levels = &plans[1];
        assert!(levels.run_immediately);
        let addresses: Vec<_> = levels.job.specs.iter().map(|s| s.address).collect();
        assert_eq!(addresses, [103, 51, 41]);
        assert_eq!(levels.job.specs[2].endpoint.host, "192.168.14.11");

        let flow = &plans[2].job.specs;
        assert_eq!(flow[0].endpoint.word_order, WordOrder::LowFirst);
        assert_eq!(flow[1].address, 91);
        assert_eq!(plans[2].schedule.period(), Duration::from_secs(120));

        assert_eq!(plans[3].job.granularity, Granularity::HalfMinute);
        assert_eq!(plans[3].job.specs[1].address, 39);
    }

    #[test]
    fn missing_power_policy_is_rejected() {
        let text = SAMPLE.replace(r#""active_power_policy": {"policy": "zero_is_safe"},"#, "");
        assert!(AppConfig::from_json(&text).is_err());
    }

    #[test]
    fn unknown_decode_kind_still_loads() {
        let text = SAMPLE.replace(r#""decode": "signed_holding""#, r#""decode": "int32""#);
        let config = AppConfig::from_json(&text).unwrap();
        let plans = config.plans().unwrap();
        assert_eq!(plans[0].job.specs[1].decode, DecodeKind::Unknown("int32".into()));
    }

    #[test]
    fn semantic_errors_are_reported() {
        let unknown_device = SAMPLE.replace(r#""device": "g22""#, r#""device": "g23""#);
        let err = AppConfig::from_json(&unknown_device).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownDevice { device, .. }) if device == "g23"
        ));

        let unknown_metric = SAMPLE.replace(r#""source": "kw22""#, r#""source": "kw99""#);
        let err = AppConfig::from_json(&unknown_metric).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownMetric { metric, .. }) if metric == "kw99"
        ));

        let both_addresses = SAMPLE.replace(
            r#""address": 1633,"#,
            r#""address": 1633, "documented_address": 1634,"#,
        );
        assert!(AppConfig::from_json(&both_addresses).is_err());

        let bad_offset = SAMPLE.replace(r#""offset_secs": 20"#, r#""offset_secs": 60"#);
        assert!(AppConfig::from_json(&bad_offset).is_err());
    }
}
