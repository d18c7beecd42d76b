// 数据校验与归一化
// Per-field rule table turning raw-or-failed readings into storage-ready values

use crate::error::TransformError;
use crate::types::{FieldValue, Reading, ReadingResult, TimeBucket, ValidatedRow};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const DEFAULT_POWER_CEILING: f64 = 1000.0;
const DEFAULT_VOLTAGE_SCALE: f64 = 10.0;

/// Sanitisation policy for active power (kW) fields.
///
/// Both policies treat any anomaly as "generator off" and record 0.
/// There is intentionally no default: each job must name one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ActivePowerPolicy {
    /// Failure, negative, or above `ceiling` → 0
    ZeroIsSafe {
        #[serde(default = "default_power_ceiling")]
        ceiling: f64,
    },
    /// Like `ZeroIsSafe`, and anything below `floor` is also → 0
    ZeroBelowFloor {
        floor: f64,
        #[serde(default = "default_power_ceiling")]
        ceiling: f64,
    },
}

fn default_power_ceiling() -> f64 {
    DEFAULT_POWER_CEILING
}

fn default_voltage_scale() -> f64 {
    DEFAULT_VOLTAGE_SCALE
}

fn default_gauge_scale() -> f64 {
    1.0
}

impl ActivePowerPolicy {
    pub fn zero_is_safe() -> Self {
        ActivePowerPolicy::ZeroIsSafe {
            ceiling: DEFAULT_POWER_CEILING,
        }
    }

    pub fn zero_below_floor(floor: f64) -> Self {
        ActivePowerPolicy::ZeroBelowFloor {
            floor,
            ceiling: DEFAULT_POWER_CEILING,
        }
    }

    /// Apply the policy to one reading; `None` is a failed read.
    pub fn apply(&self, field: &str, raw: Option<f64>) -> f64 {
        let Some(value) = raw.filter(|v| v.is_finite()) else {
            return 0.0;
        };
        let (floor, ceiling) = match *self {
            ActivePowerPolicy::ZeroIsSafe { ceiling } => (None, ceiling),
            ActivePowerPolicy::ZeroBelowFloor { floor, ceiling } => (Some(floor), ceiling),
        };
        if value < 0.0 {
            warn!("Negative active power on {} ({}), recording 0", field, value);
            return 0.0;
        }
        if value > ceiling {
            warn!("Active power on {} out of range ({} > {}), recording 0", field, value, ceiling);
            return 0.0;
        }
        if let Some(floor) = floor {
            if value < floor {
                debug!("Active power on {} below floor ({} < {}), recording 0", field, value, floor);
                return 0.0;
            }
        }
        value
    }
}

/// Built-in level transforms selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LevelTransform {
    #[default]
    Identity,
    /// Subtract a fixed sensor offset
    Offset { subtract: f64 },
    /// `raw * scale + offset`
    Linear { scale: f64, offset: f64 },
}

impl LevelTransform {
    pub fn apply(&self, raw: f64) -> Result<f64, TransformError> {
        Ok(match *self {
            LevelTransform::Identity => raw,
            LevelTransform::Offset { subtract } => raw - subtract,
            LevelTransform::Linear { scale, offset } => raw * scale + offset,
        })
    }
}

/// A caller-supplied level transform.
pub type TransformFn = Arc<dyn Fn(f64) -> Result<f64, TransformError> + Send + Sync>;

/// What kind of quantity a field holds, and where its raw value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum FieldRule {
    /// kW, sanitised by the job's [`ActivePowerPolicy`]
    ActivePower { source: String },
    /// kVAR; negative is physically valid and kept
    ReactivePower { source: String },
    /// Derived from two redundant sources, scaled
    Voltage {
        primary: String,
        fallback: String,
        #[serde(default = "default_voltage_scale")]
        scale: f64,
    },
    /// Tank level; a missing reading stays absent
    Level {
        source: String,
        #[serde(default)]
        transform: LevelTransform,
    },
    /// Discrete status bit recorded as 1/0, absent on failure
    Status { source: String },
    /// Generic scaled measurement (flow rate, sensor quality), absent on failure
    Gauge {
        source: String,
        #[serde(default = "default_gauge_scale")]
        scale: f64,
    },
}

impl FieldRule {
    /// Metrics this rule reads.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            FieldRule::Voltage { primary, fallback, .. } => vec![primary.as_str(), fallback.as_str()],
            FieldRule::ActivePower { source }
            | FieldRule::ReactivePower { source }
            | FieldRule::Level { source, .. }
            | FieldRule::Status { source }
            | FieldRule::Gauge { source, .. } => vec![source.as_str()],
        }
    }
}

/// One output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub rule: FieldRule,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, rule: FieldRule) -> Self {
        Self {
            name: name.into(),
            rule,
        }
    }
}

/// Applies the rule table to one cycle's readings.
#[derive(Clone)]
pub struct Normalizer {
    policy: ActivePowerPolicy,
    fields: Vec<FieldSpec>,
    transforms: HashMap<String, TransformFn>,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("policy", &self.policy)
            .field("fields", &self.fields)
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Normalizer {
    pub fn new(policy: ActivePowerPolicy, fields: Vec<FieldSpec>) -> Self {
        Self {
            policy,
            fields,
            transforms: HashMap::new(),
        }
    }

    /// Register a custom transform for a level field, replacing its configured one.
    pub fn with_transform<F>(mut self, field: impl Into<String>, transform: F) -> Self
    where
        F: Fn(f64) -> Result<f64, TransformError> + Send + Sync + 'static,
    {
        self.transforms.insert(field.into(), Arc::new(transform));
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn policy(&self) -> ActivePowerPolicy {
        self.policy
    }

    /// Build the storage row for `bucket`. Metrics missing from `results` count as failed.
    pub fn normalize(&self, bucket: TimeBucket, results: &[ReadingResult]) -> ValidatedRow {
        let readings: HashMap<&str, &Reading> = results
            .iter()
            .map(|r| (r.metric.as_str(), &r.reading))
            .collect();
        let raw = |metric: &str| readings.get(metric).and_then(|r| r.value());

        let mut row = ValidatedRow::new(bucket);
        for field in &self.fields {
            let value = match &field.rule {
                FieldRule::ActivePower { source } => {
                    FieldValue::Number(self.policy.apply(&field.name, raw(source)))
                }
                FieldRule::ReactivePower { source } => {
                    FieldValue::Number(raw(source).filter(|v| v.is_finite()).unwrap_or(0.0))
                }
                FieldRule::Voltage {
                    primary,
                    fallback,
                    scale,
                } => FieldValue::Number(derive_voltage(raw(primary), raw(fallback), *scale)),
                FieldRule::Level { source, transform } => {
                    self.level(&field.name, raw(source), transform)
                }
                FieldRule::Status { source } => match raw(source) {
                    Some(v) => FieldValue::Number(if v != 0.0 { 1.0 } else { 0.0 }),
                    None => FieldValue::Absent,
                },
                FieldRule::Gauge { source, scale } => raw(source)
                    .map(|v| v * scale)
                    .filter(|v| v.is_finite())
                    .map_or(FieldValue::Absent, FieldValue::Number),
            };
            row.fields.insert(field.name.clone(), value);
        }
        row
    }

    fn level(&self, field: &str, raw: Option<f64>, transform: &LevelTransform) -> FieldValue {
        let Some(raw) = raw else {
            warn!("No reading for level {}, recording absent", field);
            return FieldValue::Absent;
        };
        let computed = match self.transforms.get(field) {
            Some(custom) => custom(raw),
            None => transform.apply(raw),
        }
        .and_then(|v| {
            if v.is_finite() {
                Ok(v)
            } else {
                Err(TransformError::NonFinite(raw))
            }
        });
        match computed {
            Ok(level) => {
                debug!("Level {}: {} -> {}", field, raw, level);
                FieldValue::Number(level)
            }
            Err(e) => {
                warn!("Level transform for {} failed: {}, recording absent", field, e);
                FieldValue::Absent
            }
        }
    }
}

/// Prefer the primary source when it read nonzero, else the fallback, else 0.
pub fn derive_voltage(primary: Option<f64>, fallback: Option<f64>, scale: f64) -> f64 {
    let primary = primary.filter(|v| v.is_finite() && *v != 0.0);
    let fallback = fallback.filter(|v| v.is_finite());
    primary
        .or(fallback)
        .map(|base| base * scale)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}
