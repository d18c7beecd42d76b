// 设备模块 - 现场设备端点与寄存器定义
// Configuration-driven registry of field-device endpoints and the registers polled on them

pub mod reader;

pub use reader::DeviceReader;

use crate::decode::WordOrder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One field device reachable over Modbus TCP. Immutable after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEndpoint {
    /// Logical device name used in logs and config references
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Modbus unit / slave identifier
    pub unit_id: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Register order for 32-bit values on this device
    pub word_order: WordOrder,
}

impl DeviceEndpoint {
    const DEFAULT_PORT: u16 = 502;
    const DEFAULT_UNIT_ID: u8 = 1;
    const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

    /// Endpoint on the standard port with unit 1 and default timeouts.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: Self::DEFAULT_PORT,
            unit_id: Self::DEFAULT_UNIT_ID,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            word_order: WordOrder::default(),
        }
    }

    /// Key of the physical link: reads sharing it must not overlap.
    pub fn link_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}#{})", self.name, self.host, self.port, self.unit_id)
    }
}

/// How the words of a register are turned into a value.
///
/// Deserialised from a plain string; names nobody recognises are kept as
/// `Unknown` so that a typo fails one metric instead of the whole config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DecodeKind {
    /// Discrete input (FC2), one bit
    Discrete,
    /// Holding register (FC3) as unsigned 16-bit
    Holding,
    /// Holding register (FC3) as two's-complement 16-bit
    SignedHolding,
    /// Two holding registers as a big-endian IEEE-754 single
    Float32Be,
    Unknown(String),
}

impl DecodeKind {
    /// Number of protocol units (bits or words) one value occupies.
    pub fn count(&self) -> u16 {
        match self {
            DecodeKind::Float32Be => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DecodeKind::Discrete => "discrete",
            DecodeKind::Holding => "holding",
            DecodeKind::SignedHolding => "signed_holding",
            DecodeKind::Float32Be => "float32_be",
            DecodeKind::Unknown(name) => name,
        }
    }
}

impl From<String> for DecodeKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "discrete" => DecodeKind::Discrete,
            "holding" => DecodeKind::Holding,
            "signed_holding" => DecodeKind::SignedHolding,
            "float32_be" => DecodeKind::Float32Be,
            _ => DecodeKind::Unknown(name),
        }
    }
}

impl From<DecodeKind> for String {
    fn from(kind: DecodeKind) -> Self {
        kind.name().to_string()
    }
}

/// One metric to read each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSpec {
    pub metric: String,
    pub endpoint: Arc<DeviceEndpoint>,
    /// Zero-based wire address
    pub address: u16,
    pub count: u16,
    pub decode: DecodeKind,
}

impl RegisterSpec {
    pub fn new(
        metric: impl Into<String>,
        endpoint: Arc<DeviceEndpoint>,
        address: u16,
        decode: DecodeKind,
    ) -> Self {
        Self {
            metric: metric.into(),
            endpoint,
            address,
            count: decode.count(),
            decode,
        }
    }
}

/// Endpoints by name, shared between jobs.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    endpoints: HashMap<String, Arc<DeviceEndpoint>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Returns `false` if the name was already taken.
    pub fn insert(&mut self, endpoint: DeviceEndpoint) -> bool {
        if self.endpoints.contains_key(&endpoint.name) {
            return false;
        }
        self.endpoints
            .insert(endpoint.name.clone(), Arc::new(endpoint));
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceEndpoint>> {
        self.endpoints.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_match_field_wiring() {
        let ep = DeviceEndpoint::new("g22", "192.168.0.130");
        assert_eq!(ep.port, 502);
        assert_eq!(ep.unit_id, 1);
        assert_eq!(ep.connect_timeout, Duration::from_secs(5));
        assert_eq!(ep.read_timeout, Duration::from_secs(3));
        assert_eq!(ep.link_key(), "192.168.0.130:502");
    }

    #[test]
    fn decode_kind_parses_known_and_keeps_unknown() {
        let kinds: Vec<DecodeKind> =
            serde_json::from_str(r#"["discrete","signed_holding","float32_be","bcd"]"#).unwrap();
        assert_eq!(kinds[0], DecodeKind::Discrete);
        assert_eq!(kinds[1], DecodeKind::SignedHolding);
        assert_eq!(kinds[2].count(), 2);
        assert_eq!(kinds[3], DecodeKind::Unknown("bcd".into()));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.insert(DeviceEndpoint::new("plc", "192.168.6.18")));
        assert!(!registry.insert(DeviceEndpoint::new("plc", "192.168.14.11")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("plc").unwrap().host, "192.168.6.18");
    }
}
