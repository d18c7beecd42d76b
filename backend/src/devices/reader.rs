// 设备读取器
// One bounded read per call: connect, read, always close, never propagate errors

use crate::decode::{decode_boolean, decode_float32_be, decode_signed_holding};
use crate::devices::{DecodeKind, RegisterSpec};
use crate::drivers::modbus::{FieldConnection, FieldConnector};
use crate::error::ReadError;
use crate::types::{RawValue, Reading, ReadingResult};
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::time::timeout;

/// Reads single metrics from field devices over fresh connections.
#[derive(Clone)]
pub struct DeviceReader {
    connector: Arc<dyn FieldConnector>,
}

impl DeviceReader {
    pub fn new(connector: Arc<dyn FieldConnector>) -> Self {
        Self { connector }
    }

    /// Perform one read attempt for `spec`.
    ///
    /// Always yields a result; failures are logged with device, register and
    /// metric and come back as [`Reading::Failed`].
    pub async fn read(&self, spec: &RegisterSpec) -> ReadingResult {
        let attempted_at = Utc::now();
        let reading = match self.try_read(spec).await {
            Ok(value) => {
                debug!(
                    "Read {} from {} @ {}: {:?}",
                    spec.metric, spec.endpoint, spec.address, value
                );
                Reading::Value(value)
            }
            Err(e @ ReadError::UnsupportedDecode(_)) => {
                error!(
                    "Config error for {} on {} @ {}: {}",
                    spec.metric, spec.endpoint, spec.address, e
                );
                Reading::Failed(e.to_string())
            }
            Err(e) => {
                warn!(
                    "Read failed for {} on {} @ {}: {}",
                    spec.metric, spec.endpoint, spec.address, e
                );
                Reading::Failed(e.to_string())
            }
        };

        ReadingResult {
            metric: spec.metric.clone(),
            reading,
            attempted_at,
        }
    }

    async fn try_read(&self, spec: &RegisterSpec) -> Result<RawValue, ReadError> {
        if let DecodeKind::Unknown(name) = &spec.decode {
            return Err(ReadError::UnsupportedDecode(name.clone()));
        }

        let endpoint = &spec.endpoint;
        let mut conn = timeout(endpoint.connect_timeout, self.connector.connect(endpoint))
            .await
            .map_err(|_| ReadError::ConnectTimeout(endpoint.connect_timeout))??;

        // No early return between connect and close
        let outcome = timeout(endpoint.read_timeout, fetch(conn.as_mut(), spec))
            .await
            .map_err(|_| ReadError::ReadTimeout(endpoint.read_timeout))
            .and_then(|r| r);

        // A stalled teardown must not hold the cycle; dropping the box force-closes
        match timeout(endpoint.read_timeout, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Closing connection to {} failed: {}", endpoint, e),
            Err(_) => warn!(
                "Closing connection to {} timed out after {:?}, dropping it",
                endpoint, endpoint.read_timeout
            ),
        }

        outcome
    }
}

async fn fetch(conn: &mut dyn FieldConnection, spec: &RegisterSpec) -> Result<RawValue, ReadError> {
    match &spec.decode {
        DecodeKind::Discrete => {
            let bits = conn.read_discrete_inputs(spec.address, spec.count).await?;
            let bit = *bits.first().ok_or(ReadError::ShortResponse {
                expected: usize::from(spec.count),
                got: 0,
            })?;
            Ok(RawValue::Bool(bit))
        }
        DecodeKind::Holding | DecodeKind::SignedHolding | DecodeKind::Float32Be => {
            let words = conn.read_holding_registers(spec.address, spec.count).await?;
            decode_words(spec, &words)
        }
        DecodeKind::Unknown(name) => Err(ReadError::UnsupportedDecode(name.clone())),
    }
}

fn decode_words(spec: &RegisterSpec, words: &[u16]) -> Result<RawValue, ReadError> {
    let expected = usize::from(spec.decode.count());
    if words.len() < expected {
        return Err(ReadError::ShortResponse {
            expected,
            got: words.len(),
        });
    }

    Ok(match &spec.decode {
        DecodeKind::Float32Be => {
            let (high, low) = spec.endpoint.word_order.split(words[0], words[1]);
            RawValue::Float(decode_float32_be(high, low))
        }
        DecodeKind::SignedHolding => RawValue::Signed(decode_signed_holding(words[0])),
        DecodeKind::Discrete => RawValue::Bool(decode_boolean(words[0])),
        DecodeKind::Holding => RawValue::Unsigned(words[0]),
        DecodeKind::Unknown(name) => return Err(ReadError::UnsupportedDecode(name.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{encode_float32_be, WordOrder};
    use crate::devices::DeviceEndpoint;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted device: fixed replies, optional stalls and a close counter.
    #[derive(Default)]
    struct Script {
        words: Vec<u16>,
        bits: Vec<bool>,
        refuse: bool,
        stall_connect: bool,
        stall_read: bool,
        fail_close: bool,
        hang_close: bool,
        closes: AtomicUsize,
        connects: AtomicUsize,
    }

    struct ScriptConn(Arc<Script>);

    #[async_trait]
    impl FieldConnection for ScriptConn {
        async fn read_discrete_inputs(&mut self, _: u16, _: u16) -> Result<Vec<bool>, ReadError> {
            if self.0.stall_read {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(self.0.bits.clone())
        }

        async fn read_holding_registers(&mut self, _: u16, _: u16) -> Result<Vec<u16>, ReadError> {
            if self.0.stall_read {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(self.0.words.clone())
        }

        async fn close(&mut self) -> Result<(), ReadError> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            if self.0.hang_close {
                std::future::pending::<()>().await;
            }
            if self.0.fail_close {
                return Err(ReadError::ProtocolError("socket already gone".into()));
            }
            Ok(())
        }
    }

    struct ScriptConnector(Arc<Script>);

    #[async_trait]
    impl FieldConnector for ScriptConnector {
        async fn connect(&self, _: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, ReadError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.stall_connect {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.0.refuse {
                return Err(ReadError::ConnectionFailed("refused".into()));
            }
            Ok(Box::new(ScriptConn(self.0.clone())))
        }
    }

    fn scripted(script: Script) -> (DeviceReader, Arc<Script>) {
        let script = Arc::new(script);
        (DeviceReader::new(Arc::new(ScriptConnector(script.clone()))), script)
    }

    fn spec(decode: DecodeKind) -> RegisterSpec {
        RegisterSpec::new("m", Arc::new(DeviceEndpoint::new("dev", "10.0.0.1")), 1633, decode)
    }

    #[tokio::test]
    async fn signed_holding_success_closes_connection() {
        let (reader, script) = scripted(Script {
            words: vec![0xFF88],
            ..Default::default()
        });
        let result = reader.read(&spec(DecodeKind::SignedHolding)).await;
        assert_eq!(result.reading, Reading::Value(RawValue::Signed(-120)));
        assert_eq!(result.metric, "m");
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn float_pair_respects_device_word_order() {
        let (high, low) = encode_float32_be(17.25);
        let (reader, _) = scripted(Script {
            words: vec![low, high],
            ..Default::default()
        });
        let endpoint = DeviceEndpoint {
            word_order: WordOrder::LowFirst,
            ..DeviceEndpoint::new("flow", "192.168.7.18")
        };
        let spec = RegisterSpec::new("flow", Arc::new(endpoint), 0, DecodeKind::Float32Be);
        assert_eq!(reader.read(&spec).await.reading, Reading::Value(RawValue::Float(17.25)));
    }

    #[tokio::test]
    async fn short_reply_is_a_failure() {
        let (reader, script) = scripted(Script {
            words: vec![0x4148],
            ..Default::default()
        });
        let result = reader.read(&spec(DecodeKind::Float32Be)).await;
        assert!(result.reading.is_failed());
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);

        let (reader, _) = scripted(Script::default());
        assert!(reader.read(&spec(DecodeKind::Discrete)).await.reading.is_failed());
    }

    #[tokio::test]
    async fn refused_connection_is_a_failure() {
        let (reader, script) = scripted(Script {
            refuse: true,
            ..Default::default()
        });
        assert!(reader.read(&spec(DecodeKind::Holding)).await.reading.is_failed());
        assert_eq!(script.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_bounded() {
        let (reader, _) = scripted(Script {
            stall_connect: true,
            ..Default::default()
        });
        let started = tokio::time::Instant::now();
        let result = reader.read(&spec(DecodeKind::Holding)).await;
        assert_eq!(
            result.reading,
            Reading::Failed(ReadError::ConnectTimeout(Duration::from_secs(5)).to_string())
        );
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_still_closes() {
        let (reader, script) = scripted(Script {
            stall_read: true,
            ..Default::default()
        });
        let result = reader.read(&spec(DecodeKind::Discrete)).await;
        assert_eq!(
            result.reading,
            Reading::Failed(ReadError::ReadTimeout(Duration::from_secs(3)).to_string())
        );
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_value() {
        let (reader, _) = scripted(Script {
            bits: vec![true],
            fail_close: true,
            ..Default::default()
        });
        assert_eq!(
            reader.read(&spec(DecodeKind::Discrete)).await.reading,
            Reading::Value(RawValue::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_close_is_bounded() {
        let (reader, script) = scripted(Script {
            words: vec![412],
            hang_close: true,
            ..Default::default()
        });
        let started = tokio::time::Instant::now();
        let result = reader.read(&spec(DecodeKind::Holding)).await;
        assert_eq!(result.reading, Reading::Value(RawValue::Unsigned(412)));
        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_with_hanging_close_still_returns() {
        let (reader, _) = scripted(Script {
            stall_read: true,
            hang_close: true,
            ..Default::default()
        });
        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            reader.read(&spec(DecodeKind::Discrete)),
        )
        .await
        .expect("read must finish on its own");
        assert_eq!(
            result.reading,
            Reading::Failed(ReadError::ReadTimeout(Duration::from_secs(3)).to_string())
        );
    }

    #[tokio::test]
    async fn unknown_decode_never_connects() {
        let (reader, script) = scripted(Script {
            words: vec![1],
            ..Default::default()
        });
        let result = reader.read(&spec(DecodeKind::Unknown("bcd".into()))).await;
        assert!(result.reading.is_failed());
        assert_eq!(script.connects.load(Ordering::SeqCst), 0);
    }
}
