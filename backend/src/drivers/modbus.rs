// Modbus TCP 客户端实现
// 提供与现场设备的只读通信接口 (离散输入, 保持寄存器)

use crate::devices::DeviceEndpoint;
use crate::error::ReadError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

/// An open connection to one field device.
///
/// Only the read operations the pipeline needs are exposed.
#[async_trait]
pub trait FieldConnection: Send {
    /// Read discrete inputs (FC2)
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ReadError>;

    /// Read holding registers (FC3)
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError>;

    /// Tear the connection down
    async fn close(&mut self) -> Result<(), ReadError>;
}

/// Opens connections to field devices. Timeouts are applied by the caller.
#[async_trait]
pub trait FieldConnector: Send + Sync {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, ReadError>;
}

/// Modbus TCP 客户端
/// 单次连接, 由 DeviceReader 负责超时与关闭
pub struct ModbusClient {
    /// Remote address, kept for diagnostics
    addr: SocketAddr,
    ctx: Context,
}

impl ModbusClient {
    /// 连接到 Modbus 服务器
    ///
    /// # 参数
    /// * `host` - 主机名或 IP
    /// * `port` - 端口
    /// * `unit_id` - Modbus 单元标识符
    pub async fn connect(host: &str, port: u16, unit_id: u8) -> Result<Self, ReadError> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ReadError::ConnectionFailed(format!("Invalid address {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| ReadError::ConnectionFailed(format!("No address for {}:{}", host, port)))?;

        let ctx = tcp::connect_slave(addr, Slave(unit_id))
            .await
            .map_err(|e| ReadError::ConnectionFailed(e.to_string()))?;

        Ok(Self { addr, ctx })
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl FieldConnection for ModbusClient {
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ReadError> {
        self.ctx
            .read_discrete_inputs(address, count)
            .await
            .map_err(|e| ReadError::ProtocolError(e.to_string()))?
            .map_err(|e| ReadError::Exception(format!("{:?}", e)))
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        self.ctx
            .read_holding_registers(address, count)
            .await
            .map_err(|e| ReadError::ProtocolError(e.to_string()))?
            .map_err(|e| ReadError::Exception(format!("{:?}", e)))
    }

    async fn close(&mut self) -> Result<(), ReadError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| ReadError::ProtocolError(format!("Close failed for {}: {}", self.addr, e)))
    }
}

/// Production connector: a fresh Modbus TCP session per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusTcpConnector;

#[async_trait]
impl FieldConnector for ModbusTcpConnector {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, ReadError> {
        let client = ModbusClient::connect(&endpoint.host, endpoint.port, endpoint.unit_id).await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_closed_port_reports_connection_failure() {
        // Bind then drop to get a local port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = DeviceEndpoint {
            port,
            ..DeviceEndpoint::new("nobody", "127.0.0.1")
        };
        let err = ModbusTcpConnector.connect(&endpoint).await.err().unwrap();
        assert!(matches!(err, ReadError::ConnectionFailed(_)));
    }
}
