// Communication drivers module
//
// Adapters at the edges of the pipeline: the field-bus read primitive on one
// side and the row persistence primitive on the other.

/// Modbus TCP communication driver
/// Read-only client for discrete inputs and holding registers
pub mod modbus;

/// Row persistence adapters
/// Idempotent upsert of validated rows (CSV files, in-memory store)
pub mod sink;

pub use modbus::{FieldConnection, FieldConnector, ModbusClient, ModbusTcpConnector};
pub use sink::{CsvSink, MemorySink, RowSink};
