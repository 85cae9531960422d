/// PLC通信相关模块

/// PLC端点接口定义
pub mod plc_communication_service;

/// Mock PLC服务实现（用于开发和测试）
pub mod mock_plc_service;

/// Modbus TCP 实现
pub mod modbus_plc_service;

pub use plc_communication_service::*;
pub use mock_plc_service::{MockPlcService, PlcValue, WireBehavior, WriteOperation};
pub use modbus_plc_service::{ModbusPlcService, ModbusConfig, ByteOrderConverter};
