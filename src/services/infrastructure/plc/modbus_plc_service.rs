// modbus_plc_service.rs
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_modbus::client::Context as ModbusClientContext;
use tokio_modbus::prelude::*;
use log::{debug, info};

use crate::models::ByteOrder;
use crate::utils::config::PlcConfig;
use crate::utils::error::{AppError, AppResult};
use super::plc_communication_service::IPlcEndpoint;

/// Modbus 寄存器区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// 0x 线圈
    Coil,
    /// 1x 离散量输入
    DiscreteInput,
    /// 3x 输入寄存器
    InputRegister,
    /// 4x 保持寄存器
    HoldingRegister,
}

/// 浮点数与寄存器之间的字节序转换
pub struct ByteOrderConverter;

impl ByteOrderConverter {
    pub fn float_to_registers(value: f32, order: ByteOrder) -> [u16; 2] {
        let [a, b, c, d] = value.to_be_bytes();
        match order {
            ByteOrder::ABCD => [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])],
            ByteOrder::CDAB => [u16::from_be_bytes([c, d]), u16::from_be_bytes([a, b])],
            ByteOrder::BADC => [u16::from_be_bytes([b, a]), u16::from_be_bytes([d, c])],
            ByteOrder::DCBA => [u16::from_be_bytes([d, c]), u16::from_be_bytes([b, a])],
        }
    }

    pub fn registers_to_float(registers: [u16; 2], order: ByteOrder) -> f32 {
        let [r0h, r0l] = registers[0].to_be_bytes();
        let [r1h, r1l] = registers[1].to_be_bytes();
        let bytes = match order {
            ByteOrder::ABCD => [r0h, r0l, r1h, r1l],
            ByteOrder::CDAB => [r1h, r1l, r0h, r0l],
            ByteOrder::BADC => [r0l, r0h, r1l, r1h],
            ByteOrder::DCBA => [r1l, r1h, r0l, r0h],
        };
        f32::from_be_bytes(bytes)
    }
}

/// Modbus TCP PLC 通信服务配置
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub slave_id: u8,
    pub byte_order: ByteOrder,
    pub zero_based_address: bool,
    pub connection_timeout_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            name: "ModbusPlc".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: 502,
            slave_id: 1,
            byte_order: ByteOrder::default(),
            zero_based_address: false,
            connection_timeout_ms: 2000,
            io_timeout_ms: 1000,
        }
    }
}

impl ModbusConfig {
    /// 从应用配置构建
    pub fn from_plc_config(name: impl Into<String>, config: &PlcConfig) -> AppResult<Self> {
        Ok(Self {
            name: name.into(),
            ip_address: config.host.clone(),
            port: config.port,
            slave_id: config.slave_id,
            byte_order: config.byte_order.parse()?,
            zero_based_address: config.zero_based_address,
            connection_timeout_ms: config.connection_timeout_ms,
            io_timeout_ms: config.io_timeout_ms,
        })
    }
}

/// 解析形如 "40001" / "00001" / "10001" / "30001" 的 Modbus 地址
///
/// 返回寄存器区与协议层偏移（默认 1 基地址减 1）
pub fn parse_modbus_address(address_str: &str, zero_based: bool) -> AppResult<(RegisterKind, u16)> {
    let address_str = address_str.trim();
    let mut chars = address_str.chars();
    let first_char = chars
        .next()
        .ok_or_else(|| AppError::plc_communication_error("地址不能为空"))?;
    let offset_str = chars.as_str();

    let offset = offset_str.parse::<u16>().map_err(|_| {
        AppError::plc_communication_error(format!("无效的地址偏移量: {}", offset_str))
    })?;

    let final_offset = if zero_based {
        offset
    } else {
        offset.checked_sub(1).ok_or_else(|| {
            AppError::plc_communication_error("Modbus地址偏移量从1开始")
        })?
    };

    let kind = match first_char {
        '0' => RegisterKind::Coil,
        '1' => RegisterKind::DiscreteInput,
        '3' => RegisterKind::InputRegister,
        '4' => RegisterKind::HoldingRegister,
        _ => {
            return Err(AppError::plc_communication_error(format!(
                "不支持的地址类型前缀 '{}' in '{}'. 请使用 0 (线圈), 1 (离散量输入), 3 (输入寄存器), 或 4 (保持寄存器).",
                first_char, address_str
            )))
        }
    };
    Ok((kind, final_offset))
}

/// 展开 tokio-modbus 的双层结果（IO错误 / 协议异常码）
fn flatten_modbus<T>(result: tokio_modbus::Result<T>, operation: &str) -> AppResult<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(AppError::plc_communication_error(format!(
            "Modbus协议错误 ({}): {:?}", operation, exception
        ))),
        Err(io_err) => Err(AppError::plc_communication_error(format!(
            "Modbus IO错误 ({}): {}", operation, io_err
        ))),
    }
}

/// Modbus TCP 端点
pub struct ModbusPlcService {
    config: ModbusConfig,
    client_context: Mutex<Option<ModbusClientContext>>,
    connected: AtomicBool,
}

impl ModbusPlcService {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            client_context: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn get_socket_addr(&self) -> AppResult<SocketAddr> {
        format!("{}:{}", self.config.ip_address, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| AppError::configuration_error(format!("无效的IP地址或端口: {}", e)))
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }

    /// 断开连接（丢弃客户端上下文即关闭连接）
    pub async fn disconnect(&self) {
        self.client_context.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn mark_io_failure(&self, err: AppError) -> AppError {
        if matches!(err, AppError::TimeoutError { .. }) {
            self.connected.store(false, Ordering::SeqCst);
        }
        err
    }

    async fn read_registers(&self, kind: RegisterKind, offset: u16, count: u16) -> AppResult<Vec<u16>> {
        let mut guard = self.client_context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| AppError::plc_communication_error(format!("{} 未连接", self.config.name)))?;

        let request = async {
            match kind {
                RegisterKind::HoldingRegister => Some(ctx.read_holding_registers(offset, count).await),
                RegisterKind::InputRegister => Some(ctx.read_input_registers(offset, count).await),
                _ => None,
            }
        };
        let result = tokio::time::timeout(self.io_timeout(), request)
            .await
            .map_err(|_| AppError::timeout_error("读取寄存器", format!("偏移 {}", offset)))?
            .ok_or_else(|| AppError::plc_communication_error(format!("{:?} 不支持寄存器读取", kind)))?;
        flatten_modbus(result, "读取寄存器")
    }

    async fn read_bits(&self, kind: RegisterKind, offset: u16) -> AppResult<Vec<bool>> {
        let mut guard = self.client_context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| AppError::plc_communication_error(format!("{} 未连接", self.config.name)))?;

        let request = async {
            match kind {
                RegisterKind::Coil => Some(ctx.read_coils(offset, 1).await),
                RegisterKind::DiscreteInput => Some(ctx.read_discrete_inputs(offset, 1).await),
                _ => None,
            }
        };
        let result = tokio::time::timeout(self.io_timeout(), request)
            .await
            .map_err(|_| AppError::timeout_error("读取位", format!("偏移 {}", offset)))?
            .ok_or_else(|| AppError::plc_communication_error(format!("{:?} 不支持位读取", kind)))?;
        flatten_modbus(result, "读取位")
    }
}

#[async_trait]
impl IPlcEndpoint for ModbusPlcService {
    fn endpoint_name(&self) -> String {
        self.config.name.clone()
    }

    async fn connect(&self) -> AppResult<()> {
        let mut guard = self.client_context.lock().await;
        if guard.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let socket_addr = self.get_socket_addr()?;
        let slave = Slave(self.config.slave_id);
        info!("[ModbusPlc] 连接 {} -> {} (从站 {})", self.config.name, socket_addr, self.config.slave_id);

        match tokio::time::timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            tokio_modbus::client::tcp::connect_slave(socket_addr, slave),
        )
        .await
        {
            Ok(Ok(ctx)) => {
                *guard = Some(ctx);
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => Err(AppError::plc_communication_error(format!("Modbus连接失败: {}", e))),
            Err(_) => Err(AppError::plc_communication_error("Modbus连接超时")),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_analog(&self, address: &str) -> AppResult<f32> {
        let (kind, offset) = parse_modbus_address(address, self.config.zero_based_address)?;
        if !matches!(kind, RegisterKind::HoldingRegister | RegisterKind::InputRegister) {
            return Err(AppError::plc_communication_error(format!(
                "地址 {} 不是有效的32位寄存器 (保持或输入) 地址", address
            )));
        }

        let values = self
            .read_registers(kind, offset, 2)
            .await
            .map_err(|e| self.mark_io_failure(e))?;
        if values.len() < 2 {
            return Err(AppError::plc_communication_error("读取f32时返回的寄存器数量不足"));
        }
        let value = ByteOrderConverter::registers_to_float([values[0], values[1]], self.config.byte_order);
        debug!("[ModbusPlc] {} 读取 {} = {}", self.config.name, address, value);
        Ok(value)
    }

    async fn write_analog(&self, address: &str, value: f32) -> AppResult<()> {
        let (kind, offset) = parse_modbus_address(address, self.config.zero_based_address)?;
        if kind != RegisterKind::HoldingRegister {
            return Err(AppError::plc_communication_error(format!(
                "地址 {} 不是有效的可写保持寄存器地址 (用于f32)", address
            )));
        }
        let registers = ByteOrderConverter::float_to_registers(value, self.config.byte_order);

        let mut guard = self.client_context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| AppError::plc_communication_error(format!("{} 未连接", self.config.name)))?;
        let result = tokio::time::timeout(self.io_timeout(), ctx.write_multiple_registers(offset, &registers))
            .await
            .map_err(|_| self.mark_io_failure(AppError::timeout_error("写入f32", address.to_string())))?;
        flatten_modbus(result, "写入f32")?;
        debug!("[ModbusPlc] {} 写入 {} = {}", self.config.name, address, value);
        Ok(())
    }

    async fn read_digital(&self, address: &str) -> AppResult<bool> {
        let (kind, offset) = parse_modbus_address(address, self.config.zero_based_address)?;
        if !matches!(kind, RegisterKind::Coil | RegisterKind::DiscreteInput) {
            return Err(AppError::plc_communication_error(format!(
                "地址 {} 不是有效的布尔型 (线圈或离散量输入) 地址", address
            )));
        }

        let values = self
            .read_bits(kind, offset)
            .await
            .map_err(|e| self.mark_io_failure(e))?;
        values
            .first()
            .copied()
            .ok_or_else(|| AppError::plc_communication_error("读取布尔值时返回为空"))
    }

    async fn write_digital(&self, address: &str, value: bool) -> AppResult<()> {
        let (kind, offset) = parse_modbus_address(address, self.config.zero_based_address)?;
        if kind != RegisterKind::Coil {
            return Err(AppError::plc_communication_error(format!(
                "地址 {} 不是有效的可写线圈地址", address
            )));
        }

        let mut guard = self.client_context.lock().await;
        let ctx = guard
            .as_mut()
            .ok_or_else(|| AppError::plc_communication_error(format!("{} 未连接", self.config.name)))?;
        let result = tokio::time::timeout(self.io_timeout(), ctx.write_single_coil(offset, value))
            .await
            .map_err(|_| self.mark_io_failure(AppError::timeout_error("写入线圈", address.to_string())))?;
        flatten_modbus(result, "写入线圈")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modbus_address() {
        assert_eq!(parse_modbus_address("40001", false).unwrap(), (RegisterKind::HoldingRegister, 0));
        assert_eq!(parse_modbus_address("00017", false).unwrap(), (RegisterKind::Coil, 16));
        assert_eq!(parse_modbus_address("10003", false).unwrap(), (RegisterKind::DiscreteInput, 2));
        assert_eq!(parse_modbus_address("30010", true).unwrap(), (RegisterKind::InputRegister, 10));

        assert!(parse_modbus_address("", false).is_err());
        assert!(parse_modbus_address("40000", false).is_err());
        assert!(parse_modbus_address("2000", false).is_err());
        assert!(parse_modbus_address("4abc", false).is_err());
    }

    #[test]
    fn test_byte_order_conversion() {
        let value = 123.456_f32;
        for order in [ByteOrder::ABCD, ByteOrder::CDAB, ByteOrder::BADC, ByteOrder::DCBA] {
            let registers = ByteOrderConverter::float_to_registers(value, order);
            assert_eq!(ByteOrderConverter::registers_to_float(registers, order), value);
        }

        // 1.0f32 = 0x3F800000
        assert_eq!(ByteOrderConverter::float_to_registers(1.0, ByteOrder::ABCD), [0x3F80, 0x0000]);
        assert_eq!(ByteOrderConverter::float_to_registers(1.0, ByteOrder::CDAB), [0x0000, 0x3F80]);
        assert_eq!(ByteOrderConverter::float_to_registers(1.0, ByteOrder::BADC), [0x803F, 0x0000]);
        assert_eq!(ByteOrderConverter::float_to_registers(1.0, ByteOrder::DCBA), [0x0000, 0x803F]);
    }

    #[test]
    fn test_config_from_plc_config() {
        let plc_config = PlcConfig {
            host: "192.168.0.10".to_string(),
            byte_order: "ABCD".to_string(),
            ..PlcConfig::default()
        };
        let config = ModbusConfig::from_plc_config("TestPlc", &plc_config).unwrap();
        assert_eq!(config.byte_order, ByteOrder::ABCD);
        assert_eq!(config.ip_address, "192.168.0.10");
    }

    #[tokio::test]
    async fn test_io_without_connection_fails() {
        let service = ModbusPlcService::new(ModbusConfig::default());
        assert!(!service.is_connected());
        let err = service.read_analog("40001").await.unwrap_err();
        assert_eq!(err.error_code(), "PLC_COMMUNICATION_ERROR");
        assert!(service.write_digital("40001", true).await.is_err());
    }
}
