/// Mock PLC 服务实现
/// 用于开发和测试阶段，模拟测试台架与被测PLC之间的硬接线
///
/// 每个实例拥有独立的地址存储；通过 `wire_to` 把本端某个输出地址接到另一端的输入地址，
/// 写入时按接线行为（增益、偏移、卡死、断线）把值传递到对端存储。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use log::{debug, trace};

use crate::utils::error::{AppError, AppResult};
use super::plc_communication_service::IPlcEndpoint;

/// 存储中的值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlcValue {
    Analog(f32),
    Digital(bool),
}

/// 写入操作记录
/// 用于测试验证写入操作是否按预期执行
#[derive(Debug, Clone)]
pub struct WriteOperation {
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub value: PlcValue,
}

/// 一根模拟接线的行为
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireBehavior {
    /// 模拟量增益
    pub gain: f32,
    /// 模拟量偏移
    pub offset: f32,
    /// 数字量卡死在某个值
    pub stuck_digital: Option<bool>,
    /// 断线：写入不会传递到对端
    pub broken: bool,
}

impl WireBehavior {
    /// 理想接线
    pub fn ideal() -> Self {
        Self { gain: 1.0, offset: 0.0, stuck_digital: None, broken: false }
    }

    pub fn with_offset(offset: f32) -> Self {
        Self { offset, ..Self::ideal() }
    }

    pub fn with_gain(gain: f32) -> Self {
        Self { gain, ..Self::ideal() }
    }

    pub fn stuck_at(value: bool) -> Self {
        Self { stuck_digital: Some(value), ..Self::ideal() }
    }

    pub fn broken() -> Self {
        Self { broken: true, ..Self::ideal() }
    }

    fn transmit(&self, value: PlcValue) -> Option<PlcValue> {
        if self.broken {
            return None;
        }
        Some(match value {
            PlcValue::Analog(v) => PlcValue::Analog(v * self.gain + self.offset),
            PlcValue::Digital(b) => PlcValue::Digital(self.stuck_digital.unwrap_or(b)),
        })
    }
}

type Storage = Arc<Mutex<HashMap<String, PlcValue>>>;

#[derive(Clone)]
struct WireLink {
    target_name: String,
    target_storage: Storage,
    target_address: String,
    behavior: WireBehavior,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock PLC 服务
pub struct MockPlcService {
    service_name: String,
    connected: AtomicBool,
    /// 内部数据存储（地址 -> 值）
    data_storage: Storage,
    /// 出线（本端地址 -> 接线列表）
    wires: Mutex<HashMap<String, Vec<WireLink>>>,
    write_log: Mutex<Vec<WriteOperation>>,
    /// 读写时返回通讯错误的地址
    faulty_addresses: Mutex<HashSet<String>>,
    fail_on_connect: AtomicBool,
    network_delay_ms: AtomicU64,
    /// 随机错误率（0.0-1.0），以 f64 位模式存储
    error_rate_bits: AtomicU64,
}

impl MockPlcService {
    /// 创建新的 Mock PLC 服务实例（无网络延迟、无随机错误）
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            connected: AtomicBool::new(false),
            data_storage: Arc::new(Mutex::new(HashMap::new())),
            wires: Mutex::new(HashMap::new()),
            write_log: Mutex::new(Vec::new()),
            faulty_addresses: Mutex::new(HashSet::new()),
            fail_on_connect: AtomicBool::new(false),
            network_delay_ms: AtomicU64::new(0),
            error_rate_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// 把本端 `from_address` 接到 `target` 的 `to_address`
    pub fn wire_to(&self, from_address: &str, target: &MockPlcService, to_address: &str, behavior: WireBehavior) {
        let link = WireLink {
            target_name: target.service_name.clone(),
            target_storage: target.data_storage.clone(),
            target_address: to_address.to_string(),
            behavior,
        };
        lock(&self.wires)
            .entry(from_address.to_string())
            .or_default()
            .push(link);
    }

    /// 修改已有接线的行为
    pub fn set_wire_behavior(&self, from_address: &str, behavior: WireBehavior) {
        if let Some(links) = lock(&self.wires).get_mut(from_address) {
            for link in links.iter_mut() {
                link.behavior = behavior;
            }
        }
    }

    /// 预设某个地址的值
    pub fn preset_value(&self, address: impl Into<String>, value: PlcValue) {
        lock(&self.data_storage).insert(address.into(), value);
    }

    /// 查看存储中的值（不经过通讯）
    pub fn peek(&self, address: &str) -> Option<PlcValue> {
        lock(&self.data_storage).get(address).copied()
    }

    /// 注入地址级通讯故障
    pub fn inject_fault(&self, address: impl Into<String>) {
        lock(&self.faulty_addresses).insert(address.into());
    }

    pub fn clear_faults(&self) {
        lock(&self.faulty_addresses).clear();
    }

    /// 设置连接失败
    pub fn set_connect_failure(&self, fail: bool) {
        self.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    /// 设置网络延迟模拟
    pub fn set_network_delay(&self, delay_ms: u64) {
        self.network_delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// 设置随机错误率
    pub fn set_error_rate(&self, rate: f64) {
        self.error_rate_bits.store(rate.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    /// 断开连接
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// 获取写入日志
    pub fn get_write_log(&self) -> Vec<WriteOperation> {
        lock(&self.write_log).clone()
    }

    /// 清空写入日志
    pub fn clear_write_log(&self) {
        lock(&self.write_log).clear();
    }

    /// 检查是否写入了指定地址
    pub fn was_address_written(&self, address: &str) -> bool {
        lock(&self.write_log).iter().any(|op| op.address == address)
    }

    /// 指定地址的全部写入值（按时间顺序）
    pub fn writes_to(&self, address: &str) -> Vec<PlcValue> {
        lock(&self.write_log)
            .iter()
            .filter(|op| op.address == address)
            .map(|op| op.value)
            .collect()
    }

    async fn simulate_io(&self, address: &str) -> AppResult<()> {
        let delay = self.network_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(AppError::plc_communication_error(format!("{} 未连接", self.service_name)));
        }
        if lock(&self.faulty_addresses).contains(address) {
            return Err(AppError::plc_communication_error(format!(
                "{} 地址 {} 通讯失败(模拟故障)",
                self.service_name, address
            )));
        }
        if self.random_failure() {
            return Err(AppError::plc_communication_error(format!(
                "{} 地址 {} 随机通讯错误",
                self.service_name, address
            )));
        }
        Ok(())
    }

    fn random_failure(&self) -> bool {
        let rate = f64::from_bits(self.error_rate_bits.load(Ordering::SeqCst));
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }

    fn store(&self, address: &str, value: PlcValue) {
        lock(&self.data_storage).insert(address.to_string(), value);
        lock(&self.write_log).push(WriteOperation {
            timestamp: Utc::now(),
            address: address.to_string(),
            value,
        });

        let links = lock(&self.wires).get(address).cloned().unwrap_or_default();
        for link in links {
            if let Some(transmitted) = link.behavior.transmit(value) {
                trace!("[MockPlc] {}:{} -> {}:{} = {:?}",
                       self.service_name, address, link.target_name, link.target_address, transmitted);
                lock(&link.target_storage).insert(link.target_address.clone(), transmitted);
            }
        }
    }
}

#[async_trait]
impl IPlcEndpoint for MockPlcService {
    fn endpoint_name(&self) -> String {
        self.service_name.clone()
    }

    async fn connect(&self) -> AppResult<()> {
        if self.fail_on_connect.load(Ordering::SeqCst) {
            return Err(AppError::plc_communication_error(format!("{} 连接失败(模拟)", self.service_name)));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            debug!("[MockPlc] {} 已连接", self.service_name);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_analog(&self, address: &str) -> AppResult<f32> {
        self.simulate_io(address).await?;
        match self.peek(address) {
            Some(PlcValue::Analog(v)) => Ok(v),
            Some(PlcValue::Digital(_)) => Err(AppError::plc_communication_error(format!(
                "地址 {} 不是模拟量", address
            ))),
            None => Ok(0.0),
        }
    }

    async fn write_analog(&self, address: &str, value: f32) -> AppResult<()> {
        self.simulate_io(address).await?;
        self.store(address, PlcValue::Analog(value));
        Ok(())
    }

    async fn read_digital(&self, address: &str) -> AppResult<bool> {
        self.simulate_io(address).await?;
        match self.peek(address) {
            Some(PlcValue::Digital(b)) => Ok(b),
            Some(PlcValue::Analog(_)) => Err(AppError::plc_communication_error(format!(
                "地址 {} 不是数字量", address
            ))),
            None => Ok(false),
        }
    }

    async fn write_digital(&self, address: &str, value: bool) -> AppResult<()> {
        self.simulate_io(address).await?;
        self.store(address, PlcValue::Digital(value));
        Ok(())
    }
}
