/// PLC端点接口定义
///
/// 测试PLC与被测PLC各自对应一个独立实例，测试任务只依赖此接口。
/// 普通通讯失败以 `Err(AppError::PlcCommunicationError)` 返回，实现不得 panic。
/// 多个测试任务会并发调用同一个端点，实现需自行保证内部并发安全。

use async_trait::async_trait;
use crate::utils::error::AppResult;

/// PLC端点接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IPlcEndpoint: Send + Sync {
    /// 端点名称，用于日志
    fn endpoint_name(&self) -> String;

    /// 建立连接，已连接时直接返回成功
    async fn connect(&self) -> AppResult<()>;

    /// 当前是否已连接
    fn is_connected(&self) -> bool;

    /// 读取模拟量（工程值）
    async fn read_analog(&self, address: &str) -> AppResult<f32>;

    /// 写入模拟量（工程值）
    async fn write_analog(&self, address: &str, value: f32) -> AppResult<()>;

    /// 读取数字量
    async fn read_digital(&self, address: &str) -> AppResult<bool>;

    /// 写入数字量
    async fn write_digital(&self, address: &str, value: bool) -> AppResult<()>;
}
