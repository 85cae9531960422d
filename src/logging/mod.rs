//! # 日志记录模块 (Logging Module)
//!
//! ## 业务说明
//! 基于 `log` 门面与 `env_logger` 后端，记录测试编排过程中的关键事件
//!
//! ## 日志策略
//! - **业务日志**: 通道分配、接线确认、批次启动等操作
//! - **系统日志**: PLC连接、任务调度
//! - **错误日志**: 通讯失败、测试失败，便于问题定位

pub mod logger_config;

pub use logger_config::*;

/// 便捷日志宏 - 记录核心问题日志

/// 记录通讯失败日志
#[macro_export]
macro_rules! log_communication_failure {
    ($msg:expr) => {
        log::error!("[通讯失败] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::error!("[通讯失败] {}", format!($msg, $($arg)*));
    };
}

/// 记录测试执行失败日志
#[macro_export]
macro_rules! log_test_failure {
    ($msg:expr) => {
        log::error!("[测试执行失败] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::error!("[测试执行失败] {}", format!($msg, $($arg)*));
    };
}

/// 记录用户操作日志
#[macro_export]
macro_rules! log_user_operation {
    ($msg:expr) => {
        log::info!("[用户操作] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::info!("[用户操作] {}", format!($msg, $($arg)*));
    };
}

/// 记录配置警告
#[macro_export]
macro_rules! log_config_warning {
    ($msg:expr) => {
        log::warn!("[配置警告] {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        log::warn!("[配置警告] {}", format!($msg, $($arg)*));
    };
}

// 重新导出宏
pub use log_communication_failure;
pub use log_test_failure;
pub use log_user_operation;
pub use log_config_warning;
