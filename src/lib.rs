/// FAT 硬点测试编排核心库
///
/// 通道分配、通道状态机、AI/AO/DI/DO 硬点测试任务以及有界并发的任务管理
pub mod models;
pub mod utils;
pub mod services;
pub mod logging;

// 重新导出常用类型，方便使用
pub use models::*;
pub use utils::{AppError, AppResult, AppConfig};
pub use services::*;
