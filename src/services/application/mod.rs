/// 应用层服务模块
///
/// 协调领域服务与基础设施服务，向命令层提供完整的测试流程API

/// 测试协调服务 - 导入、分配、接线确认与测试执行的统一入口
pub mod test_coordination_service;

pub use test_coordination_service::{ITestCoordinationService, ImportSummary, TestCoordinationService};
