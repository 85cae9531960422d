/// 服务层模块
/// 包含所有业务逻辑和基础设施服务

/// 基础设施层服务 (PLC端点与事件发布)
pub mod infrastructure;

/// 领域服务层 (状态机、测试任务与任务管理)
pub mod domain;

/// 应用层服务 (业务流程协调)
pub mod application;

/// 通道分配服务
pub mod channel_allocation_service;

// 重新导出常用类型
pub use infrastructure::plc::{IPlcEndpoint, MockPlcService, ModbusPlcService, WireBehavior};
pub use infrastructure::event_publisher::{BroadcastEventPublisher, IEventPublisher, NoopEventPublisher, TestEvent};
pub use domain::{
    ChannelRepository, ChannelStateManager, IChannelStateManager,
    ITestTask, RunContext, TestTiming, create_test_task,
    TaskManagerOptions, TaskManagerStats, TestTaskManager,
};
pub use application::{ITestCoordinationService, ImportSummary, TestCoordinationService};
pub use channel_allocation_service::{
    BatchAllocationResult, ChannelAllocationService, IChannelAllocationService, TestPlcConfig,
};
