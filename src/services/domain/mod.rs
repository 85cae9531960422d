/// 领域服务层
///
/// 通道状态机、测试任务协议与并发任务管理

/// 通道状态管理器 - 通道状态的唯一修改入口
pub mod channel_state_manager;

/// 通道仓储
pub mod channel_repository;

/// AI/AO/DI/DO 硬点测试任务
pub mod specific_test_executors;

/// 测试任务管理器 - 有界并发、暂停/停止与重测
pub mod test_task_manager;

pub use channel_state_manager::{ChannelStateManager, IChannelStateManager};
pub use channel_repository::ChannelRepository;
pub use specific_test_executors::{
    create_test_task, within_tolerance, AiTestTask, AoTestTask, DiTestTask, DoTestTask, ITestTask,
    RunContext, TestTiming, CANCELLED_REASON,
};
pub use test_task_manager::{TaskManagerOptions, TaskManagerStats, TestTaskManager};
