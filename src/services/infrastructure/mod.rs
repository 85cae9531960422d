/// 基础设施层
///
/// PLC端点实现与事件发布

pub mod plc;
pub mod event_publisher;

pub use plc::*;
pub use event_publisher::{IEventPublisher, BroadcastEventPublisher, NoopEventPublisher, TestEvent};
