/// 事件发布器
///
/// 向外部观察者（界面、报告等）发布通道与批次变化事件，发布方不等待订阅方处理

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use log::{debug, trace};

use crate::models::{RunState, TestBatchInfo};

/// 默认事件缓冲容量
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// 测试编排事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestEvent {
    /// 任务对应的通道ID列表发生变化
    ChannelIdsChanged(Vec<String>),
    /// 通道测试结果已更新
    ResultsUpdated { channel_ids: Vec<String> },
    /// 批次汇总状态变化
    BatchStatusChanged(TestBatchInfo),
    /// 运行状态变化
    RunStateChanged(RunState),
}

/// 事件发布接口
pub trait IEventPublisher: Send + Sync {
    /// 发布事件，不阻塞、不返回错误
    fn publish(&self, event: TestEvent);
}

/// 基于 tokio broadcast 的事件发布器
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<TestEvent>,
}

impl BroadcastEventPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<TestEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl IEventPublisher for BroadcastEventPublisher {
    fn publish(&self, event: TestEvent) {
        trace!("[EventPublisher] 发布事件: {:?}", event);
        if self.sender.send(event).is_err() {
            // 没有订阅者
            debug!("[EventPublisher] 当前无订阅者，事件已丢弃");
        }
    }
}

/// 不做任何事的发布器
pub struct NoopEventPublisher;

impl IEventPublisher for NoopEventPublisher {
    fn publish(&self, _event: TestEvent) {}
}
