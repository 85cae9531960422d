/// 测试协调服务
///
/// 面向界面/命令层的统一入口，负责：
/// 1. 导入通道并交给状态管理器初始化
/// 2. 调用分配服务生成批次与互补通道
/// 3. 接线确认后把通道交给测试任务管理器执行
/// 4. 汇总进度与批次状态

use crate::models::{Channel, HardPointStatus, ImportedChannelRecord, SubTestItem, TestBatchInfo, TestProgress};
use crate::services::channel_allocation_service::{
    BatchAllocationResult, ChannelAllocationService, IChannelAllocationService, TestPlcConfig,
};
use crate::services::domain::{
    ChannelRepository, ChannelStateManager, IChannelStateManager, TaskManagerOptions, TaskManagerStats,
    TestTaskManager,
};
use crate::services::infrastructure::event_publisher::{IEventPublisher, TestEvent};
use crate::services::infrastructure::plc::IPlcEndpoint;
use crate::utils::error::{AppError, AppResult};
use crate::log_user_operation;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use log::{debug, info, warn};

/// 导入结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// 成功导入的通道数
    pub imported: usize,
    /// 被拒绝的记录（位号: 原因）
    pub rejected: Vec<String>,
}

/// 测试协调服务接口
#[async_trait]
pub trait ITestCoordinationService: Send + Sync {
    /// 导入通道清单，替换现有通道
    async fn import_channels(&self, records: &[ImportedChannelRecord]) -> AppResult<ImportSummary>;

    /// 重新计算批次与互补通道分配
    async fn allocate(&self) -> AppResult<BatchAllocationResult>;

    /// 手动改接互补通道，返回被让出地址的通道ID
    async fn reassign_complementary(
        &self,
        channel_id: &str,
        complementary_tag: &str,
        complementary_address: &str,
    ) -> AppResult<Option<String>>;

    /// 准备接线确认：批次内待测通道进入等待状态并创建测试任务
    async fn prepare_wiring(&self, batch_name: Option<&str>) -> AppResult<Vec<String>>;

    /// 确认接线
    async fn confirm_wiring(&self) -> AppResult<()>;

    /// 测试指定批次中尚未完成硬点测试的通道
    async fn start_batch(&self, batch_name: &str) -> AppResult<bool>;

    /// 测试全部尚未完成硬点测试的通道，按批次顺序逐批执行
    async fn start_all_channels(&self) -> AppResult<bool>;

    async fn pause(&self) -> AppResult<()>;

    async fn resume(&self) -> AppResult<()>;

    async fn stop(&self) -> AppResult<()>;

    /// 单通道重测
    async fn retest_channel(&self, channel_id: &str) -> AppResult<bool>;

    /// 将通道标记为跳过
    async fn skip_channel(&self, channel_id: &str, reason: &str) -> AppResult<()>;

    /// 开始手动测试
    async fn begin_manual_test(&self, channel_id: &str) -> AppResult<()>;

    /// 记录手动子测试结果
    async fn set_manual_sub_test_outcome(
        &self,
        channel_id: &str,
        item: SubTestItem,
        passed: bool,
        detail: Option<&str>,
    ) -> AppResult<()>;

    fn progress(&self) -> TestProgress;

    /// 全部批次的汇总信息
    fn batches(&self) -> Vec<TestBatchInfo>;

    /// 全部通道快照
    fn channels(&self) -> Vec<Channel>;

    async fn stats(&self) -> TaskManagerStats;

    /// 停止测试并释放任务管理器
    async fn shutdown(&self);
}

/// 测试协调服务实现
pub struct TestCoordinationService {
    repository: ChannelRepository,
    state_manager: Arc<dyn IChannelStateManager>,
    allocation_service: Arc<dyn IChannelAllocationService>,
    task_manager: Arc<TestTaskManager>,
    publisher: Arc<dyn IEventPublisher>,
    /// 测试台架通道配置，None 时使用默认布局
    test_plc_config: Option<TestPlcConfig>,
    service_name: String,
}

impl TestCoordinationService {
    pub fn new(
        repository: ChannelRepository,
        state_manager: Arc<dyn IChannelStateManager>,
        allocation_service: Arc<dyn IChannelAllocationService>,
        task_manager: Arc<TestTaskManager>,
        publisher: Arc<dyn IEventPublisher>,
        test_plc_config: Option<TestPlcConfig>,
    ) -> Self {
        Self {
            repository,
            state_manager,
            allocation_service,
            task_manager,
            publisher,
            test_plc_config,
            service_name: "TestCoordinationService".to_string(),
        }
    }

    /// 以默认状态管理器与分配服务组装完整服务
    pub fn with_endpoints(
        test_plc: Arc<dyn IPlcEndpoint>,
        target_plc: Arc<dyn IPlcEndpoint>,
        publisher: Arc<dyn IEventPublisher>,
        options: TaskManagerOptions,
        test_plc_config: Option<TestPlcConfig>,
    ) -> Self {
        let repository = ChannelRepository::new();
        let state_manager: Arc<dyn IChannelStateManager> = Arc::new(ChannelStateManager::new());
        let task_manager = Arc::new(TestTaskManager::new(
            test_plc,
            target_plc,
            repository.clone(),
            state_manager.clone(),
            publisher.clone(),
            options,
        ));
        Self::new(
            repository,
            state_manager,
            Arc::new(ChannelAllocationService::new()),
            task_manager,
            publisher,
            test_plc_config,
        )
    }

    pub fn task_manager(&self) -> &Arc<TestTaskManager> {
        &self.task_manager
    }

    pub fn repository(&self) -> &ChannelRepository {
        &self.repository
    }

    /// 运行期间不允许修改通道集合与分配
    fn ensure_idle(&self, operation: &str) -> AppResult<()> {
        if self.task_manager.is_run_active() {
            return Err(AppError::concurrency_error(format!("测试运行中，不能{}", operation)));
        }
        Ok(())
    }

    /// 手动测试只能在该通道没有任何自动测试进行时操作
    fn ensure_manual_allowed(&self, channel_id: &str) -> AppResult<()> {
        self.ensure_idle("操作手动测试")?;
        if self.task_manager.is_retesting(channel_id) {
            return Err(AppError::concurrency_error(format!("通道 {} 正在重测，不能操作手动测试", channel_id)));
        }
        Ok(())
    }

    /// 已分配且硬点测试尚未完成的通道
    fn pending_hard_point_ids(&self, batch_name: Option<&str>) -> Vec<String> {
        self.repository
            .list()
            .iter()
            .filter(|c| c.state.is_allocated())
            .filter(|c| batch_name.map_or(true, |name| c.state.batch_name.as_deref() == Some(name)))
            .filter(|c| !c.state.overall.is_terminal() && c.state.hard_point != HardPointStatus::Passed)
            .map(|c| c.id().to_string())
            .collect()
    }

    fn update_channel<R>(&self, channel_id: &str, f: impl FnOnce(&mut Channel) -> AppResult<R>) -> AppResult<R> {
        let result = self
            .repository
            .update(channel_id, f)
            .ok_or_else(|| AppError::not_found_error("Channel", format!("通道 {} 不存在", channel_id)))?;
        if result.is_ok() {
            self.publisher.publish(TestEvent::ResultsUpdated { channel_ids: vec![channel_id.to_string()] });
        }
        result
    }

    fn publish_batches(&self) {
        for info in self.batches() {
            self.publisher.publish(TestEvent::BatchStatusChanged(info));
        }
    }
}

#[async_trait]
impl ITestCoordinationService for TestCoordinationService {
    async fn import_channels(&self, records: &[ImportedChannelRecord]) -> AppResult<ImportSummary> {
        self.ensure_idle("导入通道")?;

        let mut summary = ImportSummary::default();
        let mut channels = Vec::with_capacity(records.len());
        for record in records {
            if channels.iter().any(|c: &Channel| c.id() == record.id) {
                warn!("[{}] 通道ID重复，忽略: {}", self.service_name, record.id);
                summary.rejected.push(format!("{}: 通道ID重复", record.tag));
                continue;
            }
            match self.state_manager.initialize_from_import(record) {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    warn!("[{}] 导入通道 {} 失败: {}", self.service_name, record.tag, e);
                    summary.rejected.push(format!("{}: {}", record.tag, e));
                }
            }
        }
        summary.imported = channels.len();

        self.task_manager.clear_all().await;
        self.task_manager.reset_wiring_confirmation();
        self.repository.replace_all(channels);

        info!("[{}] 导入通道 {} 个，拒绝 {} 个", self.service_name, summary.imported, summary.rejected.len());
        Ok(summary)
    }

    async fn allocate(&self) -> AppResult<BatchAllocationResult> {
        self.ensure_idle("重新分配")?;

        let result = self.repository.update_all(|channels| {
            self.allocation_service
                .allocate_and_apply(channels, self.state_manager.as_ref(), self.test_plc_config.as_ref())
        });
        self.task_manager.clear_all().await;
        self.task_manager.reset_wiring_confirmation();

        info!("[{}] 分配完成: {} 个批次, 已分配 {} 个, 未分配 {} 个",
              self.service_name,
              result.batches.len(),
              result.allocation_summary.allocated_count,
              result.unassigned.len());
        self.publisher.publish(TestEvent::ResultsUpdated {
            channel_ids: self.repository.list().iter().map(|c| c.id().to_string()).collect(),
        });
        self.publish_batches();
        Ok(result)
    }

    async fn reassign_complementary(
        &self,
        channel_id: &str,
        complementary_tag: &str,
        complementary_address: &str,
    ) -> AppResult<Option<String>> {
        self.ensure_idle("改接互补通道")?;

        let displaced = self.repository.update_all(|channels| {
            self.allocation_service.reassign_complementary(
                channels,
                self.state_manager.as_ref(),
                channel_id,
                complementary_tag,
                complementary_address,
            )
        })?;

        // 旧任务仍指向原互补地址
        self.task_manager.remove_task(channel_id).await;
        if let Some(displaced_id) = &displaced {
            self.task_manager.remove_task(displaced_id).await;
        }
        self.task_manager.reset_wiring_confirmation();

        let mut changed = vec![channel_id.to_string()];
        changed.extend(displaced.clone());
        self.publisher.publish(TestEvent::ResultsUpdated { channel_ids: changed });
        Ok(displaced)
    }

    async fn prepare_wiring(&self, batch_name: Option<&str>) -> AppResult<Vec<String>> {
        self.ensure_idle("准备接线")?;

        let ids = self.pending_hard_point_ids(batch_name);
        let now = Utc::now();
        for id in &ids {
            self.repository
                .update(id, |c| self.state_manager.prepare_for_wiring_confirmation(c, now));
        }
        let created = self.task_manager.create_tasks(&ids).await;
        debug!("[{}] 等待接线确认的通道 {} 个", self.service_name, created.len());
        self.publisher.publish(TestEvent::ResultsUpdated { channel_ids: ids });
        Ok(created)
    }

    async fn confirm_wiring(&self) -> AppResult<()> {
        self.task_manager.confirm_wiring();
        Ok(())
    }

    async fn start_batch(&self, batch_name: &str) -> AppResult<bool> {
        if !self.repository.batch_names().iter().any(|name| name == batch_name) {
            return Err(AppError::not_found_error("Batch", format!("批次 {} 不存在", batch_name)));
        }
        let ids = self.pending_hard_point_ids(Some(batch_name));
        log_user_operation!("开始测试批次 {} ({} 个通道)", batch_name, ids.len());
        self.task_manager.start_all(&ids).await
    }

    async fn start_all_channels(&self) -> AppResult<bool> {
        // 不同批次复用同一组测试PLC通道，只能逐批执行
        let groups: Vec<Vec<String>> = self
            .repository
            .batch_names()
            .iter()
            .map(|name| self.pending_hard_point_ids(Some(name.as_str())))
            .filter(|ids| !ids.is_empty())
            .collect();
        let total: usize = groups.iter().map(Vec::len).sum();
        log_user_operation!("开始测试全部通道 ({} 个, {} 个批次)", total, groups.len());
        self.task_manager.start_in_groups(&groups).await
    }

    async fn pause(&self) -> AppResult<()> {
        self.task_manager.pause_all();
        Ok(())
    }

    async fn resume(&self) -> AppResult<()> {
        self.task_manager.resume_all();
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.task_manager.stop_all();
        Ok(())
    }

    async fn retest_channel(&self, channel_id: &str) -> AppResult<bool> {
        self.task_manager.retest_channel(channel_id).await
    }

    async fn skip_channel(&self, channel_id: &str, reason: &str) -> AppResult<()> {
        self.ensure_idle("跳过通道")?;
        let now = Utc::now();
        self.update_channel(channel_id, |c| {
            self.state_manager.mark_skipped(c, reason, now);
            Ok(())
        })?;
        self.task_manager.remove_task(channel_id).await;
        log_user_operation!("跳过通道 {}: {}", channel_id, reason);
        self.publish_batches();
        Ok(())
    }

    async fn begin_manual_test(&self, channel_id: &str) -> AppResult<()> {
        self.ensure_manual_allowed(channel_id)?;
        self.update_channel(channel_id, |c| self.state_manager.begin_manual_test(c))
    }

    async fn set_manual_sub_test_outcome(
        &self,
        channel_id: &str,
        item: SubTestItem,
        passed: bool,
        detail: Option<&str>,
    ) -> AppResult<()> {
        self.ensure_manual_allowed(channel_id)?;
        let now = Utc::now();
        self.update_channel(channel_id, |c| {
            self.state_manager.set_manual_sub_test_outcome(c, item, passed, now, detail)
        })?;
        log_user_operation!("通道 {} 手动测试 {}: {}", channel_id, item, if passed { "通过" } else { "失败" });
        self.publish_batches();
        Ok(())
    }

    fn progress(&self) -> TestProgress {
        self.repository.progress()
    }

    fn batches(&self) -> Vec<TestBatchInfo> {
        let channels = self.repository.list();
        self.repository
            .batch_names()
            .iter()
            .map(|name| self.state_manager.roll_up_batch(name, &channels))
            .collect()
    }

    fn channels(&self) -> Vec<Channel> {
        self.repository.list()
    }

    async fn stats(&self) -> TaskManagerStats {
        self.task_manager.stats().await
    }

    async fn shutdown(&self) {
        info!("[{}] 关闭服务", self.service_name);
        self.task_manager.stop_all();
        self.task_manager.dispose().await;
    }
}
