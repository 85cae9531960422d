/// 测试任务管理器
///
/// 为每个通道构建一个测试任务并在有界并发下运行：
/// - 计数信号量是唯一的准入控制，默认容量为逻辑CPU数的2倍
/// - 每次运行共享一个取消令牌（stop_all 触发），暂停通过 watch 闸门实现
/// - 单个任务的失败、异常或取消只影响该通道，在任务边界转换为状态转换
/// - 注册表按通道ID保存任务，同一通道任意时刻最多一个任务
///
/// 两个PLC端点在所有任务间共享，管理器不对其访问做串行化。

use crate::models::{HardPointTestRawResult, RunState, TestProgress, TestTaskReport};
use crate::services::domain::channel_repository::ChannelRepository;
use crate::services::domain::channel_state_manager::IChannelStateManager;
use crate::services::domain::specific_test_executors::{
    create_test_task, ITestTask, RunContext, TestTiming, CANCELLED_REASON,
};
use crate::services::infrastructure::event_publisher::{IEventPublisher, TestEvent};
use crate::services::infrastructure::plc::IPlcEndpoint;
use crate::utils::config::AppConfig;
use crate::utils::error::{AppError, AppResult};
use crate::{log_communication_failure, log_test_failure, log_user_operation};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use log::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 管理器选项
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskManagerOptions {
    /// 并发上限
    pub max_concurrent_tasks: usize,
    pub timing: TestTiming,
}

impl TaskManagerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_tasks: config.app_settings.effective_max_concurrent_tasks(),
            timing: TestTiming::from_config(&config.test_config),
        }
    }
}

impl Default for TaskManagerOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 管理器统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManagerStats {
    pub max_concurrent_tasks: usize,
    /// 注册表中的任务数
    pub registered_tasks: usize,
    /// 正在执行的任务数
    pub active_tasks: usize,
    /// 最近一次运行中同时执行任务数的峰值
    pub peak_active_tasks: usize,
    /// 已完成的批量运行次数
    pub completed_runs: usize,
}

#[derive(Default)]
struct TaskCounters {
    active: AtomicUsize,
    peak: AtomicUsize,
    completed_runs: AtomicUsize,
}

/// 执行中计数，离开作用域（包括 panic 展开）时自动减一
struct ActiveGuard(Arc<TaskCounters>);

impl ActiveGuard {
    fn enter(counters: &Arc<TaskCounters>) -> Self {
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(active, Ordering::SeqCst);
        Self(counters.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 在任务边界把结果转换为通道状态转换
#[derive(Clone)]
struct OutcomeApplier {
    repository: ChannelRepository,
    state_manager: Arc<dyn IChannelStateManager>,
    publisher: Arc<dyn IEventPublisher>,
    counters: Arc<TaskCounters>,
}

impl OutcomeApplier {
    async fn run_task(&self, task: Arc<dyn ITestTask>, ctx: RunContext) {
        let channel_id = task.channel_id().to_string();
        let started = self
            .repository
            .update(&channel_id, |c| self.state_manager.begin_hard_point_test(c, Utc::now()));
        if started.is_none() {
            warn!("[TestTaskManager] 通道 {} 不存在，跳过任务", channel_id);
            return;
        }

        let result = {
            let _active = ActiveGuard::enter(&self.counters);
            task.run(&ctx).await
        };
        self.apply(&channel_id, result);
    }

    fn apply(&self, channel_id: &str, result: AppResult<TestTaskReport>) {
        let now = Utc::now();
        let state_manager = &self.state_manager;
        self.repository.update(channel_id, |channel| match result {
            Ok(report) => {
                if let Some(readings) = report.percent_readings {
                    state_manager.record_percent_readings(channel, readings);
                }
                state_manager.set_hard_point_outcome(channel, &report.raw_result, now);
            }
            Err(e) if e.is_cancelled() => state_manager.mark_skipped(channel, CANCELLED_REASON, now),
            Err(e) => {
                log_test_failure!("通道 {} 执行异常: {}", channel.definition.tag, e);
                let result = HardPointTestRawResult::failed(format!("测试执行异常: {}", e));
                state_manager.set_hard_point_outcome(channel, &result, now);
            }
        });
        self.publisher.publish(TestEvent::ResultsUpdated { channel_ids: vec![channel_id.to_string()] });
    }

    /// 未开始执行即被取消的通道；已处于终态的保持不变
    fn cancel_unscheduled(&self, channel_id: &str) {
        let now = Utc::now();
        let changed = self.repository.update(channel_id, |channel| {
            if channel.state.overall.is_terminal() {
                false
            } else {
                self.state_manager.mark_skipped(channel, CANCELLED_REASON, now);
                true
            }
        });
        if changed == Some(true) {
            self.publisher.publish(TestEvent::ResultsUpdated { channel_ids: vec![channel_id.to_string()] });
        }
    }

    fn apply_join_error(&self, channel_id: &str, join_error: JoinError) {
        if join_error.is_cancelled() {
            self.cancel_unscheduled(channel_id);
            return;
        }
        error!("[TestTaskManager] 通道 {} 的任务异常终止: {}", channel_id, join_error);
        self.apply(
            channel_id,
            Err(AppError::test_execution_error("HardPoint", format!("任务异常终止: {}", join_error))),
        );
    }
}

/// 测试任务管理器
pub struct TestTaskManager {
    test_plc: Arc<dyn IPlcEndpoint>,
    target_plc: Arc<dyn IPlcEndpoint>,
    repository: ChannelRepository,
    state_manager: Arc<dyn IChannelStateManager>,
    publisher: Arc<dyn IEventPublisher>,
    timing: TestTiming,
    max_concurrent_tasks: usize,
    semaphore: Arc<Semaphore>,
    /// 通道ID -> 任务
    tasks: RwLock<HashMap<String, Arc<dyn ITestTask>>>,
    applier: OutcomeApplier,
    counters: Arc<TaskCounters>,
    /// 所有运行令牌的父令牌，dispose 时取消
    shutdown: CancellationToken,
    run_token: Mutex<Option<CancellationToken>>,
    /// 正在单独重测的通道
    retests: Mutex<HashMap<String, CancellationToken>>,
    pause_tx: watch::Sender<bool>,
    run_state: Mutex<RunState>,
    run_active: AtomicBool,
    wiring_confirmed: AtomicBool,
    disposed: AtomicBool,
}

impl TestTaskManager {
    pub fn new(
        test_plc: Arc<dyn IPlcEndpoint>,
        target_plc: Arc<dyn IPlcEndpoint>,
        repository: ChannelRepository,
        state_manager: Arc<dyn IChannelStateManager>,
        publisher: Arc<dyn IEventPublisher>,
        options: TaskManagerOptions,
    ) -> Self {
        let max_concurrent_tasks = options.max_concurrent_tasks.max(1);
        let counters = Arc::new(TaskCounters::default());
        let (pause_tx, _) = watch::channel(false);

        info!("[TestTaskManager] 初始化: 并发上限 {}, 测试PLC {}, 被测PLC {}",
              max_concurrent_tasks, test_plc.endpoint_name(), target_plc.endpoint_name());

        Self {
            applier: OutcomeApplier {
                repository: repository.clone(),
                state_manager: state_manager.clone(),
                publisher: publisher.clone(),
                counters: counters.clone(),
            },
            test_plc,
            target_plc,
            repository,
            state_manager,
            publisher,
            timing: options.timing,
            max_concurrent_tasks,
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks)),
            tasks: RwLock::new(HashMap::new()),
            counters,
            shutdown: CancellationToken::new(),
            run_token: Mutex::new(None),
            retests: Mutex::new(HashMap::new()),
            pause_tx,
            run_state: Mutex::new(RunState::Idle),
            run_active: AtomicBool::new(false),
            wiring_confirmed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    // ---- 接线确认 ----

    pub fn confirm_wiring(&self) {
        self.wiring_confirmed.store(true, Ordering::SeqCst);
        log_user_operation!("确认接线");
    }

    /// 重新分配后接线需要重新确认
    pub fn reset_wiring_confirmation(&self) {
        self.wiring_confirmed.store(false, Ordering::SeqCst);
    }

    pub fn is_wiring_confirmed(&self) -> bool {
        self.wiring_confirmed.load(Ordering::SeqCst)
    }

    // ---- 任务注册表 ----

    /// 为通道创建测试任务并注册，返回成功创建的通道ID
    pub async fn create_tasks(&self, channel_ids: &[String]) -> Vec<String> {
        let mut created = Vec::new();
        for channel_id in channel_ids {
            if let Some(task) = self.build_task(channel_id) {
                self.insert_task(task).await;
                created.push(channel_id.clone());
            }
        }
        debug!("[TestTaskManager] 创建任务 {} 个 (请求 {} 个)", created.len(), channel_ids.len());
        self.publish_task_ids().await;
        created
    }

    fn build_task(&self, channel_id: &str) -> Option<Arc<dyn ITestTask>> {
        let channel = match self.repository.get(channel_id) {
            Some(channel) => channel,
            None => {
                warn!("[TestTaskManager] 通道 {} 不存在，未创建任务", channel_id);
                return None;
            }
        };
        match create_test_task(&channel, self.test_plc.clone(), self.target_plc.clone(), self.timing) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("[TestTaskManager] 跳过通道 {}: {}", channel.definition.tag, e);
                None
            }
        }
    }

    /// 注册任务；同一通道已有任务时先释放旧任务
    pub async fn add_task(&self, task: Arc<dyn ITestTask>) {
        self.insert_task(task).await;
        self.publish_task_ids().await;
    }

    async fn insert_task(&self, task: Arc<dyn ITestTask>) {
        let channel_id = task.channel_id().to_string();
        let previous = self.tasks.write().await.insert(channel_id.clone(), task);
        if let Some(previous) = previous {
            debug!("[TestTaskManager] 通道 {} 已有任务 {}，释放旧任务", channel_id, previous.task_id());
            previous.dispose();
        }
    }

    /// 移除并释放任务
    pub async fn remove_task(&self, channel_id: &str) -> bool {
        let removed = self.tasks.write().await.remove(channel_id);
        match removed {
            Some(task) => {
                task.dispose();
                self.publish_task_ids().await;
                true
            }
            None => false,
        }
    }

    /// 释放并清空全部任务
    pub async fn clear_all(&self) {
        let drained: Vec<_> = self.tasks.write().await.drain().map(|(_, task)| task).collect();
        for task in &drained {
            task.dispose();
        }
        if !drained.is_empty() {
            info!("[TestTaskManager] 已清空 {} 个任务", drained.len());
        }
        self.publish_task_ids().await;
    }

    pub async fn get_task(&self, channel_id: &str) -> Option<Arc<dyn ITestTask>> {
        self.tasks.read().await.get(channel_id).cloned()
    }

    /// 注册的任务对应的通道ID（排序）
    pub async fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn publish_task_ids(&self) {
        let ids = self.task_ids().await;
        self.publisher.publish(TestEvent::ChannelIdsChanged(ids));
    }

    // ---- 运行控制 ----

    fn set_run_state(&self, state: RunState) {
        *lock(&self.run_state) = state;
        self.publisher.publish(TestEvent::RunStateChanged(state));
    }

    pub fn run_state(&self) -> RunState {
        *lock(&self.run_state)
    }

    pub fn is_run_active(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    pub fn is_retesting(&self, channel_id: &str) -> bool {
        lock(&self.retests).contains_key(channel_id)
    }

    async fn connect_endpoints(&self) -> AppResult<()> {
        for (role, endpoint) in [("测试PLC", &self.test_plc), ("被测PLC", &self.target_plc)] {
            if endpoint.is_connected() {
                continue;
            }
            if let Err(e) = endpoint.connect().await {
                log_communication_failure!("{} {} 连接失败: {}", role, endpoint.endpoint_name(), e);
                return Err(e);
            }
            info!("[TestTaskManager] {} {} 已连接", role, endpoint.endpoint_name());
        }
        Ok(())
    }

    /// 启动批量测试，等待全部任务结束后返回
    ///
    /// 接线未确认、已有运行（或单通道重测）进行中、管理器已释放时返回 `Ok(false)` 且不产生副作用；
    /// 任一PLC连接失败时返回错误，整批不启动。
    pub async fn start_all(&self, channel_ids: &[String]) -> AppResult<bool> {
        self.start_in_groups(&[channel_ids.to_vec()]).await
    }

    /// 在同一次运行内依次执行多组通道，上一组全部结束后才派发下一组
    ///
    /// 共用测试PLC通道的批次必须分组执行。停止请求对尚未开始的组同样生效，其通道被标记为跳过。
    pub async fn start_in_groups(&self, groups: &[Vec<String>]) -> AppResult<bool> {
        if self.disposed.load(Ordering::SeqCst) {
            warn!("[TestTaskManager] 管理器已释放，拒绝启动");
            return Ok(false);
        }
        if !self.is_wiring_confirmed() {
            warn!("[TestTaskManager] 接线未确认，拒绝启动");
            return Ok(false);
        }
        if self
            .run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("[TestTaskManager] 已有测试在运行，拒绝启动");
            return Ok(false);
        }
        if !lock(&self.retests).is_empty() {
            warn!("[TestTaskManager] 有通道正在重测，拒绝启动");
            self.run_active.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        if let Err(e) = self.connect_endpoints().await {
            self.run_active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let token = self.shutdown.child_token();
        *lock(&self.run_token) = Some(token.clone());
        self.pause_tx.send_replace(false);
        self.counters.peak.store(0, Ordering::SeqCst);
        self.set_run_state(RunState::Running);

        let mut seen = HashSet::new();
        let mut dispatched_ids = Vec::new();
        for group in groups {
            let group_ids = self.run_group(group, &mut seen, &token).await;
            dispatched_ids.extend(group_ids);
        }

        *lock(&self.run_token) = None;
        self.pause_tx.send_replace(false);
        self.counters.completed_runs.fetch_add(1, Ordering::SeqCst);
        self.run_active.store(false, Ordering::SeqCst);
        self.set_run_state(RunState::Idle);

        self.publisher.publish(TestEvent::ResultsUpdated { channel_ids: dispatched_ids.clone() });
        self.publish_batch_statuses(&dispatched_ids);

        let progress = self.progress();
        info!("[TestTaskManager] 批量测试结束: 通过 {}, 失败 {}, 跳过 {}, 待测 {}",
              progress.passed, progress.failed, progress.skipped, progress.pending);
        Ok(true)
    }

    /// 派发一组通道并等待其全部结束，返回实际派发的通道ID
    async fn run_group<'a>(
        &self,
        channel_ids: &'a [String],
        seen: &mut HashSet<&'a str>,
        token: &CancellationToken,
    ) -> Vec<String> {
        let mut dispatch = Vec::with_capacity(channel_ids.len());
        for channel_id in channel_ids {
            if !seen.insert(channel_id.as_str()) {
                debug!("[TestTaskManager] 忽略重复的通道 {}", channel_id);
                continue;
            }
            let task = match self.get_task(channel_id).await {
                Some(task) if !task.is_disposed() => Some(task),
                _ => match self.build_task(channel_id) {
                    Some(task) => {
                        self.insert_task(task.clone()).await;
                        Some(task)
                    }
                    None => None,
                },
            };
            if let Some(task) = task {
                dispatch.push(task);
            }
        }
        self.publish_task_ids().await;

        info!("[TestTaskManager] 开始测试分组: {} 个通道, 并发上限 {}", dispatch.len(), self.max_concurrent_tasks);

        let mut dispatched_ids = Vec::with_capacity(dispatch.len());
        let mut handles = Vec::with_capacity(dispatch.len());
        for task in dispatch {
            let channel_id = task.channel_id().to_string();
            let applier = self.applier.clone();
            let semaphore = self.semaphore.clone();
            let ctx = RunContext::new(token.clone(), self.pause_tx.subscribe());

            dispatched_ids.push(channel_id.clone());
            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = ctx.token().cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    applier.cancel_unscheduled(&channel_id);
                    return;
                };
                if ctx.is_cancelled() {
                    applier.cancel_unscheduled(&channel_id);
                    return;
                }
                applier.run_task(task, ctx).await;
            }));
        }

        let results = join_all(handles).await;
        for (channel_id, result) in dispatched_ids.iter().zip(results) {
            if let Err(join_error) = result {
                self.applier.apply_join_error(channel_id, join_error);
            }
        }
        dispatched_ids
    }

    /// 暂停：运行中的任务在下一次写入前挂起
    pub fn pause_all(&self) {
        if !self.is_run_active() {
            debug!("[TestTaskManager] 无运行中的测试，忽略暂停");
            return;
        }
        self.pause_tx.send_replace(true);
        self.set_run_state(RunState::Paused);
        log_user_operation!("暂停全部测试");
    }

    pub fn resume_all(&self) {
        if !*self.pause_tx.borrow() {
            return;
        }
        self.pause_tx.send_replace(false);
        if self.is_run_active() {
            self.set_run_state(RunState::Running);
        }
        log_user_operation!("恢复全部测试");
    }

    /// 取消当前运行与全部单通道重测
    pub fn stop_all(&self) {
        let run_token = lock(&self.run_token).clone();
        let retest_tokens: Vec<CancellationToken> = lock(&self.retests).values().cloned().collect();
        if run_token.is_none() && retest_tokens.is_empty() {
            debug!("[TestTaskManager] 无运行中的测试，忽略停止");
            return;
        }
        if let Some(token) = run_token {
            self.set_run_state(RunState::Stopping);
            token.cancel();
        }
        for token in retest_tokens {
            token.cancel();
        }
        log_user_operation!("停止全部测试");
    }

    /// 单通道重测：重置状态后在并发池之外运行一个新任务，并等待其结束
    ///
    /// 批量运行进行中、该通道已在重测或管理器已释放时返回 `Ok(false)`。
    pub async fn retest_channel(&self, channel_id: &str) -> AppResult<bool> {
        if self.disposed.load(Ordering::SeqCst) || self.is_run_active() {
            warn!("[TestTaskManager] 当前不能重测通道 {}", channel_id);
            return Ok(false);
        }
        let channel = self
            .repository
            .get(channel_id)
            .ok_or_else(|| AppError::not_found_error("Channel", format!("通道 {} 不存在", channel_id)))?;
        let task = create_test_task(&channel, self.test_plc.clone(), self.target_plc.clone(), self.timing)?;

        let token = self.shutdown.child_token();
        {
            let mut retests = lock(&self.retests);
            if retests.contains_key(channel_id) {
                warn!("[TestTaskManager] 通道 {} 已在重测中", channel_id);
                return Ok(false);
            }
            retests.insert(channel_id.to_string(), token.clone());
        }
        if self.is_run_active() {
            lock(&self.retests).remove(channel_id);
            return Ok(false);
        }

        log_user_operation!("重测通道 {}", channel.definition.tag);
        self.add_task(task.clone()).await;
        self.repository
            .update(channel_id, |c| self.state_manager.reset_for_retest(c));

        let applier = self.applier.clone();
        let ctx = RunContext::detached(token);
        let handle = tokio::spawn(async move { applier.run_task(task, ctx).await });
        if let Err(join_error) = handle.await {
            self.applier.apply_join_error(channel_id, join_error);
        }

        lock(&self.retests).remove(channel_id);
        self.publish_batch_statuses(&[channel_id.to_string()]);
        Ok(true)
    }

    /// 释放管理器：取消全部运行，释放所有任务并关闭信号量；可重复调用
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[TestTaskManager] 释放管理器");
        self.shutdown.cancel();
        self.semaphore.close();
        self.clear_all().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // ---- 查询 ----

    pub fn progress(&self) -> TestProgress {
        self.repository.progress()
    }

    pub async fn stats(&self) -> TaskManagerStats {
        TaskManagerStats {
            max_concurrent_tasks: self.max_concurrent_tasks,
            registered_tasks: self.tasks.read().await.len(),
            active_tasks: self.counters.active.load(Ordering::SeqCst),
            peak_active_tasks: self.counters.peak.load(Ordering::SeqCst),
            completed_runs: self.counters.completed_runs.load(Ordering::SeqCst),
        }
    }

    /// 发布这些通道所在批次的最新汇总
    fn publish_batch_statuses(&self, channel_ids: &[String]) {
        let channels = self.repository.list();
        let mut batch_names: Vec<String> = channels
            .iter()
            .filter(|c| channel_ids.iter().any(|id| id == c.id()))
            .filter_map(|c| c.state.batch_name.clone())
            .collect();
        batch_names.sort();
        batch_names.dedup();

        for batch_name in batch_names {
            let info = self.state_manager.roll_up_batch(&batch_name, &channels);
            debug!("[TestTaskManager] 批次 {} 状态 {:?}", batch_name, info.status);
            self.publisher.publish(TestEvent::BatchStatusChanged(info));
        }
    }
}
