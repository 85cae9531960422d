/// 硬点测试任务
///
/// 每个通道一个测试任务，按模块类型执行固定的信号交换流程：
/// - AI: 测试台架AO依次输出 0/25/50/75/100% 量程，读取被测AI
/// - AO: 被测AO依次输出五个百分比点，读取测试台架AI
/// - DI: 测试台架DO先置ON再置OFF，读取被测DI
/// - DO: 被测DO先置OFF再置ON，测试台架DI读回
///
/// 每次硬件写入前检查取消与暂停；稳定等待和硬件调用都可被取消。
/// 流程结束后（包括取消）总会执行一次尽力而为的复位，复位失败只追加到结果描述。

use crate::models::{
    Channel, ChannelPointDefinition, HardPointTestRawResult, ModuleType, TestTaskReport, PERCENT_POINTS,
};
use crate::services::infrastructure::plc::IPlcEndpoint;
use crate::utils::config::TestConfig;
use crate::utils::error::{AppError, AppResult};
use crate::{log_communication_failure, log_test_failure};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use log::{debug, info, warn};

/// 取消时使用的统一描述
pub const CANCELLED_REASON: &str = "测试已取消";

/// 稳定等待时间与精度容差
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestTiming {
    pub analog_settle: Duration,
    pub digital_settle: Duration,
    /// 模拟量允许偏差（百分比）
    pub tolerance_percent: f32,
}

impl TestTiming {
    pub fn from_config(config: &TestConfig) -> Self {
        Self {
            analog_settle: Duration::from_millis(config.analog_stabilization_time_ms),
            digital_settle: Duration::from_millis(config.digital_stabilization_time_ms),
            tolerance_percent: config.analog_tolerance_percent,
        }
    }

    /// 不等待，用于仿真与测试
    pub fn immediate(tolerance_percent: f32) -> Self {
        Self {
            analog_settle: Duration::ZERO,
            digital_settle: Duration::ZERO,
            tolerance_percent,
        }
    }
}

impl Default for TestTiming {
    fn default() -> Self {
        Self::from_config(&TestConfig::default())
    }
}

/// 测试运行上下文：取消令牌 + 暂停闸门
#[derive(Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, pause: watch::Receiver<bool>) -> Self {
        Self { cancel, pause }
    }

    /// 不受外部暂停控制的上下文（单通道重测等）
    pub fn detached(cancel: CancellationToken) -> Self {
        let (_sender, pause) = watch::channel(false);
        Self { cancel, pause }
    }

    /// 派生子上下文，子令牌随父令牌一起取消
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            pause: self.pause.clone(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn cancelled_error() -> AppError {
        AppError::cancelled(CANCELLED_REASON)
    }

    /// 检查点：已取消则返回错误；暂停时挂起直到恢复或取消
    pub async fn checkpoint(&self) -> AppResult<()> {
        let mut pause = self.pause.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(Self::cancelled_error());
            }
            if !*pause.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Self::cancelled_error()),
                changed = pause.changed() => {
                    if changed.is_err() {
                        // 发送端已释放，视为不再暂停
                        return if self.cancel.is_cancelled() { Err(Self::cancelled_error()) } else { Ok(()) };
                    }
                }
            }
        }
    }

    /// 可取消的稳定等待
    pub async fn settle(&self, duration: Duration) -> AppResult<()> {
        if duration.is_zero() {
            return if self.cancel.is_cancelled() { Err(Self::cancelled_error()) } else { Ok(()) };
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Self::cancelled_error()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// 可取消的硬件调用
    pub async fn guard<T, F>(&self, operation: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Self::cancelled_error()),
            result = operation => result,
        }
    }
}

/// 测试任务接口
#[async_trait]
pub trait ITestTask: Send + Sync {
    /// 任务ID
    fn task_id(&self) -> &str;

    /// 对应的通道ID
    fn channel_id(&self) -> &str;

    fn module_type(&self) -> ModuleType;

    /// 执行硬点测试；取消时返回 `AppError::OperationCancelled`
    async fn run(&self, ctx: &RunContext) -> AppResult<TestTaskReport>;

    /// 释放任务：取消正在进行的运行，之后的运行直接返回取消
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// 模拟量偏差判定：|actual - expected| / |expected| * 100 <= tolerance；期望值为0时视为通过
pub fn within_tolerance(expected: f32, actual: f32, tolerance_percent: f32) -> bool {
    if expected == 0.0 {
        return true;
    }
    deviation_percent(expected, actual) <= tolerance_percent
}

fn deviation_percent(expected: f32, actual: f32) -> f32 {
    if expected == 0.0 {
        return 0.0;
    }
    (actual - expected).abs() / expected.abs() * 100.0
}

/// 各类测试任务共享的部分
struct TaskCore {
    task_id: String,
    definition: Arc<ChannelPointDefinition>,
    /// 测试台架互补通道地址
    complementary_address: String,
    test_plc: Arc<dyn IPlcEndpoint>,
    target_plc: Arc<dyn IPlcEndpoint>,
    timing: TestTiming,
    disposed: AtomicBool,
    current_token: Mutex<Option<CancellationToken>>,
}

impl TaskCore {
    fn new(
        definition: Arc<ChannelPointDefinition>,
        complementary_address: String,
        test_plc: Arc<dyn IPlcEndpoint>,
        target_plc: Arc<dyn IPlcEndpoint>,
        timing: TestTiming,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            definition,
            complementary_address,
            test_plc,
            target_plc,
            timing,
            disposed: AtomicBool::new(false),
            current_token: Mutex::new(None),
        }
    }

    fn tag(&self) -> &str {
        &self.definition.tag
    }

    /// 开始一次运行，返回与本任务绑定的子上下文
    fn begin(&self, ctx: &RunContext) -> AppResult<RunContext> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RunContext::cancelled_error());
        }
        let child = ctx.child();
        *self.current_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(child.token().clone());
        if self.disposed.load(Ordering::SeqCst) {
            child.token().cancel();
        }
        Ok(child)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!("[TestTask] 释放任务 {} (通道 {})", self.task_id, self.tag());
        }
        if let Some(token) = self.current_token.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
    }

    async fn connect_endpoints(&self, ctx: &RunContext) -> AppResult<()> {
        for endpoint in [&self.test_plc, &self.target_plc] {
            if !endpoint.is_connected() {
                ctx.guard(endpoint.connect()).await?;
            }
        }
        Ok(())
    }

    /// 写入前检查取消/暂停，然后可取消地写入
    async fn write_analog(&self, ctx: &RunContext, plc: &Arc<dyn IPlcEndpoint>, address: &str, value: f32) -> AppResult<()> {
        ctx.checkpoint().await?;
        ctx.guard(plc.write_analog(address, value)).await
    }

    async fn write_digital(&self, ctx: &RunContext, plc: &Arc<dyn IPlcEndpoint>, address: &str, value: bool) -> AppResult<()> {
        ctx.checkpoint().await?;
        ctx.guard(plc.write_digital(address, value)).await
    }

    /// 汇总交换结果与复位结果
    fn finish(
        &self,
        label: &str,
        outcome: AppResult<Vec<String>>,
        reset: AppResult<()>,
        readings: Option<[Option<f32>; 5]>,
    ) -> AppResult<TestTaskReport> {
        self.current_token.lock().unwrap_or_else(PoisonError::into_inner).take();

        let mut raw_result = match outcome {
            Ok(failures) if failures.is_empty() => HardPointTestRawResult::passed(format!("{}硬点测试通过", label)),
            Ok(failures) => {
                let detail = failures.join("; ");
                log_test_failure!("{} 通道 {}: {}", label, self.tag(), detail);
                HardPointTestRawResult::failed(detail)
            }
            Err(e) if e.is_cancelled() => {
                info!("[TestTask] {} 通道 {} 已取消", label, self.tag());
                if let Err(reset_error) = reset {
                    warn!("[TestTask] 通道 {} 取消后复位失败: {}", self.tag(), reset_error);
                }
                return Err(e);
            }
            Err(e) => {
                log_communication_failure!("{} 通道 {}: {}", label, self.tag(), e);
                HardPointTestRawResult::failed(format!("通讯失败: {}", e))
            }
        };

        if let Err(reset_error) = reset {
            warn!("[TestTask] 通道 {} 复位失败: {}", self.tag(), reset_error);
            raw_result.detail.push_str(&format!("; 复位失败: {}", reset_error));
        }

        Ok(TestTaskReport { raw_result, percent_readings: readings })
    }
}

/// 模拟量五点交换：`output` 端写入，`input` 端读回
async fn analog_exchange(
    core: &TaskCore,
    ctx: &RunContext,
    output: (&Arc<dyn IPlcEndpoint>, &str),
    input: (&Arc<dyn IPlcEndpoint>, &str),
    readings: &mut [Option<f32>; 5],
) -> AppResult<Vec<String>> {
    core.connect_endpoints(ctx).await?;

    let mut failures = Vec::new();
    for (index, pct) in PERCENT_POINTS.iter().enumerate() {
        let expected = core.definition.value_at_percent(*pct);
        core.write_analog(ctx, output.0, output.1, expected).await?;
        ctx.settle(core.timing.analog_settle).await?;
        let actual = ctx.guard(input.0.read_analog(input.1)).await?;
        readings[index] = Some(actual);

        if within_tolerance(expected, actual, core.timing.tolerance_percent) {
            debug!("[TestTask] {} {}%点: 期望 {:.3}, 实际 {:.3}", core.tag(), pct, expected, actual);
        } else {
            failures.push(format!(
                "{}%点偏差超限: 期望 {:.3}, 实际 {:.3}, 偏差 {:.2}%",
                pct, expected, actual, deviation_percent(expected, actual)
            ));
        }
    }
    Ok(failures)
}

/// AI 通道测试任务
pub struct AiTestTask {
    core: TaskCore,
}

impl AiTestTask {
    async fn exchange(&self, ctx: &RunContext, readings: &mut [Option<f32>; 5]) -> AppResult<Vec<String>> {
        let core = &self.core;
        analog_exchange(
            core,
            ctx,
            (&core.test_plc, core.complementary_address.as_str()),
            (&core.target_plc, core.definition.comm_address.as_str()),
            readings,
        )
        .await
    }

    async fn reset(&self) -> AppResult<()> {
        let core = &self.core;
        core.test_plc
            .write_analog(&core.complementary_address, core.definition.range_lower)
            .await
    }
}

#[async_trait]
impl ITestTask for AiTestTask {
    fn task_id(&self) -> &str {
        &self.core.task_id
    }

    fn channel_id(&self) -> &str {
        &self.core.definition.id
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::AI
    }

    async fn run(&self, ctx: &RunContext) -> AppResult<TestTaskReport> {
        let ctx = self.core.begin(ctx)?;
        debug!("[AiTestTask] 开始测试通道 {}", self.core.tag());
        let mut readings = [None; 5];
        let outcome = self.exchange(&ctx, &mut readings).await;
        let reset = self.reset().await;
        self.core.finish("AI", outcome, reset, Some(readings))
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }
}

/// AO 通道测试任务
pub struct AoTestTask {
    core: TaskCore,
}

impl AoTestTask {
    async fn exchange(&self, ctx: &RunContext, readings: &mut [Option<f32>; 5]) -> AppResult<Vec<String>> {
        let core = &self.core;
        analog_exchange(
            core,
            ctx,
            (&core.target_plc, core.definition.comm_address.as_str()),
            (&core.test_plc, core.complementary_address.as_str()),
            readings,
        )
        .await
    }

    async fn reset(&self) -> AppResult<()> {
        let core = &self.core;
        core.target_plc
            .write_analog(&core.definition.comm_address, core.definition.range_lower)
            .await
    }
}

#[async_trait]
impl ITestTask for AoTestTask {
    fn task_id(&self) -> &str {
        &self.core.task_id
    }

    fn channel_id(&self) -> &str {
        &self.core.definition.id
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::AO
    }

    async fn run(&self, ctx: &RunContext) -> AppResult<TestTaskReport> {
        let ctx = self.core.begin(ctx)?;
        debug!("[AoTestTask] 开始测试通道 {}", self.core.tag());
        let mut readings = [None; 5];
        let outcome = self.exchange(&ctx, &mut readings).await;
        let reset = self.reset().await;
        self.core.finish("AO", outcome, reset, Some(readings))
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }
}

/// DI 通道测试任务
pub struct DiTestTask {
    core: TaskCore,
}

impl DiTestTask {
    async fn exchange(&self, ctx: &RunContext) -> AppResult<Vec<String>> {
        let core = &self.core;
        core.connect_endpoints(ctx).await?;

        // ON 阶段通过后才进行 OFF 阶段
        for (phase, value) in [("ON", true), ("OFF", false)] {
            core.write_digital(ctx, &core.test_plc, &core.complementary_address, value).await?;
            ctx.settle(core.timing.digital_settle).await?;
            let actual = ctx.guard(core.target_plc.read_digital(&core.definition.comm_address)).await?;
            if actual != value {
                return Ok(vec![format!("{}阶段失败: 期望 {}, 实际 {}", phase, value, actual)]);
            }
            debug!("[DiTestTask] {} {}阶段通过", core.tag(), phase);
        }
        Ok(Vec::new())
    }

    async fn reset(&self) -> AppResult<()> {
        self.core
            .test_plc
            .write_digital(&self.core.complementary_address, false)
            .await
    }
}

#[async_trait]
impl ITestTask for DiTestTask {
    fn task_id(&self) -> &str {
        &self.core.task_id
    }

    fn channel_id(&self) -> &str {
        &self.core.definition.id
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::DI
    }

    async fn run(&self, ctx: &RunContext) -> AppResult<TestTaskReport> {
        let ctx = self.core.begin(ctx)?;
        debug!("[DiTestTask] 开始测试通道 {}", self.core.tag());
        let outcome = self.exchange(&ctx).await;
        let reset = self.reset().await;
        self.core.finish("DI", outcome, reset, None)
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }
}

/// DO 通道测试任务
pub struct DoTestTask {
    core: TaskCore,
}

impl DoTestTask {
    async fn exchange(&self, ctx: &RunContext) -> AppResult<Vec<String>> {
        let core = &self.core;
        core.connect_endpoints(ctx).await?;

        let mut failed_phases = Vec::new();
        for (phase, value) in [("OFF", false), ("ON", true)] {
            core.write_digital(ctx, &core.target_plc, &core.definition.comm_address, value).await?;
            ctx.settle(core.timing.digital_settle).await?;
            let actual = ctx.guard(core.test_plc.read_digital(&core.complementary_address)).await?;
            if actual != value {
                failed_phases.push(phase);
            }
        }

        Ok(match failed_phases.as_slice() {
            [] => Vec::new(),
            [phase] => vec![format!("{}阶段失败", phase)],
            _ => vec!["OFF与ON阶段均失败".to_string()],
        })
    }

    async fn reset(&self) -> AppResult<()> {
        self.core
            .target_plc
            .write_digital(&self.core.definition.comm_address, false)
            .await
    }
}

#[async_trait]
impl ITestTask for DoTestTask {
    fn task_id(&self) -> &str {
        &self.core.task_id
    }

    fn channel_id(&self) -> &str {
        &self.core.definition.id
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::DO
    }

    async fn run(&self, ctx: &RunContext) -> AppResult<TestTaskReport> {
        let ctx = self.core.begin(ctx)?;
        debug!("[DoTestTask] 开始测试通道 {}", self.core.tag());
        let outcome = self.exchange(&ctx).await;
        let reset = self.reset().await;
        self.core.finish("DO", outcome, reset, None)
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }
}

/// 按模块类型创建测试任务；通道未分配互补通道时返回错误
pub fn create_test_task(
    channel: &Channel,
    test_plc: Arc<dyn IPlcEndpoint>,
    target_plc: Arc<dyn IPlcEndpoint>,
    timing: TestTiming,
) -> AppResult<Arc<dyn ITestTask>> {
    let complementary_address = channel
        .state
        .complementary_address
        .clone()
        .ok_or_else(|| {
            AppError::validation_error(format!("通道 {} 尚未分配测试台架通道", channel.definition.tag))
        })?;

    let core = TaskCore::new(channel.definition.clone(), complementary_address, test_plc, target_plc, timing);
    let task: Arc<dyn ITestTask> = match channel.module_type() {
        ModuleType::AI => Arc::new(AiTestTask { core }),
        ModuleType::AO => Arc::new(AoTestTask { core }),
        ModuleType::DI => Arc::new(DiTestTask { core }),
        ModuleType::DO => Arc::new(DoTestTask { core }),
    };
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImportedChannelRecord;
    use crate::services::domain::{ChannelStateManager, IChannelStateManager};
    use crate::services::infrastructure::plc::{MockIPlcEndpoint, MockPlcService, PlcValue, WireBehavior};

    const HARNESS_ADDR: &str = "40101";
    const DUT_ADDR: &str = "40001";

    fn channel(module_type: &str, lower: &str, upper: &str) -> Channel {
        let record = ImportedChannelRecord {
            id: format!("{}_001", module_type),
            tag: format!("{}101", module_type),
            module_type: module_type.to_string(),
            comm_address: DUT_ADDR.to_string(),
            range_lower: Some(lower.to_string()),
            range_upper: Some(upper.to_string()),
            ..ImportedChannelRecord::default()
        };
        let manager = ChannelStateManager::new();
        let mut ch = manager.initialize_from_import(&record).unwrap();
        manager.apply_allocation(&mut ch, "批次1", "H1_1", HARNESS_ADDR);
        ch
    }

    fn wired_pair(forward: bool, behavior: WireBehavior) -> (Arc<MockPlcService>, Arc<MockPlcService>) {
        let harness = Arc::new(MockPlcService::new("TestPlc"));
        let dut = Arc::new(MockPlcService::new("TargetPlc"));
        if forward {
            harness.wire_to(HARNESS_ADDR, &dut, DUT_ADDR, behavior);
        } else {
            dut.wire_to(DUT_ADDR, &harness, HARNESS_ADDR, behavior);
        }
        (harness, dut)
    }

    fn ctx() -> RunContext {
        RunContext::detached(CancellationToken::new())
    }

    fn timing() -> TestTiming {
        TestTiming::immediate(1.0)
    }

    #[test]
    fn test_tolerance() {
        assert!(within_tolerance(50.0, 50.4, 1.0));
        assert!(!within_tolerance(50.0, 51.0, 1.0));
        assert!(within_tolerance(-50.0, -50.4, 1.0));
        assert!(within_tolerance(0.0, 3.0, 1.0));
    }

    #[tokio::test]
    async fn test_ai_passes_with_small_offset() {
        let (harness, dut) = wired_pair(true, WireBehavior::with_offset(0.4));
        // 偏移0.4在量程下限50处为0.8%
        let ch = channel("AI", "50", "150");
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();

        let report = task.run(&ctx()).await.unwrap();
        assert!(report.raw_result.success, "{}", report.raw_result.detail);
        let readings = report.percent_readings.unwrap();
        assert!((readings[2].unwrap() - 100.4).abs() < 1e-3);

        let writes = harness.writes_to(HARNESS_ADDR);
        assert_eq!(writes.len(), 6);
        assert_eq!(writes.last(), Some(&PlcValue::Analog(50.0)));
    }

    #[tokio::test]
    async fn test_ai_fails_on_large_deviation_and_collects_all_points() {
        let (harness, dut) = wired_pair(true, WireBehavior::with_gain(1.02));
        let ch = channel("AI", "0", "100");
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();

        let report = task.run(&ctx()).await.unwrap();
        assert!(!report.raw_result.success);
        assert!(report.raw_result.detail.contains("25%"));
        assert!(report.raw_result.detail.contains("100%"));
        assert!(report.percent_readings.unwrap().iter().all(|r| r.is_some()));
    }

    #[tokio::test]
    async fn test_ai_comm_error_aborts_remaining_points() {
        let (harness, dut) = wired_pair(true, WireBehavior::ideal());
        dut.inject_fault(DUT_ADDR);
        let ch = channel("AI", "0", "100");
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();

        let report = task.run(&ctx()).await.unwrap();
        assert!(!report.raw_result.success);
        assert!(report.raw_result.detail.contains("通讯失败"));
        assert!(report.percent_readings.unwrap().iter().all(|r| r.is_none()));
        // 一次测试写入 + 一次复位
        assert_eq!(harness.writes_to(HARNESS_ADDR).len(), 2);
    }

    #[tokio::test]
    async fn test_ao_reads_back_through_harness() {
        let (harness, dut) = wired_pair(false, WireBehavior::ideal());
        let ch = channel("AO", "4", "20");
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();

        let report = task.run(&ctx()).await.unwrap();
        assert!(report.raw_result.success, "{}", report.raw_result.detail);
        assert_eq!(dut.writes_to(DUT_ADDR).last(), Some(&PlcValue::Analog(4.0)));
    }

    #[tokio::test]
    async fn test_di_exact_match_and_second_phase_only_after_first() {
        let (harness, dut) = wired_pair(true, WireBehavior::ideal());
        let ch = channel("DI", "", "");
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();
        let report = task.run(&ctx()).await.unwrap();
        assert!(report.raw_result.success);
        assert!(report.percent_readings.is_none());

        let (harness, dut) = wired_pair(true, WireBehavior::broken());
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();
        let report = task.run(&ctx()).await.unwrap();
        assert!(!report.raw_result.success);
        assert!(report.raw_result.detail.starts_with("ON阶段失败"));
        // ON 写入 + 复位写入，OFF 阶段未执行
        assert_eq!(
            harness.writes_to(HARNESS_ADDR),
            vec![PlcValue::Digital(true), PlcValue::Digital(false)]
        );
    }

    #[tokio::test]
    async fn test_do_phases_fail_independently() {
        let ch = channel("DO", "", "");

        let (harness, dut) = wired_pair(false, WireBehavior::stuck_at(true));
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();
        let report = task.run(&ctx()).await.unwrap();
        assert_eq!(report.raw_result.detail, "OFF阶段失败");

        let (harness, dut) = wired_pair(false, WireBehavior::stuck_at(false));
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();
        let report = task.run(&ctx()).await.unwrap();
        assert_eq!(report.raw_result.detail, "ON阶段失败");
        assert_eq!(dut.writes_to(DUT_ADDR).last(), Some(&PlcValue::Digital(false)));

        let (harness, dut) = wired_pair(false, WireBehavior::ideal());
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();
        assert!(task.run(&ctx()).await.unwrap().raw_result.success);
    }

    #[tokio::test]
    async fn test_do_inverted_wiring_fails_both_phases() {
        let mut dut = MockIPlcEndpoint::new();
        dut.expect_is_connected().return_const(true);
        dut.expect_write_digital().times(3).returning(|_, _| Ok(()));

        // 测试台架读回始终与被测输出相反
        let mut harness = MockIPlcEndpoint::new();
        harness.expect_is_connected().return_const(true);
        let mut reads = 0;
        harness.expect_read_digital().times(2).returning(move |_| {
            reads += 1;
            Ok(reads == 1)
        });

        let ch = channel("DO", "", "");
        let task = create_test_task(&ch, Arc::new(harness), Arc::new(dut), timing()).unwrap();
        let report = task.run(&ctx()).await.unwrap();
        assert!(!report.raw_result.success);
        assert_eq!(report.raw_result.detail, "OFF与ON阶段均失败");
    }

    #[tokio::test]
    async fn test_cancellation_still_resets() {
        let (harness, dut) = wired_pair(true, WireBehavior::ideal());
        let ch = channel("AI", "10", "110");
        let slow = TestTiming {
            analog_settle: Duration::from_secs(30),
            ..timing()
        };
        let task = create_test_task(&ch, harness.clone(), dut.clone(), slow).unwrap();

        let token = CancellationToken::new();
        let run_ctx = RunContext::detached(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let error = task.run(&run_ctx).await.unwrap_err();
        canceller.await.unwrap();
        assert!(error.is_cancelled());
        // 0%点写入 + 复位写入
        assert_eq!(
            harness.writes_to(HARNESS_ADDR),
            vec![PlcValue::Analog(10.0), PlcValue::Analog(10.0)]
        );
    }

    #[tokio::test]
    async fn test_pause_blocks_writes_until_resumed() {
        let (harness, dut) = wired_pair(true, WireBehavior::ideal());
        let ch = channel("DI", "", "");
        let task = create_test_task(&ch, harness.clone(), dut.clone(), timing()).unwrap();

        let (pause_tx, pause_rx) = watch::channel(true);
        let run_ctx = RunContext::new(CancellationToken::new(), pause_rx);
        let handle = tokio::spawn(async move { task.run(&run_ctx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!harness.was_address_written(HARNESS_ADDR));

        pause_tx.send(false).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert!(report.raw_result.success);
    }

    #[tokio::test]
    async fn test_disposed_task_does_not_touch_hardware() {
        let mut endpoint = MockIPlcEndpoint::new();
        endpoint.expect_write_digital().never();
        endpoint.expect_write_analog().never();
        let endpoint: Arc<dyn IPlcEndpoint> = Arc::new(endpoint);

        let ch = channel("DO", "", "");
        let task = create_test_task(&ch, endpoint.clone(), endpoint, timing()).unwrap();
        task.dispose();
        task.dispose();
        assert!(task.is_disposed());
        assert!(task.run(&ctx()).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_reset_failure_is_appended_not_raised() {
        let mut harness = MockIPlcEndpoint::new();
        harness.expect_is_connected().return_const(true);
        let mut writes = 0;
        harness.expect_write_digital().times(3).returning(move |_, _| {
            writes += 1;
            if writes == 3 {
                Err(AppError::plc_communication_error("复位写入超时"))
            } else {
                Ok(())
            }
        });

        let mut dut = MockIPlcEndpoint::new();
        dut.expect_is_connected().return_const(true);
        let mut reads = 0;
        dut.expect_read_digital().times(2).returning(move |_| {
            reads += 1;
            Ok(reads == 1)
        });

        let ch = channel("DI", "", "");
        let task = create_test_task(&ch, Arc::new(harness), Arc::new(dut), timing()).unwrap();
        let report = task.run(&ctx()).await.unwrap();
        assert!(report.raw_result.success);
        assert!(report.raw_result.detail.contains("复位失败"));
    }

    #[test]
    fn test_factory_requires_allocation() {
        let record = ImportedChannelRecord {
            id: "DO_002".to_string(),
            tag: "DO102".to_string(),
            module_type: "DO".to_string(),
            comm_address: "00002".to_string(),
            ..ImportedChannelRecord::default()
        };
        let ch = ChannelStateManager::new().initialize_from_import(&record).unwrap();
        let endpoint: Arc<dyn IPlcEndpoint> = Arc::new(MockPlcService::new("plc"));
        let result = create_test_task(&ch, endpoint.clone(), endpoint, timing());
        assert!(result.is_err());

        let ch = channel("AO", "0", "100");
        let task = create_test_task(&ch, Arc::new(MockPlcService::new("a")), Arc::new(MockPlcService::new("b")), timing()).unwrap();
        assert_eq!(task.module_type(), ModuleType::AO);
        assert_eq!(task.channel_id(), "AO_001");
        assert!(!task.task_id().is_empty());
    }
}
