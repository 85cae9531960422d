/// 通道状态管理器
///
/// 唯一负责修改通道测试状态（ChannelTestState）的组件。
/// 所有转换函数都是纯函数：只修改传入的通道，不做IO。每次转换后都满足：
/// `final_test_time.is_some()` 当且仅当整体状态为 通过/失败/跳过。

use crate::models::{
    BatchStatus, Channel, ChannelPointDefinition, ChannelTestState, HardPointStatus,
    HardPointTestRawResult, ImportedAlarm, ImportedChannelRecord, ModuleType, OverallStatus,
    SubTestItem, SubTestStatus, TestBatchInfo, AlarmSetpoint,
};
use crate::utils::error::{AppError, AppResult};
use crate::log_config_warning;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use log::{debug, error, trace};

/// 默认量程
const DEFAULT_RANGE: (f32, f32) = (0.0, 100.0);

/// 通道状态管理器接口
pub trait IChannelStateManager: Send + Sync {
    /// 由导入记录创建通道（定义 + 初始状态）
    fn initialize_from_import(&self, record: &ImportedChannelRecord) -> AppResult<Channel>;

    /// 写入分配结果并清空既有测试结果
    fn apply_allocation(&self, channel: &mut Channel, batch_name: &str, complementary_tag: &str, complementary_address: &str);

    /// 清除分配并清空既有测试结果
    fn clear_allocation(&self, channel: &mut Channel);

    /// 释放测试台架互补通道（保留批次），用于手动重新分配时让出地址
    fn release_complementary(&self, channel: &mut Channel);

    /// 标记为跳过
    fn mark_skipped(&self, channel: &mut Channel, reason: &str, now: DateTime<Utc>);

    /// 准备接线确认
    fn prepare_for_wiring_confirmation(&self, channel: &mut Channel, now: DateTime<Utc>);

    /// 开始硬点测试
    fn begin_hard_point_test(&self, channel: &mut Channel, now: DateTime<Utc>);

    /// 应用硬点测试结果
    fn set_hard_point_outcome(&self, channel: &mut Channel, result: &HardPointTestRawResult, now: DateTime<Utc>);

    /// 记录模拟量五点读数
    fn record_percent_readings(&self, channel: &mut Channel, readings: [Option<f32>; 5]);

    /// 开始手动测试
    fn begin_manual_test(&self, channel: &mut Channel) -> AppResult<()>;

    /// 设置某个手动子测试的结果
    fn set_manual_sub_test_outcome(
        &self,
        channel: &mut Channel,
        item: SubTestItem,
        passed: bool,
        now: DateTime<Utc>,
        detail: Option<&str>,
    ) -> AppResult<()>;

    /// 重置为重测状态（保留分配信息）
    fn reset_for_retest(&self, channel: &mut Channel);

    /// 根据通道状态归并批次信息
    fn roll_up_batch(&self, batch_name: &str, channels: &[Channel]) -> TestBatchInfo;
}

/// 通道状态管理器实现
#[derive(Debug, Default, Clone)]
pub struct ChannelStateManager;

impl ChannelStateManager {
    pub fn new() -> Self {
        Self
    }

    /// 按模块类型与报警配置生成子测试初始状态
    pub fn default_sub_tests(definition: &ChannelPointDefinition) -> BTreeMap<SubTestItem, SubTestStatus> {
        let mut sub_tests = BTreeMap::new();
        for item in SubTestItem::ALL {
            let status = match definition.module_type {
                ModuleType::AI => match item {
                    SubTestItem::LowLowAlarm
                    | SubTestItem::LowAlarm
                    | SubTestItem::HighAlarm
                    | SubTestItem::HighHighAlarm => {
                        let configured = definition.alarm(item).map(|a| a.is_configured()).unwrap_or(false);
                        if configured { SubTestStatus::NotTested } else { SubTestStatus::NotApplicable }
                    }
                    SubTestItem::AlarmValueSet => {
                        let any_configured = [&definition.sll, &definition.sl, &definition.sh, &definition.shh]
                            .iter()
                            .any(|a| a.is_configured());
                        if any_configured { SubTestStatus::NotTested } else { SubTestStatus::NotApplicable }
                    }
                    _ => SubTestStatus::NotTested,
                },
                ModuleType::AO | ModuleType::DI | ModuleType::DO => match item {
                    SubTestItem::ShowValue => SubTestStatus::NotTested,
                    SubTestItem::MaintenanceFunction if definition.module_type == ModuleType::AO => {
                        SubTestStatus::Passed
                    }
                    _ => SubTestStatus::NotApplicable,
                },
            };
            sub_tests.insert(item, status);
        }
        sub_tests
    }

    /// 检查通道状态的不变量，返回违反项描述
    pub fn check_invariants(state: &ChannelTestState) -> Vec<String> {
        let mut violations = Vec::new();

        if state.final_test_time.is_some() != state.overall.is_terminal() {
            violations.push(format!(
                "最终测试时间与整体状态不一致: 状态={}, 最终时间={:?}",
                state.overall.code(),
                state.final_test_time
            ));
        }
        if state.overall == OverallStatus::Skipped && state.hard_point != HardPointStatus::Skipped {
            violations.push(format!("跳过的通道硬点状态应为Skipped, 实际为 {}", state.hard_point));
        }
        if state.hard_point.is_failed() && state.overall != OverallStatus::Failed {
            violations.push(format!("硬点失败但整体状态为 {}", state.overall.code()));
        }
        if state.overall == OverallStatus::Passed {
            if state.hard_point != HardPointStatus::Passed {
                violations.push(format!("整体通过但硬点状态为 {}", state.hard_point));
            }
            if state
                .sub_tests
                .values()
                .any(|s| !matches!(s, SubTestStatus::Passed | SubTestStatus::NotApplicable))
            {
                violations.push("整体通过但存在未完成或失败的子测试".to_string());
            }
        }
        violations
    }

    fn verify(&self, channel: &Channel, transition: &str) {
        let violations = Self::check_invariants(&channel.state);
        if !violations.is_empty() {
            error!("[ChannelStateManager] {} 后状态不一致 - 通道: {}, {:?}",
                   transition, channel.definition.tag, violations);
        }
    }

    /// 依据硬点与子测试重新评估整体状态
    fn evaluate_overall_status(&self, state: &mut ChannelTestState, now: DateTime<Utc>) {
        let any_sub_failed = state.sub_tests.values().any(|s| *s == SubTestStatus::Failed);
        let all_sub_done = state
            .sub_tests
            .values()
            .all(|s| matches!(s, SubTestStatus::Passed | SubTestStatus::NotApplicable));

        let new_status = if state.hard_point.is_failed() || any_sub_failed {
            OverallStatus::Failed
        } else if state.hard_point == HardPointStatus::Passed && all_sub_done {
            OverallStatus::Passed
        } else {
            OverallStatus::NotTested
        };

        trace!("[ChannelStateManager] 评估整体状态: {} -> {}", state.overall.code(), new_status.code());

        match new_status {
            OverallStatus::Passed | OverallStatus::Failed => {
                if state.overall != new_status || state.final_test_time.is_none() {
                    state.final_test_time = Some(now);
                }
            }
            _ => state.final_test_time = None,
        }
        state.overall = new_status;
    }

    fn reset_test_results(definition: &ChannelPointDefinition, state: &mut ChannelTestState) {
        state.overall = OverallStatus::NotTested;
        state.hard_point = HardPointStatus::NotTested;
        state.sub_tests = Self::default_sub_tests(definition);
        state.result_text.clear();
        state.start_time = None;
        state.test_time = None;
        state.final_test_time = None;
        state.percent_readings = [None; 5];
    }

    fn parse_range_value(raw: Option<&str>, field: &str, tag: &str) -> AppResult<Option<f32>> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(None),
            Some(text) => text.parse::<f32>().map(Some).map_err(|_| {
                AppError::validation_error(format!("通道 {} 的{}无法解析: {}", tag, field, text))
            }),
        }
    }

    fn build_alarm(imported: &ImportedAlarm) -> AlarmSetpoint {
        let raw = imported
            .raw
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let value = raw.as_deref().and_then(|s| s.parse::<f32>().ok());
        AlarmSetpoint {
            raw,
            value,
            plc_address: imported.plc_address.clone().filter(|s| !s.trim().is_empty()),
            comm_address: imported.comm_address.clone().filter(|s| !s.trim().is_empty()),
        }
    }
}

impl IChannelStateManager for ChannelStateManager {
    fn initialize_from_import(&self, record: &ImportedChannelRecord) -> AppResult<Channel> {
        let module_type: ModuleType = record.module_type.parse()?;

        let lower = Self::parse_range_value(record.range_lower.as_deref(), "量程下限", &record.tag)?;
        let upper = Self::parse_range_value(record.range_upper.as_deref(), "量程上限", &record.tag)?;
        let mut range = (
            lower.unwrap_or(DEFAULT_RANGE.0),
            upper.unwrap_or(DEFAULT_RANGE.1),
        );
        if range.1 < range.0 {
            log_config_warning!("通道 {} 量程上限 {} 小于下限 {}，已重置为 [0,100]", record.tag, range.1, range.0);
            range = DEFAULT_RANGE;
        }

        let definition = ChannelPointDefinition {
            id: record.id.clone(),
            variable_name: record.variable_name.clone(),
            tag: record.tag.clone(),
            module_type,
            comm_address: record.comm_address.trim().to_string(),
            range_lower: range.0,
            range_upper: range.1,
            sll: Self::build_alarm(&record.sll),
            sl: Self::build_alarm(&record.sl),
            sh: Self::build_alarm(&record.sh),
            shh: Self::build_alarm(&record.shh),
            maintenance_switch_address: record
                .maintenance_switch_address
                .clone()
                .filter(|s| !s.trim().is_empty()),
        };

        let state = ChannelTestState {
            sub_tests: Self::default_sub_tests(&definition),
            ..ChannelTestState::default()
        };

        debug!("[ChannelStateManager] 初始化通道: {} ({})", definition.tag, module_type);
        let channel = Channel { definition: Arc::new(definition), state };
        self.verify(&channel, "initialize_from_import");
        Ok(channel)
    }

    fn apply_allocation(&self, channel: &mut Channel, batch_name: &str, complementary_tag: &str, complementary_address: &str) {
        let state = &mut channel.state;
        state.batch_name = Some(batch_name.to_string());
        state.complementary_tag = Some(complementary_tag.to_string());
        state.complementary_address = Some(complementary_address.to_string());
        Self::reset_test_results(&channel.definition, state);
        self.verify(channel, "apply_allocation");
    }

    fn clear_allocation(&self, channel: &mut Channel) {
        let state = &mut channel.state;
        state.batch_name = None;
        state.complementary_tag = None;
        state.complementary_address = None;
        Self::reset_test_results(&channel.definition, state);
        self.verify(channel, "clear_allocation");
    }

    fn release_complementary(&self, channel: &mut Channel) {
        let state = &mut channel.state;
        state.complementary_tag = None;
        state.complementary_address = None;
        Self::reset_test_results(&channel.definition, state);
        self.verify(channel, "release_complementary");
    }

    fn mark_skipped(&self, channel: &mut Channel, reason: &str, now: DateTime<Utc>) {
        let state = &mut channel.state;
        state.overall = OverallStatus::Skipped;
        state.hard_point = HardPointStatus::Skipped;
        for status in state.sub_tests.values_mut() {
            *status = SubTestStatus::NotApplicable;
        }
        state.result_text = reason.to_string();
        state.final_test_time = Some(now);
        debug!("[ChannelStateManager] 通道已跳过: {} - {}", channel.definition.tag, reason);
        self.verify(channel, "mark_skipped");
    }

    fn prepare_for_wiring_confirmation(&self, channel: &mut Channel, now: DateTime<Utc>) {
        let state = &mut channel.state;
        if state.overall == OverallStatus::NotTested && state.hard_point == HardPointStatus::NotTested {
            state.hard_point = HardPointStatus::Waiting;
            state.test_time = Some(now);
        }
        self.verify(channel, "prepare_for_wiring_confirmation");
    }

    fn begin_hard_point_test(&self, channel: &mut Channel, now: DateTime<Utc>) {
        let state = &mut channel.state;
        state.hard_point = HardPointStatus::Testing;
        state.start_time = Some(now);
        state.test_time = Some(now);
        state.percent_readings = [None; 5];
        state.result_text = "硬点测试中".to_string();
        state.overall = OverallStatus::NotTested;
        state.final_test_time = None;
        self.verify(channel, "begin_hard_point_test");
    }

    fn set_hard_point_outcome(&self, channel: &mut Channel, result: &HardPointTestRawResult, now: DateTime<Utc>) {
        let state = &mut channel.state;
        state.test_time = Some(now);
        if result.success {
            state.hard_point = HardPointStatus::Passed;
            state.result_text = if result.detail.is_empty() {
                "硬点测试通过".to_string()
            } else {
                result.detail.clone()
            };
            self.evaluate_overall_status(state, now);
            if state.overall == OverallStatus::NotTested {
                state.result_text.push_str("，等待手动测试");
            }
        } else {
            state.hard_point = HardPointStatus::Failed(result.detail.clone());
            state.result_text = format!("硬点测试失败: {}", result.detail);
            self.evaluate_overall_status(state, now);
            state.final_test_time = Some(now);
        }
        self.verify(channel, "set_hard_point_outcome");
    }

    fn record_percent_readings(&self, channel: &mut Channel, readings: [Option<f32>; 5]) {
        channel.state.percent_readings = readings;
    }

    fn begin_manual_test(&self, channel: &mut Channel) -> AppResult<()> {
        let state = &mut channel.state;
        if state.hard_point != HardPointStatus::Passed {
            return Err(AppError::state_transition_error(
                state.hard_point.to_string(),
                "ManualTesting",
                format!("通道 {} 硬点测试未通过，不能开始手动测试", channel.definition.tag),
            ));
        }

        for status in state.sub_tests.values_mut() {
            if *status == SubTestStatus::Failed {
                *status = SubTestStatus::NotTested;
            }
        }
        state.overall = OverallStatus::NotTested;
        state.final_test_time = None;
        self.verify(channel, "begin_manual_test");
        Ok(())
    }

    fn set_manual_sub_test_outcome(
        &self,
        channel: &mut Channel,
        item: SubTestItem,
        passed: bool,
        now: DateTime<Utc>,
        detail: Option<&str>,
    ) -> AppResult<()> {
        let tag = channel.definition.tag.clone();
        let state = &mut channel.state;
        if state.overall == OverallStatus::Skipped {
            return Err(AppError::state_transition_error(
                "Skipped",
                item.to_string(),
                format!("通道 {} 已跳过", tag),
            ));
        }
        if state.sub_test(item) == SubTestStatus::NotApplicable {
            return Err(AppError::validation_error(format!("通道 {} 的子测试 {} 不适用", tag, item)));
        }

        let status = if passed { SubTestStatus::Passed } else { SubTestStatus::Failed };
        state.sub_tests.insert(item, status);
        if let Some(detail) = detail.filter(|d| !d.is_empty()) {
            if !state.result_text.is_empty() {
                state.result_text.push_str("; ");
            }
            state.result_text.push_str(&format!("{}: {}", item, detail));
        }
        self.evaluate_overall_status(state, now);
        debug!("[ChannelStateManager] 手动子测试 {} {} -> {}, 整体状态 {}", tag, item, status, state.overall.code());
        self.verify(channel, "set_manual_sub_test_outcome");
        Ok(())
    }

    fn reset_for_retest(&self, channel: &mut Channel) {
        let state = &mut channel.state;
        if state.overall == OverallStatus::Skipped {
            // 跳过时子测试被全部置为不适用，重测需恢复
            state.sub_tests = Self::default_sub_tests(&channel.definition);
        }
        // 失败的手动子测试需要在新的硬点结果之后重新确认
        for status in state.sub_tests.values_mut() {
            if *status == SubTestStatus::Failed {
                *status = SubTestStatus::NotTested;
            }
        }
        state.hard_point = HardPointStatus::NotTested;
        state.result_text.clear();
        state.overall = OverallStatus::NotTested;
        state.final_test_time = None;
        state.start_time = None;
        self.verify(channel, "reset_for_retest");
    }

    fn roll_up_batch(&self, batch_name: &str, channels: &[Channel]) -> TestBatchInfo {
        let members: Vec<&ChannelTestState> = channels
            .iter()
            .map(|c| &c.state)
            .filter(|s| s.batch_name.as_deref() == Some(batch_name))
            .collect();

        let mut info = TestBatchInfo::new(batch_name, members.len());
        info.first_test_time = members.iter().filter_map(|s| s.start_time).min();
        info.last_test_time = members
            .iter()
            .filter_map(|s| s.final_test_time.or(s.test_time))
            .max();

        info.status = if members.is_empty() {
            BatchStatus::NotTested
        } else if members.iter().all(|s| s.overall == OverallStatus::Skipped) {
            BatchStatus::Skipped
        } else if members.iter().all(|s| s.overall.is_terminal()) {
            if members.iter().any(|s| s.overall == OverallStatus::Failed) {
                BatchStatus::CompletedWithFailures
            } else {
                BatchStatus::Completed
            }
        } else if members.iter().any(|s| s.start_time.is_some() || s.overall.is_terminal()) {
            BatchStatus::InProgress
        } else {
            BatchStatus::NotTested
        };
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(module_type: &str, with_alarms: bool) -> ImportedChannelRecord {
        let alarm = |raw: &str| ImportedAlarm {
            raw: if with_alarms { Some(raw.to_string()) } else { Some("  ".to_string()) },
            plc_address: None,
            comm_address: None,
        };
        ImportedChannelRecord {
            id: format!("{}_001", module_type),
            variable_name: "TT_101".to_string(),
            tag: format!("{}101", module_type),
            module_type: module_type.to_string(),
            comm_address: "40001".to_string(),
            range_lower: Some("0".to_string()),
            range_upper: Some("100".to_string()),
            sll: alarm("5"),
            sl: alarm("10"),
            sh: alarm("90"),
            shh: alarm("95"),
            maintenance_switch_address: None,
        }
    }

    fn channel(module_type: &str, with_alarms: bool) -> Channel {
        ChannelStateManager::new().initialize_from_import(&record(module_type, with_alarms)).unwrap()
    }

    #[test]
    fn test_initialize_marks_blank_alarms_not_applicable() {
        let ch = channel("AI", false);
        assert_eq!(ch.state.sub_test(SubTestItem::LowLowAlarm), SubTestStatus::NotApplicable);
        assert_eq!(ch.state.sub_test(SubTestItem::HighAlarm), SubTestStatus::NotApplicable);
        assert_eq!(ch.state.sub_test(SubTestItem::AlarmValueSet), SubTestStatus::NotApplicable);
        assert_eq!(ch.state.sub_test(SubTestItem::ShowValue), SubTestStatus::NotTested);

        let ch = channel("AI", true);
        assert_eq!(ch.state.sub_test(SubTestItem::LowLowAlarm), SubTestStatus::NotTested);
        assert_eq!(ch.definition.sh.value, Some(90.0));
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());
    }

    #[test]
    fn test_initialize_fixes_non_ai_sub_tests() {
        let ao = channel("AO", true);
        assert_eq!(ao.state.sub_test(SubTestItem::MaintenanceFunction), SubTestStatus::Passed);
        assert_eq!(ao.state.sub_test(SubTestItem::HighAlarm), SubTestStatus::NotApplicable);
        assert_eq!(ao.state.sub_test(SubTestItem::TrendCheck), SubTestStatus::NotApplicable);
        assert_eq!(ao.state.sub_test(SubTestItem::ReportCheck), SubTestStatus::NotApplicable);
        assert_eq!(ao.state.sub_test(SubTestItem::ShowValue), SubTestStatus::NotTested);

        for module_type in ["DI", "DO"] {
            let ch = channel(module_type, true);
            for item in SubTestItem::ALL {
                let expected = if item == SubTestItem::ShowValue {
                    SubTestStatus::NotTested
                } else {
                    SubTestStatus::NotApplicable
                };
                assert_eq!(ch.state.sub_test(item), expected, "{} {:?}", module_type, item);
            }
        }
    }

    #[test]
    fn test_initialize_range_handling() {
        let manager = ChannelStateManager::new();
        let mut rec = record("AI", false);
        rec.range_lower = Some("200".to_string());
        rec.range_upper = Some("50".to_string());
        let ch = manager.initialize_from_import(&rec).unwrap();
        assert_eq!((ch.definition.range_lower, ch.definition.range_upper), (0.0, 100.0));

        rec.range_lower = Some("-10".to_string());
        rec.range_upper = None;
        let ch = manager.initialize_from_import(&rec).unwrap();
        assert_eq!((ch.definition.range_lower, ch.definition.range_upper), (-10.0, 100.0));

        rec.range_upper = Some("abc".to_string());
        assert!(manager.initialize_from_import(&rec).is_err());

        let mut rec = record("AI", false);
        rec.module_type = "PI".to_string();
        assert!(manager.initialize_from_import(&rec).is_err());
    }

    #[test]
    fn test_hard_point_failure_is_terminal() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("DI", false);
        let now = Utc::now();
        manager.begin_hard_point_test(&mut ch, now);
        assert_eq!(ch.state.hard_point, HardPointStatus::Testing);
        assert_eq!(ch.state.start_time, Some(now));

        let later = now + Duration::seconds(4);
        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::failed("ON failed"), later);
        assert_eq!(ch.state.overall, OverallStatus::Failed);
        assert_eq!(ch.state.hard_point.to_string(), "Failed: ON failed");
        assert_eq!(ch.state.final_test_time, Some(later));
    }

    #[test]
    fn test_hard_point_pass_waits_for_manual_tests() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("DO", false);
        let now = Utc::now();
        manager.begin_hard_point_test(&mut ch, now);
        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::passed("通过"), now);
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());

        manager.set_manual_sub_test_outcome(&mut ch, SubTestItem::ShowValue, true, now, None).unwrap();
        assert_eq!(ch.state.overall, OverallStatus::Passed);
        assert_eq!(ch.state.final_test_time, Some(now));
    }

    #[test]
    fn test_manual_failure_and_retry() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("AI", true);
        let now = Utc::now();
        manager.begin_hard_point_test(&mut ch, now);
        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::passed(""), now);

        manager
            .set_manual_sub_test_outcome(&mut ch, SubTestItem::HighAlarm, false, now, Some("报警未触发"))
            .unwrap();
        assert_eq!(ch.state.overall, OverallStatus::Failed);
        assert!(ch.state.result_text.contains("报警未触发"));

        manager.begin_manual_test(&mut ch).unwrap();
        assert_eq!(ch.state.sub_test(SubTestItem::HighAlarm), SubTestStatus::NotTested);
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());

        for item in SubTestItem::ALL {
            if ch.state.sub_test(item) == SubTestStatus::NotTested {
                manager.set_manual_sub_test_outcome(&mut ch, item, true, now, None).unwrap();
            }
        }
        assert_eq!(ch.state.overall, OverallStatus::Passed);
    }

    #[test]
    fn test_manual_outcome_guards() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("DI", false);
        let now = Utc::now();

        assert!(manager.begin_manual_test(&mut ch).is_err());
        assert!(manager
            .set_manual_sub_test_outcome(&mut ch, SubTestItem::TrendCheck, true, now, None)
            .is_err());

        manager.mark_skipped(&mut ch, "用户跳过", now);
        assert!(manager
            .set_manual_sub_test_outcome(&mut ch, SubTestItem::ShowValue, true, now, None)
            .is_err());
    }

    #[test]
    fn test_wiring_confirmation_only_from_not_tested() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("AO", false);
        let now = Utc::now();
        manager.prepare_for_wiring_confirmation(&mut ch, now);
        assert_eq!(ch.state.hard_point, HardPointStatus::Waiting);

        manager.begin_hard_point_test(&mut ch, now);
        manager.prepare_for_wiring_confirmation(&mut ch, now);
        assert_eq!(ch.state.hard_point, HardPointStatus::Testing);
    }

    #[test]
    fn test_allocation_resets_results_and_retest_keeps_it() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("AI", true);
        let now = Utc::now();
        manager.apply_allocation(&mut ch, "1", "AO1_1", "40101");
        manager.begin_hard_point_test(&mut ch, now);
        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::failed("偏差超限"), now);

        manager.reset_for_retest(&mut ch);
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert_eq!(ch.state.hard_point, HardPointStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());
        assert!(ch.state.start_time.is_none());
        assert!(ch.state.result_text.is_empty());
        assert_eq!(ch.state.batch_name.as_deref(), Some("1"));
        assert_eq!(ch.state.complementary_address.as_deref(), Some("40101"));

        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::failed("偏差超限"), now);
        manager.apply_allocation(&mut ch, "2", "AO1_2", "40103");
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert_eq!(ch.state.hard_point, HardPointStatus::NotTested);

        manager.release_complementary(&mut ch);
        assert!(!ch.state.is_allocated());
        assert_eq!(ch.state.batch_name.as_deref(), Some("2"));

        manager.clear_allocation(&mut ch);
        assert!(!ch.state.is_allocated());
        assert!(ch.state.batch_name.is_none());
    }

    #[test]
    fn test_skip_then_retest_restores_sub_tests() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("AI", true);
        let now = Utc::now();
        manager.mark_skipped(&mut ch, "测试已取消", now);
        assert_eq!(ch.state.overall, OverallStatus::Skipped);
        assert_eq!(ch.state.sub_test(SubTestItem::ShowValue), SubTestStatus::NotApplicable);

        manager.reset_for_retest(&mut ch);
        assert_eq!(ch.state.sub_test(SubTestItem::ShowValue), SubTestStatus::NotTested);
        assert_eq!(ch.state.sub_test(SubTestItem::HighAlarm), SubTestStatus::NotTested);
    }

    #[test]
    fn test_retest_after_manual_failure_matches_first_run() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("DI", false);
        let now = Utc::now();
        manager.begin_hard_point_test(&mut ch, now);
        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::passed(""), now);
        manager
            .set_manual_sub_test_outcome(&mut ch, SubTestItem::ShowValue, false, now, Some("显示错误"))
            .unwrap();
        assert_eq!(ch.state.overall, OverallStatus::Failed);

        manager.reset_for_retest(&mut ch);
        assert_eq!(ch.state.sub_test(SubTestItem::ShowValue), SubTestStatus::NotTested);

        let later = now + Duration::seconds(10);
        manager.begin_hard_point_test(&mut ch, later);
        assert_eq!(ch.state.hard_point, HardPointStatus::Testing);
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());

        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::passed(""), later);
        assert_eq!(ch.state.hard_point, HardPointStatus::Passed);
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());
    }

    #[test]
    fn test_begin_hard_point_test_clears_terminal_state() {
        let manager = ChannelStateManager::new();
        let mut ch = channel("AI", true);
        let now = Utc::now();
        manager.begin_hard_point_test(&mut ch, now);
        manager.set_hard_point_outcome(&mut ch, &HardPointTestRawResult::passed(""), now);
        manager
            .set_manual_sub_test_outcome(&mut ch, SubTestItem::HighAlarm, false, now, None)
            .unwrap();
        assert!(ch.state.final_test_time.is_some());

        manager.begin_hard_point_test(&mut ch, now);
        assert_eq!(ch.state.overall, OverallStatus::NotTested);
        assert!(ch.state.final_test_time.is_none());
        assert!(ChannelStateManager::check_invariants(&ch.state).is_empty());
    }

    /// 穷举转换序列，每一步之后检查不变量
    #[test]
    fn test_invariants_hold_for_all_transition_sequences() {
        let manager = ChannelStateManager::new();
        let now = Utc::now();
        const OPS: usize = 13;
        const DEPTH: u32 = 4;

        let apply = |ch: &mut Channel, op: usize| match op {
            0 => manager.apply_allocation(ch, "1", "AO1_1", "40101"),
            1 => manager.clear_allocation(ch),
            2 => manager.mark_skipped(ch, "跳过", now),
            3 => manager.prepare_for_wiring_confirmation(ch, now),
            4 => manager.begin_hard_point_test(ch, now),
            5 => manager.set_hard_point_outcome(ch, &HardPointTestRawResult::passed("ok"), now),
            6 => manager.set_hard_point_outcome(ch, &HardPointTestRawResult::failed("bad"), now),
            7 => {
                let _ = manager.begin_manual_test(ch);
            }
            8 => {
                let _ = manager.set_manual_sub_test_outcome(ch, SubTestItem::ShowValue, true, now, None);
            }
            9 => {
                let _ = manager.set_manual_sub_test_outcome(ch, SubTestItem::ShowValue, false, now, Some("x"));
            }
            10 => manager.reset_for_retest(ch),
            11 => manager.release_complementary(ch),
            _ => {
                for item in SubTestItem::ALL {
                    let _ = manager.set_manual_sub_test_outcome(ch, item, true, now, None);
                }
            }
        };

        for (module_type, with_alarms) in [
            ("AI", true), ("AI", false), ("AO", true), ("AO", false),
            ("DI", true), ("DI", false), ("DO", true), ("DO", false),
        ] {
            let initial = channel(module_type, with_alarms);
            for seq in 0..OPS.pow(DEPTH) {
                let mut ch = initial.clone();
                let mut code = seq;
                for _ in 0..DEPTH {
                    apply(&mut ch, code % OPS);
                    code /= OPS;

                    let violations = ChannelStateManager::check_invariants(&ch.state);
                    assert!(violations.is_empty(), "{} seq={} {:?}", module_type, seq, violations);
                    assert!(ch.state.overall.code() <= 3);
                }
            }
        }
    }

    #[test]
    fn test_roll_up_batch() {
        let manager = ChannelStateManager::new();
        let now = Utc::now();
        let mut channels: Vec<Channel> = (0..3).map(|_| channel("DI", false)).collect();
        for ch in channels.iter_mut() {
            manager.apply_allocation(ch, "1", "DO1_1", "00001");
        }
        assert_eq!(manager.roll_up_batch("1", &channels).status, BatchStatus::NotTested);

        manager.begin_hard_point_test(&mut channels[0], now);
        let info = manager.roll_up_batch("1", &channels);
        assert_eq!(info.status, BatchStatus::InProgress);
        assert_eq!(info.item_count, 3);
        assert_eq!(info.first_test_time, Some(now));

        manager.set_hard_point_outcome(&mut channels[0], &HardPointTestRawResult::failed("OFF failed"), now);
        manager.mark_skipped(&mut channels[1], "跳过", now);
        manager.mark_skipped(&mut channels[2], "跳过", now);
        assert_eq!(manager.roll_up_batch("1", &channels).status, BatchStatus::CompletedWithFailures);

        assert_eq!(manager.roll_up_batch("9", &channels).item_count, 0);
    }
}
