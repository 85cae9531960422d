/// 核心数据结构
///
/// 通道被拆分为不可变的点位定义 `ChannelPointDefinition` 与可变的测试状态 `ChannelTestState`，
/// 测试状态只允许通过通道状态管理器的转换函数修改

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use super::enums::{BatchStatus, HardPointStatus, ModuleType, OverallStatus, SubTestItem, SubTestStatus};

/// 模拟量测试的五个百分比点
pub const PERCENT_POINTS: [f32; 5] = [0.0, 25.0, 50.0, 75.0, 100.0];

/// 报警设定值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AlarmSetpoint {
    /// 原始字符串（导入时的值）
    pub raw: Option<String>,
    /// 解析后的数值
    pub value: Option<f32>,
    /// PLC地址
    pub plc_address: Option<String>,
    /// 通讯地址
    pub comm_address: Option<String>,
}

impl AlarmSetpoint {
    /// 原始值非空即视为配置了该报警
    pub fn is_configured(&self) -> bool {
        self.raw.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
    }
}

/// 导入的报警原始字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportedAlarm {
    pub raw: Option<String>,
    pub plc_address: Option<String>,
    pub comm_address: Option<String>,
}

/// 外部导入得到的通道原始记录（全部为字符串）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportedChannelRecord {
    pub id: String,
    pub variable_name: String,
    pub tag: String,
    pub module_type: String,
    /// 被测PLC通讯地址
    pub comm_address: String,
    pub range_lower: Option<String>,
    pub range_upper: Option<String>,
    pub sll: ImportedAlarm,
    pub sl: ImportedAlarm,
    pub sh: ImportedAlarm,
    pub shh: ImportedAlarm,
    pub maintenance_switch_address: Option<String>,
}

/// 通道点位定义（导入后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPointDefinition {
    pub id: String,
    pub variable_name: String,
    pub tag: String,
    pub module_type: ModuleType,
    /// 被测PLC通讯地址
    pub comm_address: String,
    pub range_lower: f32,
    pub range_upper: f32,
    pub sll: AlarmSetpoint,
    pub sl: AlarmSetpoint,
    pub sh: AlarmSetpoint,
    pub shh: AlarmSetpoint,
    pub maintenance_switch_address: Option<String>,
}

impl ChannelPointDefinition {
    pub fn range_span(&self) -> f32 {
        self.range_upper - self.range_lower
    }

    /// 百分比点对应的工程值：lower + range * pct / 100
    pub fn value_at_percent(&self, pct: f32) -> f32 {
        self.range_lower + self.range_span() * pct / 100.0
    }

    /// 报警子测试对应的设定值
    pub fn alarm(&self, item: SubTestItem) -> Option<&AlarmSetpoint> {
        match item {
            SubTestItem::LowLowAlarm => Some(&self.sll),
            SubTestItem::LowAlarm => Some(&self.sl),
            SubTestItem::HighAlarm => Some(&self.sh),
            SubTestItem::HighHighAlarm => Some(&self.shh),
            _ => None,
        }
    }
}

/// 通道测试状态（可变部分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelTestState {
    /// 批次名称
    pub batch_name: Option<String>,
    /// 测试台架互补通道位号
    pub complementary_tag: Option<String>,
    /// 测试台架互补通道通讯地址
    pub complementary_address: Option<String>,
    pub overall: OverallStatus,
    pub hard_point: HardPointStatus,
    pub sub_tests: BTreeMap<SubTestItem, SubTestStatus>,
    /// 人可读的结果描述
    pub result_text: String,
    pub start_time: Option<DateTime<Utc>>,
    pub test_time: Option<DateTime<Utc>>,
    pub final_test_time: Option<DateTime<Utc>>,
    /// 0/25/50/75/100% 五个百分比点的读数
    pub percent_readings: [Option<f32>; 5],
}

impl ChannelTestState {
    pub fn is_allocated(&self) -> bool {
        self.complementary_tag.is_some() && self.complementary_address.is_some()
    }

    pub fn sub_test(&self, item: SubTestItem) -> SubTestStatus {
        self.sub_tests.get(&item).copied().unwrap_or_default()
    }
}

/// 通道快照：定义 + 状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub definition: Arc<ChannelPointDefinition>,
    pub state: ChannelTestState,
}

impl Channel {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn module_type(&self) -> ModuleType {
        self.definition.module_type
    }
}

/// 测试批次信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBatchInfo {
    pub batch_name: String,
    pub item_count: usize,
    pub status: BatchStatus,
    pub first_test_time: Option<DateTime<Utc>>,
    pub last_test_time: Option<DateTime<Utc>>,
}

impl TestBatchInfo {
    pub fn new(batch_name: impl Into<String>, item_count: usize) -> Self {
        Self {
            batch_name: batch_name.into(),
            item_count,
            status: BatchStatus::NotTested,
            first_test_time: None,
            last_test_time: None,
        }
    }
}

/// 硬点测试原始结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardPointTestRawResult {
    pub success: bool,
    pub detail: String,
}

impl HardPointTestRawResult {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self { success: true, detail: detail.into() }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self { success: false, detail: detail.into() }
    }
}

/// 测试任务完成后的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTaskReport {
    pub raw_result: HardPointTestRawResult,
    /// 模拟量通道的五点读数，数字量通道为空
    pub percent_readings: Option<[Option<f32>; 5]>,
}

impl TestTaskReport {
    pub fn digital(raw_result: HardPointTestRawResult) -> Self {
        Self { raw_result, percent_readings: None }
    }
}

/// 测试进度快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestProgress {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
}
