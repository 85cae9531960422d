//! # 模型枚举类型模块
//!
//! 定义通道模块类型、各级测试状态、子测试项、字节序等枚举。
//! 所有枚举支持 JSON 序列化，状态类枚举提供 Display 以便生成结果文本。

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use crate::utils::error::AppError;

/// 通道模块类型
///
/// 封闭枚举，测试协议的选择对其进行穷尽匹配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleType {
    /// 模拟量输入
    AI,
    /// 模拟量输出
    AO,
    /// 数字量输入
    DI,
    /// 数字量输出
    DO,
}

impl ModuleType {
    /// 测试台架上与之互补的通道类型（AI↔AO，DI↔DO）
    pub fn complementary(&self) -> ModuleType {
        match self {
            ModuleType::AI => ModuleType::AO,
            ModuleType::AO => ModuleType::AI,
            ModuleType::DI => ModuleType::DO,
            ModuleType::DO => ModuleType::DI,
        }
    }

    /// 是否为模拟量
    pub fn is_analog(&self) -> bool {
        matches!(self, ModuleType::AI | ModuleType::AO)
    }

    pub const ALL: [ModuleType; 4] = [ModuleType::AI, ModuleType::AO, ModuleType::DI, ModuleType::DO];
}

impl Display for ModuleType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleType::AI => "AI",
            ModuleType::AO => "AO",
            ModuleType::DI => "DI",
            ModuleType::DO => "DO",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ModuleType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AI" => Ok(ModuleType::AI),
            "AO" => Ok(ModuleType::AO),
            "DI" => Ok(ModuleType::DI),
            "DO" => Ok(ModuleType::DO),
            other => Err(AppError::validation_error(format!("未知的模块类型: {}", other))),
        }
    }
}

/// 通道整体测试状态
///
/// 数值编码：0 未测试/进行中，1 通过，2 失败，3 跳过
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OverallStatus {
    #[default]
    NotTested,
    Passed,
    Failed,
    Skipped,
}

impl OverallStatus {
    pub fn code(&self) -> u8 {
        match self {
            OverallStatus::NotTested => 0,
            OverallStatus::Passed => 1,
            OverallStatus::Failed => 2,
            OverallStatus::Skipped => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OverallStatus::NotTested),
            1 => Some(OverallStatus::Passed),
            2 => Some(OverallStatus::Failed),
            3 => Some(OverallStatus::Skipped),
            _ => None,
        }
    }

    /// 是否为终态（通过、失败、跳过）
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OverallStatus::NotTested)
    }
}

impl Display for OverallStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverallStatus::NotTested => "未测试",
            OverallStatus::Passed => "通过",
            OverallStatus::Failed => "失败",
            OverallStatus::Skipped => "跳过",
        };
        write!(f, "{}", s)
    }
}

/// 硬点测试阶段状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HardPointStatus {
    #[default]
    NotTested,
    /// 等待接线确认
    Waiting,
    Testing,
    Passed,
    /// 失败，附带失败详情
    Failed(String),
    Skipped,
}

impl HardPointStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, HardPointStatus::Failed(_))
    }
}

impl Display for HardPointStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HardPointStatus::NotTested => write!(f, "NotTested"),
            HardPointStatus::Waiting => write!(f, "Waiting"),
            HardPointStatus::Testing => write!(f, "Testing"),
            HardPointStatus::Passed => write!(f, "Passed"),
            HardPointStatus::Failed(detail) => write!(f, "Failed: {}", detail),
            HardPointStatus::Skipped => write!(f, "Skipped"),
        }
    }
}

/// 子测试状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SubTestStatus {
    #[default]
    NotTested,
    Passed,
    Failed,
    /// 不适用
    NotApplicable,
}

impl Display for SubTestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubTestStatus::NotTested => "NotTested",
            SubTestStatus::Passed => "Passed",
            SubTestStatus::Failed => "Failed",
            SubTestStatus::NotApplicable => "N/A",
        };
        write!(f, "{}", s)
    }
}

/// 手动子测试项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubTestItem {
    /// 显示值核对
    ShowValue,
    /// 低低报
    LowLowAlarm,
    /// 低报
    LowAlarm,
    /// 高报
    HighAlarm,
    /// 高高报
    HighHighAlarm,
    /// 报警值设定
    AlarmValueSet,
    /// 维护功能
    MaintenanceFunction,
    /// 趋势检查
    TrendCheck,
    /// 报表检查
    ReportCheck,
}

impl SubTestItem {
    pub const ALL: [SubTestItem; 9] = [
        SubTestItem::ShowValue,
        SubTestItem::LowLowAlarm,
        SubTestItem::LowAlarm,
        SubTestItem::HighAlarm,
        SubTestItem::HighHighAlarm,
        SubTestItem::AlarmValueSet,
        SubTestItem::MaintenanceFunction,
        SubTestItem::TrendCheck,
        SubTestItem::ReportCheck,
    ];

    /// 四个报警限值子测试
    pub fn is_alarm_limit(&self) -> bool {
        matches!(
            self,
            SubTestItem::LowLowAlarm
                | SubTestItem::LowAlarm
                | SubTestItem::HighAlarm
                | SubTestItem::HighHighAlarm
        )
    }
}

impl Display for SubTestItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubTestItem::ShowValue => "显示值",
            SubTestItem::LowLowAlarm => "低低报",
            SubTestItem::LowAlarm => "低报",
            SubTestItem::HighAlarm => "高报",
            SubTestItem::HighHighAlarm => "高高报",
            SubTestItem::AlarmValueSet => "报警值设定",
            SubTestItem::MaintenanceFunction => "维护功能",
            SubTestItem::TrendCheck => "趋势检查",
            SubTestItem::ReportCheck => "报表检查",
        };
        write!(f, "{}", s)
    }
}

/// 批次汇总状态，由通道状态归并得出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BatchStatus {
    #[default]
    NotTested,
    InProgress,
    /// 全部通道终态且无失败
    Completed,
    /// 全部通道终态且存在失败
    CompletedWithFailures,
    /// 全部通道被跳过
    Skipped,
}

/// 任务管理器运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
}

/// 32位浮点数在两个寄存器中的字节序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    ABCD,
    #[default]
    CDAB,
    BADC,
    DCBA,
}

impl Display for ByteOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ByteOrder::ABCD => "ABCD",
            ByteOrder::CDAB => "CDAB",
            ByteOrder::BADC => "BADC",
            ByteOrder::DCBA => "DCBA",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ByteOrder {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ABCD" => Ok(ByteOrder::ABCD),
            "CDAB" => Ok(ByteOrder::CDAB),
            "BADC" => Ok(ByteOrder::BADC),
            "DCBA" => Ok(ByteOrder::DCBA),
            other => Err(AppError::configuration_error(format!("无效的字节序: {}", other))),
        }
    }
}
