use std::collections::{BTreeMap, BTreeSet, HashMap};
use serde::{Deserialize, Serialize};
use crate::models::{Channel, ChannelPointDefinition, ModuleType, TestBatchInfo};
use crate::services::domain::IChannelStateManager;
use crate::utils::error::{AppError, AppResult};

/// 默认测试台架：每种类型的模块数量
const DEFAULT_MODULE_COUNT: u32 = 2;

/// 测试PLC通道映射表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonTable {
    /// 通道地址标识 (如 "AO1_1")
    pub channel_address: String,
    /// 通信地址 (如 "40001")
    pub communication_address: String,
    /// 通道类型
    pub channel_type: ModuleType,
    /// 是否有源 (true=有源, false=无源)
    pub is_powered: bool,
}

/// 测试PLC配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlcConfig {
    /// PLC品牌类型
    pub brand_type: String,
    /// IP地址
    pub ip_address: String,
    /// 通道映射表
    pub comparison_tables: Vec<ComparisonTable>,
}

impl TestPlcConfig {
    /// 默认测试台架：每种类型2个模块，AI/AO每模块4通道，DI/DO每模块8通道
    pub fn default_layout() -> Self {
        let mut comparison_tables = Vec::new();
        for module_type in ModuleType::ALL {
            let channels_per_module = default_channels_per_module(module_type);
            let mut index = 0u32;
            for module in 1..=DEFAULT_MODULE_COUNT {
                for channel in 1..=channels_per_module {
                    let communication_address = match module_type {
                        ModuleType::AI => format!("3{:04}", 1 + index * 2),
                        ModuleType::AO => format!("4{:04}", 1 + index * 2),
                        ModuleType::DI => format!("1{:04}", 1 + index),
                        ModuleType::DO => format!("0{:04}", 1 + index),
                    };
                    comparison_tables.push(ComparisonTable {
                        channel_address: format!("{}{}_{}", module_type, module, channel),
                        communication_address,
                        channel_type: module_type,
                        is_powered: true,
                    });
                    index += 1;
                }
            }
        }

        Self {
            brand_type: "Modbus".to_string(),
            ip_address: "127.0.0.1".to_string(),
            comparison_tables,
        }
    }
}

fn default_channels_per_module(module_type: ModuleType) -> u32 {
    if module_type.is_analog() { 4 } else { 8 }
}

/// 单个通道的分配结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAssignment {
    pub channel_id: String,
    pub batch_name: String,
    /// 测试台架互补通道位号
    pub complementary_tag: String,
    /// 测试台架互补通道通讯地址
    pub complementary_address: String,
}

/// 批次分配结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAllocationResult {
    /// 批次信息列表
    pub batches: Vec<TestBatchInfo>,
    /// 已分配的通道
    pub assignments: Vec<ChannelAssignment>,
    /// 未能分配的通道ID
    pub unassigned: Vec<String>,
    /// 分配统计
    pub allocation_summary: AllocationSummary,
}

/// 分配统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationSummary {
    /// 总定义数
    pub total_definitions: u32,
    /// 已分配通道数
    pub allocated_count: u32,
    /// 跳过的定义数
    pub skipped_definitions: u32,
    /// 批次数量
    pub batch_count: u32,
    /// 按模块类型分组的统计
    pub by_module_type: HashMap<ModuleType, ModuleTypeStats>,
    /// 分配错误列表
    pub allocation_errors: Vec<String>,
}

/// 模块类型统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleTypeStats {
    /// 定义数量
    pub definition_count: u32,
    /// 分配的通道数量
    pub allocated_count: u32,
    /// 批次数量
    pub batch_count: u32,
    /// 可用的测试台架互补通道数
    pub complementary_channel_count: u32,
}

/// 测试台架模块布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLayout {
    pub module_count: u32,
    pub channels_per_module: u32,
}

/// 解析 `<TYPE><module>_<channel>` 形式的通道地址，返回 (模块号, 通道号)
pub fn parse_channel_address(address: &str) -> Option<(u32, u32)> {
    let digits_start = address.find(|c: char| c.is_ascii_digit())?;
    let (module_str, channel_str) = address[digits_start..].split_once('_')?;
    Some((module_str.parse().ok()?, channel_str.parse().ok()?))
}

/// 由通道地址推算模块数与每模块通道数（平均值向上取整）
pub fn derive_module_layout<'a>(addresses: impl IntoIterator<Item = &'a str>) -> ModuleLayout {
    let mut per_module: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for address in addresses {
        if let Some((module, channel)) = parse_channel_address(address) {
            per_module.entry(module).or_default().insert(channel);
        }
    }

    let module_count = per_module.len() as u32;
    if module_count == 0 {
        return ModuleLayout { module_count: 0, channels_per_module: 0 };
    }
    let total_channels: u32 = per_module.values().map(|c| c.len() as u32).sum();
    ModuleLayout {
        module_count,
        channels_per_module: (total_channels + module_count - 1) / module_count,
    }
}

/// 通道分配服务接口
pub trait IChannelAllocationService: Send + Sync {
    /// 为通道定义计算批次与测试台架互补通道（纯函数，不修改通道）
    fn allocate_channels(
        &self,
        definitions: &[&ChannelPointDefinition],
        test_plc_config: Option<&TestPlcConfig>,
    ) -> BatchAllocationResult;

    /// 计算分配并通过状态管理器写入通道
    fn allocate_and_apply(
        &self,
        channels: &mut [Channel],
        state_manager: &dyn IChannelStateManager,
        test_plc_config: Option<&TestPlcConfig>,
    ) -> BatchAllocationResult;

    /// 手动将通道改接到指定互补通道，返回被让出地址的通道ID
    fn reassign_complementary(
        &self,
        channels: &mut [Channel],
        state_manager: &dyn IChannelStateManager,
        channel_id: &str,
        complementary_tag: &str,
        complementary_address: &str,
    ) -> AppResult<Option<String>>;
}

/// 通道分配服务实现
///
/// 只负责计算分配，通道状态的修改由 ChannelStateManager 完成
#[derive(Debug, Default, Clone)]
pub struct ChannelAllocationService;

impl ChannelAllocationService {
    pub fn new() -> Self {
        Self
    }

    /// 获取指定类型的测试台架通道，按 (模块号, 通道号) 排序
    fn complementary_pool(config: &TestPlcConfig, channel_type: ModuleType) -> Vec<ComparisonTable> {
        let mut pool: Vec<ComparisonTable> = config
            .comparison_tables
            .iter()
            .filter(|table| table.channel_type == channel_type)
            .cloned()
            .collect();
        pool.sort_by(|a, b| {
            let key_a = parse_channel_address(&a.channel_address).unwrap_or((u32::MAX, u32::MAX));
            let key_b = parse_channel_address(&b.channel_address).unwrap_or((u32::MAX, u32::MAX));
            key_a.cmp(&key_b).then_with(|| a.channel_address.cmp(&b.channel_address))
        });

        log::debug!("[ChannelAllocation] 测试台架 {} 通道: {} 个", channel_type, pool.len());
        pool
    }

    /// 测试台架某类型的模块布局
    pub fn module_layout(&self, config: &TestPlcConfig, channel_type: ModuleType) -> ModuleLayout {
        derive_module_layout(
            config
                .comparison_tables
                .iter()
                .filter(|t| t.channel_type == channel_type)
                .map(|t| t.channel_address.as_str()),
        )
    }

    /// 批次名称即批次号（从1开始）
    fn batch_name(batch_number: usize) -> String {
        batch_number.to_string()
    }
}

impl IChannelAllocationService for ChannelAllocationService {
    fn allocate_channels(
        &self,
        definitions: &[&ChannelPointDefinition],
        test_plc_config: Option<&TestPlcConfig>,
    ) -> BatchAllocationResult {
        let default_config;
        let config = match test_plc_config {
            Some(config) if !config.comparison_tables.is_empty() => config,
            _ => {
                log::info!("[ChannelAllocation] 未提供测试PLC映射表，使用默认布局");
                default_config = TestPlcConfig::default_layout();
                &default_config
            }
        };

        log::info!("[ChannelAllocation] 开始分配通道: {} 个定义", definitions.len());

        let mut summary = AllocationSummary {
            total_definitions: definitions.len() as u32,
            ..AllocationSummary::default()
        };
        let mut assignments = Vec::new();
        let mut unassigned = Vec::new();
        let mut batch_counts: BTreeMap<usize, usize> = BTreeMap::new();

        for module_type in ModuleType::ALL {
            let channels: Vec<&ChannelPointDefinition> = definitions
                .iter()
                .copied()
                .filter(|d| d.module_type == module_type)
                .collect();
            if channels.is_empty() {
                continue;
            }

            let complementary_type = module_type.complementary();
            let pool = Self::complementary_pool(config, complementary_type);
            let m = pool.len();
            let stats = summary.by_module_type.entry(module_type).or_default();
            stats.definition_count = channels.len() as u32;
            stats.complementary_channel_count = m as u32;

            if m == 0 {
                let message = format!(
                    "测试台架没有 {} 类型通道，{} 个 {} 通道未分配",
                    complementary_type, channels.len(), module_type
                );
                log::warn!("[ChannelAllocation] {}", message);
                summary.allocation_errors.push(message);
                unassigned.extend(channels.iter().map(|d| d.id.clone()));
                continue;
            }

            for (i, definition) in channels.iter().enumerate() {
                let batch_number = i / m + 1;
                let target = &pool[i % m];
                *batch_counts.entry(batch_number).or_insert(0) += 1;

                log::debug!("[ChannelAllocation] 分配通道[{}]: {} ({}) → 批次{} (索引{}), 测试通道: {}",
                    i + 1, definition.tag, module_type, Self::batch_name(batch_number), i % m, target.channel_address);

                assignments.push(ChannelAssignment {
                    channel_id: definition.id.clone(),
                    batch_name: Self::batch_name(batch_number),
                    complementary_tag: target.channel_address.clone(),
                    complementary_address: target.communication_address.clone(),
                });
            }
            stats.allocated_count = channels.len() as u32;
            stats.batch_count = ((channels.len() + m - 1) / m) as u32;
        }

        let batches: Vec<TestBatchInfo> = batch_counts
            .iter()
            .map(|(number, count)| TestBatchInfo::new(Self::batch_name(*number), *count))
            .collect();

        summary.allocated_count = assignments.len() as u32;
        summary.skipped_definitions = unassigned.len() as u32;
        summary.batch_count = batches.len() as u32;

        for batch in &batches {
            log::info!("[ChannelAllocation] 批次{}: {} 个通道", batch.batch_name, batch.item_count);
        }
        log::info!("[ChannelAllocation] 分配完成: 已分配 {}, 未分配 {}, 批次 {}",
            summary.allocated_count, summary.skipped_definitions, summary.batch_count);

        BatchAllocationResult {
            batches,
            assignments,
            unassigned,
            allocation_summary: summary,
        }
    }

    fn allocate_and_apply(
        &self,
        channels: &mut [Channel],
        state_manager: &dyn IChannelStateManager,
        test_plc_config: Option<&TestPlcConfig>,
    ) -> BatchAllocationResult {
        let definitions: Vec<_> = channels.iter().map(|c| c.definition.clone()).collect();
        let definition_refs: Vec<&ChannelPointDefinition> = definitions.iter().map(|d| d.as_ref()).collect();
        let result = self.allocate_channels(&definition_refs, test_plc_config);

        let by_id: HashMap<&str, &ChannelAssignment> = result
            .assignments
            .iter()
            .map(|a| (a.channel_id.as_str(), a))
            .collect();
        for channel in channels.iter_mut() {
            match by_id.get(channel.id()) {
                Some(assignment) => state_manager.apply_allocation(
                    channel,
                    &assignment.batch_name,
                    &assignment.complementary_tag,
                    &assignment.complementary_address,
                ),
                None => state_manager.clear_allocation(channel),
            }
        }
        result
    }

    fn reassign_complementary(
        &self,
        channels: &mut [Channel],
        state_manager: &dyn IChannelStateManager,
        channel_id: &str,
        complementary_tag: &str,
        complementary_address: &str,
    ) -> AppResult<Option<String>> {
        let target_index = channels
            .iter()
            .position(|c| c.id() == channel_id)
            .ok_or_else(|| AppError::not_found_error("Channel", format!("通道 {} 不存在", channel_id)))?;

        let displaced = channels.iter().position(|c| {
            c.id() != channel_id && c.state.complementary_address.as_deref() == Some(complementary_address)
        });
        let displaced_id = match displaced {
            Some(index) => {
                let holder = &mut channels[index];
                log::info!("[ChannelAllocation] 地址 {} 已被 {} 占用，释放其互补通道", complementary_address, holder.definition.tag);
                state_manager.release_complementary(holder);
                Some(holder.id().to_string())
            }
            None => None,
        };

        let target = &mut channels[target_index];
        let batch_name = target
            .state
            .batch_name
            .clone()
            .unwrap_or_else(|| Self::batch_name(1));
        state_manager.apply_allocation(target, &batch_name, complementary_tag, complementary_address);
        log::info!("[ChannelAllocation] 通道 {} 改接到 {} ({})", target.definition.tag, complementary_tag, complementary_address);

        Ok(displaced_id)
    }
}
