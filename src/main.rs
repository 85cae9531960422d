/// 应用程序主入口函数
///
/// 在两个模拟PLC之间演示一次完整的硬点测试：导入、分配、接线确认、执行并输出进度。
/// 传入 `--modbus` 时改为连接配置文件中的两个 Modbus TCP PLC。
use anyhow::Context;
use fat_test_lib::logging::init_logger;
use fat_test_lib::services::domain::TestTiming;
use fat_test_lib::services::infrastructure::plc::modbus_plc_service::ModbusConfig;
use fat_test_lib::utils::config::ConfigManager;
use fat_test_lib::{
    BroadcastEventPublisher, Channel, IEventPublisher, IPlcEndpoint, ITestCoordinationService,
    ImportedChannelRecord, MockPlcService, ModbusPlcService, ModuleType, TaskManagerOptions,
    TestCoordinationService, TestEvent, WireBehavior,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const DEFAULT_CONFIG_FILE: &str = "fat_test_config.json";

/// 示例通道清单
fn sample_records() -> Vec<ImportedChannelRecord> {
    let mut records = Vec::new();
    let counts = [(ModuleType::AI, 3), (ModuleType::AO, 2), (ModuleType::DI, 4), (ModuleType::DO, 3)];
    for (module_type, count) in counts {
        for i in 0..count {
            let comm_address = match module_type {
                ModuleType::AI => format!("3{:04}", 101 + i * 2),
                ModuleType::AO => format!("4{:04}", 101 + i * 2),
                ModuleType::DI => format!("1{:04}", 101 + i),
                ModuleType::DO => format!("0{:04}", 101 + i),
            };
            records.push(ImportedChannelRecord {
                id: format!("{}_{:03}", module_type, i + 1),
                variable_name: format!("{}_{}", module_type, i + 1),
                tag: format!("{}-{:03}", module_type, 101 + i),
                module_type: module_type.to_string(),
                comm_address,
                range_lower: module_type.is_analog().then(|| "0".to_string()),
                range_upper: module_type.is_analog().then(|| "100".to_string()),
                ..ImportedChannelRecord::default()
            });
        }
    }
    records
}

/// 按分配结果在两个模拟PLC之间接线，并制造两处故障
fn wire_simulated(harness: &MockPlcService, dut: &MockPlcService, channels: &[Channel]) {
    for channel in channels {
        let Some(harness_addr) = channel.state.complementary_address.as_deref() else {
            continue;
        };
        let dut_addr = channel.definition.comm_address.as_str();
        let behavior = match channel.id() {
            "AI_002" => WireBehavior::with_gain(1.05),
            "DO_003" => WireBehavior::stuck_at(false),
            _ => WireBehavior::ideal(),
        };
        match channel.module_type() {
            ModuleType::AI | ModuleType::DI => harness.wire_to(harness_addr, dut, dut_addr, behavior),
            ModuleType::AO | ModuleType::DO => dut.wire_to(dut_addr, harness, harness_addr, behavior),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let use_modbus = std::env::args().any(|arg| arg == "--modbus");
    let config_path = std::env::args()
        .skip(1)
        .find(|arg| !arg.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config_manager = ConfigManager::new(config_path.clone());
    config_manager
        .load_from_file()
        .await
        .with_context(|| format!("加载配置文件失败: {}", config_path.display()))?;
    config_manager.override_from_env();
    config_manager.validate_config().context("配置校验失败")?;
    let config = config_manager.get_config().clone();

    init_logger(&config.logging_config).context("初始化日志失败")?;

    println!("=== FAT 硬点测试编排启动 ===");

    let publisher = Arc::new(BroadcastEventPublisher::new());
    let mut events = publisher.subscribe();
    let mut options = TaskManagerOptions::from_config(&config);

    let simulated = if use_modbus {
        None
    } else {
        let harness = Arc::new(MockPlcService::new("模拟测试PLC"));
        let dut = Arc::new(MockPlcService::new("模拟被测PLC"));
        harness.set_network_delay(5);
        dut.set_network_delay(5);
        options.timing = TestTiming {
            analog_settle: Duration::from_millis(50),
            digital_settle: Duration::from_millis(20),
            ..options.timing
        };
        Some((harness, dut))
    };

    let (test_plc, target_plc): (Arc<dyn IPlcEndpoint>, Arc<dyn IPlcEndpoint>) = match &simulated {
        Some((harness, dut)) => (harness.clone(), dut.clone()),
        None => (
            Arc::new(ModbusPlcService::new(ModbusConfig::from_plc_config("测试PLC", &config.test_plc_config)?)),
            Arc::new(ModbusPlcService::new(ModbusConfig::from_plc_config("被测PLC", &config.target_plc_config)?)),
        ),
    };

    let service = TestCoordinationService::with_endpoints(
        test_plc,
        target_plc,
        publisher.clone() as Arc<dyn IEventPublisher>,
        options,
        None,
    );

    let summary = service.import_channels(&sample_records()).await?;
    println!("导入通道: {} 个, 拒绝 {} 个", summary.imported, summary.rejected.len());

    let allocation = service.allocate().await?;
    println!("分配批次: {:?}", allocation.batches);
    if let Some((harness, dut)) = &simulated {
        wire_simulated(harness, dut, &service.channels());
    }

    let prepared = service.prepare_wiring(None).await?;
    println!("待接线确认通道: {} 个", prepared.len());
    service.confirm_wiring().await?;

    let started = service.start_all_channels().await?;
    if !started {
        anyhow::bail!("测试未能启动");
    }

    let mut batch_updates = 0usize;
    loop {
        match events.try_recv() {
            Ok(TestEvent::BatchStatusChanged(_)) => batch_updates += 1,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    for channel in service.channels() {
        println!("  {:<8} {:<4} {:<10} {}",
                 channel.definition.tag,
                 channel.module_type(),
                 channel.state.hard_point,
                 channel.state.result_text);
    }
    for batch in service.batches() {
        println!("批次 {}: {} 个通道, 状态 {:?}", batch.batch_name, batch.item_count, batch.status);
    }

    let progress = service.progress();
    let stats = service.stats().await;
    println!("进度: 共 {} 个, 通过 {}, 失败 {}, 跳过 {}, 待测 {}",
             progress.total, progress.passed, progress.failed, progress.skipped, progress.pending);
    println!("并发上限 {}, 峰值 {}, 批次状态更新 {} 次",
             stats.max_concurrent_tasks, stats.peak_active_tasks, batch_updates);

    service.shutdown().await;
    println!("=== FAT 硬点测试编排结束 ===");
    Ok(())
}
