//! 测试编排集成测试
//!
//! 通过协调服务驱动任务管理器，在两个模拟PLC之间验证并发上限、停止、暂停与重测

use fat_test_lib::services::domain::TestTiming;
use fat_test_lib::services::infrastructure::plc::PlcValue;
use fat_test_lib::{
    Channel, HardPointStatus, ITestCoordinationService, ImportedChannelRecord, MockPlcService, ModuleType,
    NoopEventPublisher, OverallStatus, TaskManagerOptions, TestCoordinationService, WireBehavior,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

struct Bench {
    service: Arc<TestCoordinationService>,
    harness: Arc<MockPlcService>,
    dut: Arc<MockPlcService>,
}

fn record(module_type: ModuleType, index: usize) -> ImportedChannelRecord {
    let comm_address = match module_type {
        ModuleType::AI => format!("3{:04}", 101 + index * 2),
        ModuleType::AO => format!("4{:04}", 101 + index * 2),
        ModuleType::DI => format!("1{:04}", 101 + index),
        ModuleType::DO => format!("0{:04}", 101 + index),
    };
    ImportedChannelRecord {
        id: format!("{}_{:03}", module_type, index),
        tag: format!("{}-{:03}", module_type, index),
        module_type: module_type.to_string(),
        comm_address,
        range_lower: Some("0".to_string()),
        range_upper: Some("100".to_string()),
        ..ImportedChannelRecord::default()
    }
}

/// 按分配结果理想接线
fn wire(harness: &MockPlcService, dut: &MockPlcService, channels: &[Channel]) {
    for channel in channels {
        let Some(harness_addr) = channel.state.complementary_address.as_deref() else {
            continue;
        };
        let dut_addr = channel.definition.comm_address.as_str();
        match channel.module_type() {
            ModuleType::AI | ModuleType::DI => harness.wire_to(harness_addr, dut, dut_addr, WireBehavior::ideal()),
            ModuleType::AO | ModuleType::DO => dut.wire_to(dut_addr, harness, harness_addr, WireBehavior::ideal()),
        }
    }
}

/// 导入、分配、接线并确认
async fn bench(records: Vec<ImportedChannelRecord>, max_concurrent_tasks: usize, settle_ms: u64) -> Bench {
    let harness = Arc::new(MockPlcService::new("TestPlc"));
    let dut = Arc::new(MockPlcService::new("TargetPlc"));
    let timing = TestTiming {
        analog_settle: Duration::from_millis(settle_ms),
        digital_settle: Duration::from_millis(settle_ms),
        tolerance_percent: 1.0,
    };
    let service = Arc::new(TestCoordinationService::with_endpoints(
        harness.clone(),
        dut.clone(),
        Arc::new(NoopEventPublisher),
        TaskManagerOptions { max_concurrent_tasks, timing },
        None,
    ));

    let summary = service.import_channels(&records).await.unwrap();
    assert_eq!(summary.imported, records.len());
    service.allocate().await.unwrap();
    wire(&harness, &dut, &service.channels());
    service.prepare_wiring(None).await.unwrap();
    service.confirm_wiring().await.unwrap();

    Bench { service, harness, dut }
}

fn digital_records(count: usize) -> Vec<ImportedChannelRecord> {
    (0..count).map(|i| record(ModuleType::DI, i)).collect()
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let bench = bench(digital_records(12), 3, 20).await;

    assert!(assert_ok!(bench.service.start_all_channels().await));

    let stats = bench.service.stats().await;
    assert!(stats.peak_active_tasks <= 3, "峰值 {} 超过上限", stats.peak_active_tasks);
    assert!(stats.peak_active_tasks >= 1);
    assert_eq!(stats.active_tasks, 0);
    for channel in bench.service.channels() {
        assert_eq!(channel.state.hard_point, HardPointStatus::Passed, "{}", channel.definition.tag);
    }
}

#[tokio::test]
async fn test_second_start_is_refused_while_running() {
    let bench = bench(digital_records(2), 1, 100).await;

    let service = bench.service.clone();
    let run = tokio::spawn(async move { service.start_all_channels().await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!bench.service.start_all_channels().await.unwrap());
    assert!(!bench.service.retest_channel("DI_000").await.unwrap());
    assert!(bench.service.allocate().await.is_err());

    assert!(run.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_stop_skips_channels_and_resets_outputs() {
    let bench = bench(digital_records(6), 2, 300).await;

    let service = bench.service.clone();
    let run = tokio::spawn(async move { service.start_all_channels().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ok!(bench.service.stop().await);
    assert!(run.await.unwrap().unwrap());

    let progress = bench.service.progress();
    assert_eq!(progress.skipped, 6);
    assert_eq!(progress.pending, 0);

    let mut started = 0;
    for channel in bench.service.channels() {
        assert_eq!(channel.state.overall, OverallStatus::Skipped);
        assert_eq!(channel.state.result_text, "测试已取消");
        let harness_addr = channel.state.complementary_address.clone().unwrap();
        let writes = bench.harness.writes_to(&harness_addr);
        if !writes.is_empty() {
            started += 1;
            assert_eq!(writes.last(), Some(&PlcValue::Digital(false)), "{} 未复位", channel.definition.tag);
        }
    }
    assert!(started >= 1 && started <= 2, "已执行通道数 {}", started);
}

#[tokio::test]
async fn test_pause_holds_tasks_until_resume() {
    let bench = bench(digital_records(2), 2, 80).await;

    let service = bench.service.clone();
    let run = tokio::spawn(async move { service.start_all_channels().await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    bench.service.pause().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(bench
        .service
        .channels()
        .iter()
        .all(|c| c.state.hard_point == HardPointStatus::Testing));

    bench.service.resume().await.unwrap();
    assert!(run.await.unwrap().unwrap());
    assert!(bench
        .service
        .channels()
        .iter()
        .all(|c| c.state.hard_point == HardPointStatus::Passed));
}

#[tokio::test]
async fn test_retest_keeps_allocation() {
    let bench = bench(vec![record(ModuleType::AI, 0)], 1, 0).await;
    let before = bench.service.channels()[0].clone();
    let harness_addr = before.state.complementary_address.clone().unwrap();
    bench.harness.set_wire_behavior(&harness_addr, WireBehavior::with_gain(1.05));

    assert!(bench.service.start_all_channels().await.unwrap());
    let failed = bench.service.channels()[0].clone();
    assert!(failed.state.hard_point.is_failed());
    assert_eq!(failed.state.overall, OverallStatus::Failed);
    assert!(failed.state.final_test_time.is_some());

    bench.harness.set_wire_behavior(&harness_addr, WireBehavior::ideal());
    assert!(bench.service.retest_channel("AI_000").await.unwrap());

    let retested = bench.service.channels()[0].clone();
    assert_eq!(retested.state.hard_point, HardPointStatus::Passed);
    assert_eq!(retested.state.batch_name, before.state.batch_name);
    assert_eq!(retested.state.complementary_tag, before.state.complementary_tag);
    assert_eq!(retested.state.complementary_address, before.state.complementary_address);
    assert!(retested.state.percent_readings.iter().all(|r| r.is_some()));
    // 复位到量程下限
    assert_eq!(bench.harness.writes_to(&harness_addr).last(), Some(&PlcValue::Analog(0.0)));
}

#[tokio::test]
async fn test_communication_fault_fails_only_that_channel() {
    let bench = bench(digital_records(3), 3, 0).await;
    bench.dut.inject_fault("10102");

    assert!(bench.service.start_all_channels().await.unwrap());

    for channel in bench.service.channels() {
        if channel.definition.comm_address == "10102" {
            assert!(channel.state.hard_point.is_failed());
            assert!(channel.state.result_text.contains("通讯失败"), "{}", channel.state.result_text);
        } else {
            assert_eq!(channel.state.hard_point, HardPointStatus::Passed);
        }
    }
}

#[tokio::test]
async fn test_connect_failure_aborts_whole_batch() {
    let bench = bench(digital_records(3), 3, 0).await;
    bench.harness.set_connect_failure(true);

    assert!(bench.service.start_all_channels().await.is_err());
    assert_eq!(bench.service.progress().pending, 3);
    assert!(bench.harness.get_write_log().is_empty());
}

#[tokio::test]
async fn test_ten_analog_inputs_split_into_two_batches() {
    let records = (0..10).map(|i| record(ModuleType::AI, i)).collect();
    let bench = bench(records, 4, 0).await;

    let channels = bench.service.channels();
    let batch_of = |i: usize| channels[i].state.batch_name.clone().unwrap();
    assert!((0..8).all(|i| batch_of(i) == "1"));
    assert!((8..10).all(|i| batch_of(i) == "2"));

    let batches = bench.service.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].item_count, 8);
    assert_eq!(batches[1].item_count, 2);

    assert!(bench.service.start_batch("2").await.unwrap());
    let tested: Vec<_> = bench
        .service
        .channels()
        .into_iter()
        .filter(|c| c.state.hard_point == HardPointStatus::Passed)
        .map(|c| c.id().to_string())
        .collect();
    assert_eq!(tested, vec!["AI_008".to_string(), "AI_009".to_string()]);
}

#[tokio::test]
async fn test_all_channels_run_batch_by_batch_on_shared_harness() {
    // 批次1 与批次2 复用同样的测试PLC通道，量程不同
    let records = (0..10)
        .map(|i| match i {
            8 | 9 => ImportedChannelRecord { range_upper: Some("200".to_string()), ..record(ModuleType::AI, i) },
            _ => record(ModuleType::AI, i),
        })
        .collect();
    let bench = bench(records, 16, 30).await;

    let channels = bench.service.channels();
    assert_eq!(channels[0].state.complementary_address, channels[8].state.complementary_address);

    assert!(assert_ok!(bench.service.start_all_channels().await));

    for channel in bench.service.channels() {
        assert_eq!(channel.state.hard_point, HardPointStatus::Passed, "{}: {}",
                   channel.definition.tag, channel.state.result_text);
    }
    let stats = bench.service.stats().await;
    assert!(stats.peak_active_tasks <= 8, "峰值 {} 跨越了批次", stats.peak_active_tasks);
    assert_eq!(stats.completed_runs, 1);
}
