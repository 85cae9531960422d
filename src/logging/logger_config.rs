//! 日志配置模块
//!
//! 根据 `LoggingConfig` 构建 env_logger，支持控制台或文件输出，`RUST_LOG` 优先于配置文件

use crate::utils::config::LoggingConfig;
use crate::utils::error::{AppError, AppResult};
use chrono::Local;
use env_logger::{Builder, Target, WriteStyle};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::io::Write;

/// 解析日志级别字符串
pub fn parse_level_filter(level: &str) -> AppResult<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::configuration_error(format!("无效的日志级别: {}", level)))
}

/// 构建日志器
///
/// `env_filters` 通常来自 `RUST_LOG`，存在时覆盖配置中的级别
pub fn configure_builder(config: &LoggingConfig, env_filters: Option<&str>) -> AppResult<Builder> {
    let level = parse_level_filter(&config.log_level)?;
    let show_module_path = config.show_module_path;

    let mut builder = Builder::new();
    builder.filter_level(level);
    if let Some(filters) = env_filters {
        builder.parse_filters(filters);
    }

    builder.format(move |buf, record| {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if show_module_path {
            writeln!(
                buf,
                "[{}] [{}] [{}] {}",
                timestamp,
                record.level(),
                record.module_path().unwrap_or("-"),
                record.args()
            )
        } else {
            writeln!(buf, "[{}] [{}] {}", timestamp, record.level(), record.args())
        }
    });

    if let Some(path) = &config.log_file_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(Target::Pipe(Box::new(file)));
        builder.write_style(WriteStyle::Never);
    }

    Ok(builder)
}

/// 初始化全局日志器
pub fn init_logger(config: &LoggingConfig) -> AppResult<()> {
    let env_filters = std::env::var("RUST_LOG").ok();
    let mut builder = configure_builder(config, env_filters.as_deref())?;
    builder
        .try_init()
        .map_err(|e| AppError::configuration_error(format!("日志系统初始化失败: {}", e)))?;

    log::info!("日志系统初始化完成 - 级别: {}", config.log_level);
    Ok(())
}
