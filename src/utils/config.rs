use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use crate::models::ByteOrder;
use crate::utils::error::{AppError, AppResult};

/// 提供给 serde 的默认字节顺序（CDAB）
fn default_byte_order() -> String {
    "CDAB".to_string()
}

/// 应用程序主配置结构
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 应用程序基本设置
    pub app_settings: AppSettings,
    /// 测试PLC（测试台架）连接配置
    pub test_plc_config: PlcConfig,
    /// 被测PLC连接配置
    pub target_plc_config: PlcConfig,
    /// 测试配置
    pub test_config: TestConfig,
    /// 日志配置
    pub logging_config: LoggingConfig,
}

/// 应用程序基本设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// 应用程序名称
    pub app_name: String,
    /// 运行环境 (development, testing, production)
    pub environment: String,
    /// 最大并发任务数，0 表示按 CPU 逻辑核数的 2 倍自动计算
    pub max_concurrent_tasks: usize,
}

impl AppSettings {
    /// 实际生效的并发上限
    pub fn effective_max_concurrent_tasks(&self) -> usize {
        if self.max_concurrent_tasks > 0 {
            return self.max_concurrent_tasks;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus * 2
    }
}

/// PLC连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    /// PLC类型 (modbus, mock)
    pub plc_type: String,
    /// PLC IP地址
    pub host: String,
    /// PLC端口
    pub port: u16,
    /// Modbus 从站号
    pub slave_id: u8,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 读写超时时间（毫秒）
    pub io_timeout_ms: u64,
    /// 字节顺序配置 (ABCD / CDAB / BADC / DCBA)
    #[serde(default = "default_byte_order")]
    pub byte_order: String,
    /// Modbus 地址是否使用 0 基
    #[serde(default)]
    pub zero_based_address: bool,
}

/// 测试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// 模拟量稳定等待时间（毫秒）
    pub analog_stabilization_time_ms: u64,
    /// 数字量稳定等待时间（毫秒）
    pub digital_stabilization_time_ms: u64,
    /// 模拟量测试精度容差（百分比）
    pub analog_tolerance_percent: f32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 日志文件路径，为空时只输出到控制台
    pub log_file_path: Option<PathBuf>,
    /// 是否输出模块路径
    pub show_module_path: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_name: "FAT_TEST".to_string(),
            environment: "development".to_string(),
            max_concurrent_tasks: 0,
        }
    }
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            plc_type: "modbus".to_string(),
            host: "127.0.0.1".to_string(),
            port: 502,
            slave_id: 1,
            connection_timeout_ms: 5000,
            io_timeout_ms: 3000,
            byte_order: default_byte_order(),
            zero_based_address: false,
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            analog_stabilization_time_ms: 3000,
            digital_stabilization_time_ms: 2000,
            analog_tolerance_percent: 1.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file_path: None,
            show_module_path: false,
        }
    }
}

/// 配置管理器
/// 负责加载、保存和管理应用程序配置
pub struct ConfigManager {
    config: AppConfig,
    config_file_path: PathBuf,
}

impl ConfigManager {
    /// 创建新的配置管理器
    pub fn new(config_file_path: PathBuf) -> Self {
        Self {
            config: AppConfig::default(),
            config_file_path,
        }
    }

    /// 从文件加载配置
    pub async fn load_from_file(&mut self) -> AppResult<()> {
        if !self.config_file_path.exists() {
            // 配置文件不存在时写出默认配置
            self.save_to_file().await?;
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config_file_path)
            .await
            .map_err(|e| AppError::io_error(format!("读取配置文件失败: {}", e), e.kind().to_string()))?;

        self.config = serde_json::from_str(&content)
            .map_err(|e| AppError::configuration_error(format!("解析配置文件失败: {}", e)))?;

        Ok(())
    }

    /// 将配置保存到文件
    pub async fn save_to_file(&self) -> AppResult<()> {
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .map_err(|e| AppError::io_error(format!("创建配置目录失败: {}", e), e.kind().to_string()))?;
        }

        let content = serde_json::to_string_pretty(&self.config)
            .map_err(|e| AppError::json_error(format!("序列化配置失败: {}", e)))?;

        tokio::fs::write(&self.config_file_path, content)
            .await
            .map_err(|e| AppError::io_error(format!("写入配置文件失败: {}", e), e.kind().to_string()))?;

        Ok(())
    }

    /// 从环境变量覆盖配置
    pub fn override_from_env(&mut self) {
        if let Ok(host) = std::env::var("TEST_PLC_HOST") {
            self.config.test_plc_config.host = host;
        }
        if let Ok(port) = std::env::var("TEST_PLC_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.config.test_plc_config.port = port;
            }
        }
        if let Ok(host) = std::env::var("TARGET_PLC_HOST") {
            self.config.target_plc_config.host = host;
        }
        if let Ok(port) = std::env::var("TARGET_PLC_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.config.target_plc_config.port = port;
            }
        }
        if let Ok(plc_type) = std::env::var("PLC_TYPE") {
            self.config.test_plc_config.plc_type = plc_type.clone();
            self.config.target_plc_config.plc_type = plc_type;
        }

        if let Ok(env) = std::env::var("APP_ENVIRONMENT") {
            self.config.app_settings.environment = env;
        }
        if let Ok(max_tasks) = std::env::var("MAX_CONCURRENT_TASKS") {
            if let Ok(max_tasks) = max_tasks.parse::<usize>() {
                self.config.app_settings.max_concurrent_tasks = max_tasks;
            }
        }
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            self.config.logging_config.log_level = log_level;
        }
    }

    /// 获取配置的只读引用
    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    /// 获取配置的可变引用
    pub fn get_config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    /// 验证配置的有效性
    pub fn validate_config(&self) -> AppResult<()> {
        for (name, plc) in [
            ("测试PLC", &self.config.test_plc_config),
            ("被测PLC", &self.config.target_plc_config),
        ] {
            if plc.host.is_empty() {
                return Err(AppError::configuration_error(format!("{}主机地址不能为空", name)));
            }
            if plc.port == 0 {
                return Err(AppError::configuration_error(format!("{}端口号不能为0", name)));
            }
            let valid_plc_types = ["modbus", "mock"];
            if !valid_plc_types.contains(&plc.plc_type.as_str()) {
                return Err(AppError::configuration_error(format!(
                    "{}类型无效: {}，有效值: {:?}",
                    name, plc.plc_type, valid_plc_types
                )));
            }
            plc.byte_order.parse::<ByteOrder>()?;
        }

        let valid_environments = ["development", "testing", "production"];
        if !valid_environments.contains(&self.config.app_settings.environment.as_str()) {
            return Err(AppError::configuration_error(format!(
                "无效的环境配置: {}，有效值: {:?}",
                self.config.app_settings.environment, valid_environments
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging_config.log_level.as_str()) {
            return Err(AppError::configuration_error(format!(
                "无效的日志级别: {}，有效值: {:?}",
                self.config.logging_config.log_level, valid_log_levels
            )));
        }

        if self.config.test_config.analog_tolerance_percent <= 0.0 {
            return Err(AppError::configuration_error("模拟量容差必须大于0"));
        }

        Ok(())
    }

    /// 重置为默认配置
    pub fn reset_to_default(&mut self) {
        self.config = AppConfig::default();
    }
}

static GLOBAL_CONFIG: OnceLock<Mutex<ConfigManager>> = OnceLock::new();

/// 初始化全局配置管理器
pub async fn init_global_config(config_path: Option<PathBuf>) -> AppResult<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("config/app_config.json"));
    let mut config_manager = ConfigManager::new(config_path);

    config_manager.load_from_file().await?;
    config_manager.override_from_env();
    config_manager.validate_config()?;

    GLOBAL_CONFIG
        .set(Mutex::new(config_manager))
        .map_err(|_| AppError::configuration_error("全局配置已经初始化"))?;

    Ok(())
}

/// 获取全局配置的只读访问
pub fn get_global_config() -> AppResult<AppConfig> {
    let config_manager = GLOBAL_CONFIG
        .get()
        .ok_or_else(|| AppError::configuration_error("全局配置未初始化"))?
        .lock()
        .map_err(|_| AppError::concurrency_error("获取全局配置锁失败"))?;

    Ok(config_manager.get_config().clone())
}
