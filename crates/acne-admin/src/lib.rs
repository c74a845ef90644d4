//! # 运维管理模块
//!
//! 提供配置加载、验证与日志初始化

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, ArchiveBackend, ArchiveConfig, ConfigManager, ConfigValidator, DetectorConfig,
    LoggingConfig, QualityConfig, RemoteConfig, StorageConfig,
};
pub use logging::{build_filter, init_logging};
