//! 配置管理
//!
//! 配置来源按优先级从低到高：内置默认值、TOML 配置文件、`ACNE__` 前缀的环境变量，
//! 例如 `ACNE__DETECTOR__ENDPOINT=http://localhost:8000`。

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// 系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 本地存储配置
    pub storage: StorageConfig,
    /// 图像质量配置
    pub quality: QualityConfig,
    /// 病灶检测服务配置
    pub detector: DetectorConfig,
    /// 远端记录库配置
    pub remote: RemoteConfig,
    /// 归档配置
    pub archive: ArchiveConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 本地存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 患者图像根目录
    pub data_dir: PathBuf,
    /// 状态目录，保存患者严重程度历史和编号注册表
    pub state_dir: PathBuf,
}

/// 图像质量配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// 拉普拉斯方差低于该值视为模糊
    pub blur_threshold: f64,
}

/// 病灶检测服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// 检测服务地址
    pub endpoint: String,
    /// 置信度阈值
    pub confidence_threshold: f32,
    /// 单个区域检测超时时间（秒）
    pub timeout_secs: u64,
}

/// 远端记录库配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// 数据库地址，未配置时使用内存记录库
    pub database_url: Option<String>,
    /// 认证令牌
    pub auth_token: Option<String>,
}

/// 归档后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveBackend {
    Local,
    S3,
    Memory,
}

/// 归档配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub backend: ArchiveBackend,
    /// 本地归档根目录
    pub root: PathBuf,
    /// S3 桶名
    pub bucket: Option<String>,
    /// S3 区域
    pub region: Option<String>,
    /// 远端路径前缀
    pub prefix: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或过滤指令，如 "info" 或 "acne_workflow=debug,info"
    pub level: String,
    /// 彩色输出
    pub ansi: bool,
    /// 显示模块路径
    pub with_target: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("patientData"),
            state_dir: PathBuf::from(".acnegrade"),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            blur_threshold: 75.0,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            confidence_threshold: 0.01,
            timeout_secs: 30,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: ArchiveBackend::Local,
            root: PathBuf::from("archive"),
            bucket: None,
            region: None,
            prefix: "patients".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
            with_target: false,
        }
    }
}

/// 配置验证规则
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&AppConfig) -> Result<()>,
}

/// 配置验证器
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "storage.data_dir",
                validator: |config| {
                    if config.storage.data_dir.as_os_str().is_empty() {
                        anyhow::bail!("data directory cannot be empty")
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "storage.state_dir",
                validator: |config| {
                    if config.storage.state_dir.as_os_str().is_empty() {
                        anyhow::bail!("state directory cannot be empty")
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "quality.blur_threshold",
                validator: |config| {
                    let t = config.quality.blur_threshold;
                    if !t.is_finite() || t < 0.0 {
                        anyhow::bail!("blur threshold must be a non-negative number, got {}", t)
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "detector.confidence_threshold",
                validator: |config| {
                    let t = config.detector.confidence_threshold;
                    if !(0.0..=1.0).contains(&t) {
                        anyhow::bail!("confidence threshold must be within 0..=1, got {}", t)
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "detector.timeout_secs",
                validator: |config| {
                    if config.detector.timeout_secs == 0 {
                        anyhow::bail!("detection timeout cannot be 0")
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "archive.bucket",
                validator: |config| {
                    let missing = config.archive.bucket.as_deref().map_or(true, str::is_empty);
                    if config.archive.backend == ArchiveBackend::S3 && missing {
                        anyhow::bail!("s3 archive backend requires a bucket")
                    }
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &AppConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("invalid {}", rule.field_path)));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// 配置管理器
pub struct ConfigManager {
    config: AppConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// 加载配置，配置文件不存在时使用默认值
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("ACNE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        Self::from_config(config, config_path.map(Path::to_path_buf))
    }

    /// 使用已有配置
    pub fn from_config(config: AppConfig, config_path: Option<PathBuf>) -> Result<Self> {
        ConfigValidator::new().validate(&config)?;

        match &config_path {
            Some(path) => info!("Configuration loaded from {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(Self {
            config,
            config_path,
        })
    }

    /// 获取配置
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 以 TOML 形式输出当前生效的配置
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("Failed to serialize configuration")
    }
}
