//! 痤疮分级工作站命令行程序

use acne_admin::{init_logging, AppConfig, ArchiveBackend, ConfigManager};
use acne_core::{PatientId, Region};
use acne_grading::{HttpLesionDetector, ScoringEngine};
use acne_integration::{
    AuthenticationConfig, FileRecordStore, RealtimeDatabaseConnector, RecordStore,
};
use acne_storage::{ArchiveStore, BlurDetector, ImageStore, LocalImageStore, ObjectStoreArchive};
use acne_workflow::{PatientRegistry, PersistentLedgerStore, SeverityLedger, WorkflowEngine};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SEVERITY_HISTORY_FILE: &str = "patient_severity.json";
const REGISTRY_FILE: &str = "registry.json";
const RECORDS_FILE: &str = "records.json";

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "acne-server")]
#[command(about = "痤疮严重程度分级工作站")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "acnegrade.toml")]
    config: PathBuf,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 创建新患者
    NewPatient,
    /// 提交区域图像
    Submit {
        patient: u32,
        region: Region,
        image: PathBuf,
        /// 图像类型 (png/jpeg)，默认取文件扩展名
        #[arg(long)]
        image_type: Option<String>,
    },
    /// 查看图像采集情况
    Status { patient: u32 },
    /// 删除区域图像
    Remove { patient: u32, region: Region },
    /// 分析患者图像
    Analyze {
        patient: u32,
        /// 分析后立即确认归档
        #[arg(long)]
        finalize: bool,
    },
    /// 各严重程度的患者人数
    Counts,
    /// 患者记录
    Records {
        /// 按患者名过滤
        #[arg(long)]
        search: Option<String>,
    },
    /// 最近创建的患者
    Latest,
    /// 输出当前生效的配置
    Config,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 按配置组装工作流引擎
async fn build_engine(config: &AppConfig) -> Result<WorkflowEngine> {
    let images: Arc<dyn ImageStore> = Arc::new(LocalImageStore::new(
        &config.storage.data_dir,
        BlurDetector::new(config.quality.blur_threshold),
    ));

    let timeout = Duration::from_secs(config.detector.timeout_secs);
    let detector = Arc::new(HttpLesionDetector::new(config.detector.endpoint.clone(), timeout));
    let scoring = ScoringEngine::new(detector)
        .with_confidence_threshold(config.detector.confidence_threshold)
        .with_detection_timeout(timeout);

    let state_dir = &config.storage.state_dir;
    let records: Arc<dyn RecordStore> = match &config.remote.database_url {
        Some(url) => {
            let auth = match &config.remote.auth_token {
                Some(token) => AuthenticationConfig::QueryToken {
                    token: token.clone(),
                },
                None => AuthenticationConfig::None,
            };
            let connector = RealtimeDatabaseConnector::new(url.clone(), auth);
            if connector.check_connection().await? {
                info!("Using remote record store at {}", url);
            } else {
                warn!("Remote record store {} is unreachable, finalize will fail until it recovers", url);
            }
            Arc::new(connector)
        }
        None => {
            let store = FileRecordStore::open(state_dir.join(RECORDS_FILE)).await?;
            info!(
                "No remote database configured, records and counters are kept in {}",
                store.path().display()
            );
            Arc::new(store)
        }
    };

    let ledger_store =
        PersistentLedgerStore::open(state_dir.join(SEVERITY_HISTORY_FILE), records.clone()).await?;
    let ledger = Arc::new(SeverityLedger::new(Arc::new(ledger_store)));

    let prefix = config.archive.prefix.clone();
    let archive: Arc<dyn ArchiveStore> = match config.archive.backend {
        ArchiveBackend::Local => Arc::new(ObjectStoreArchive::local(&config.archive.root, prefix)?),
        ArchiveBackend::S3 => {
            let bucket = config
                .archive
                .bucket
                .as_deref()
                .context("archive.bucket is required for the s3 backend")?;
            Arc::new(ObjectStoreArchive::s3(bucket, config.archive.region.as_deref(), prefix)?)
        }
        ArchiveBackend::Memory => Arc::new(ObjectStoreArchive::in_memory(prefix)),
    };

    let seed = images.highest_patient_number().await?;
    let registry = PatientRegistry::open(state_dir.join(REGISTRY_FILE), seed).await?;

    Ok(WorkflowEngine::new(images, scoring, ledger, records, archive, registry))
}

async fn run(command: Command, manager: &ConfigManager) -> Result<()> {
    if let Command::Config = command {
        print!("{}", manager.to_toml()?);
        return Ok(());
    }

    let engine = build_engine(manager.config()).await?;

    match command {
        Command::NewPatient => {
            let patient = engine.create_patient().await?;
            println!("{}", patient);
        }
        Command::Submit {
            patient,
            region,
            image,
            image_type,
        } => {
            let image_type = match image_type {
                Some(t) => t,
                None => image
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_string)
                    .context("cannot infer image type, pass --image-type")?,
            };
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let receipt = engine
                .submit_region_image(PatientId::new(patient), region, &bytes, &image_type)
                .await?;
            if receipt.is_blurred {
                warn!("{} image looks blurred, consider retaking it", region);
            }
            print_json(&receipt)?;
        }
        Command::Status { patient } => {
            let patient = PatientId::new(patient);
            let status = engine.intake_status(patient).await?;
            let state = engine.session_state(patient).await?;
            print_json(&json!({
                "patient": patient.display_name(),
                "state": state,
                "regions": status,
                "has_results": engine.has_results(patient).await?,
            }))?;
        }
        Command::Remove { patient, region } => {
            let removed = engine
                .remove_region_image(PatientId::new(patient), region)
                .await?;
            print_json(&json!({ "removed": removed }))?;
        }
        Command::Analyze { patient, finalize } => {
            let patient = PatientId::new(patient);
            let result = engine.analyze(patient).await?;
            print_json(&result)?;

            if finalize {
                match engine.finalize(patient, &result).await {
                    Ok(receipt) => print_json(&receipt)?,
                    Err(e) if e.is_retryable() => {
                        error!("Finalize failed for {}, retry later: {}", patient, e);
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Command::Counts => print_json(&engine.severity_counts().await?)?,
        Command::Records { search } => {
            let records = engine.patient_records(search.as_deref()).await?;
            let named: std::collections::BTreeMap<String, _> = records
                .into_iter()
                .map(|(patient, record)| (patient.display_name(), record))
                .collect();
            print_json(&named)?;
        }
        Command::Latest => println!("{}", engine.latest_patient_display().await),
        Command::Config => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::load(Some(&args.config))?;
    let mut logging = manager.config().logging.clone();
    if let Some(level) = args.log_level {
        logging.level = level;
    }
    init_logging(&logging)?;

    if let Err(e) = run(args.command, &manager).await {
        error!("Command failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
