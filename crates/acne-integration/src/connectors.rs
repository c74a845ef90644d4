//! 远端记录库连接器
//!
//! 记录库保存两类数据：
//! - `acnegrade/{Severity}`：各严重程度的患者人数
//! - `patientData/{N}`：患者最近一次确认的记录

use acne_core::{AcneError, PatientId, PatientRecord, Result, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 计数器根路径
pub const COUNTER_ROOT: &str = "acnegrade";
/// 患者记录根路径
pub const PATIENT_RECORD_ROOT: &str = "patientData";

/// 远端记录库接口
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 读取严重程度计数，不存在时为 0
    async fn get_counter(&self, severity: Severity) -> Result<u64>;

    /// 写入严重程度计数
    async fn set_counter(&self, severity: Severity, value: u64) -> Result<()>;

    /// 写入患者记录，覆盖旧记录
    async fn set_patient_record(&self, patient: PatientId, record: &PatientRecord) -> Result<()>;

    /// 列出全部患者记录
    async fn list_patient_records(&self) -> Result<BTreeMap<PatientId, PatientRecord>>;
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthenticationConfig {
    None,
    /// 作为 `auth` 查询参数传递的数据库密钥或 ID token
    QueryToken { token: String },
    BearerToken { token: String },
}

/// 连接器状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorStatus {
    Disconnected,
    Connected,
    Error(String),
}

/// 实时数据库 REST 连接器
///
/// 路径以 `.json` 结尾访问，GET 读取、PUT 覆盖写入。
pub struct RealtimeDatabaseConnector {
    base_url: String,
    authentication: AuthenticationConfig,
    client: reqwest::Client,
    status: RwLock<ConnectorStatus>,
}

impl RealtimeDatabaseConnector {
    pub fn new(base_url: impl Into<String>, authentication: AuthenticationConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            authentication,
            client: reqwest::Client::new(),
            status: RwLock::new(ConnectorStatus::Disconnected),
        }
    }

    pub async fn status(&self) -> ConnectorStatus {
        self.status.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path)
    }

    fn add_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authentication {
            AuthenticationConfig::None => request,
            AuthenticationConfig::QueryToken { token } => request.query(&[("auth", token)]),
            AuthenticationConfig::BearerToken { token } => request.bearer_auth(token),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response> {
        let response = match self.add_auth(request).send().await {
            Ok(response) => response,
            Err(e) => {
                *self.status.write().await = ConnectorStatus::Error(e.to_string());
                return Err(AcneError::StorageUnavailable(format!(
                    "无法连接记录库 ({}): {}",
                    path, e
                )));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            *self.status.write().await = ConnectorStatus::Error(status.to_string());
            return Err(AcneError::Persistence(format!(
                "记录库请求 {} 失败: {}",
                path, status
            )));
        }

        *self.status.write().await = ConnectorStatus::Connected;
        Ok(response)
    }

    async fn get_value(&self, path: &str) -> Result<serde_json::Value> {
        let response = self.send(self.client.get(self.url(path)), path).await?;
        response
            .json()
            .await
            .map_err(|e| AcneError::Persistence(format!("记录库响应解析失败 ({}): {}", path, e)))
    }

    async fn put_value<T: Serialize + Sync>(&self, path: &str, value: &T) -> Result<()> {
        self.send(self.client.put(self.url(path)).json(value), path)
            .await?;
        debug!("PUT {}", path);
        Ok(())
    }

    /// 检查连接
    pub async fn check_connection(&self) -> Result<bool> {
        let request = self
            .client
            .get(self.url(""))
            .query(&[("shallow", "true")]);
        match self.send(request, "/").await {
            Ok(_) => Ok(true),
            Err(e) if e.is_retryable() => {
                warn!("Record store unreachable: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// 解析患者记录集合
///
/// 键为连续整数时数据库会以数组形式返回，空位为 null。
fn parse_patient_records(value: serde_json::Value) -> Result<BTreeMap<PatientId, PatientRecord>> {
    let mut records = BTreeMap::new();
    match value {
        serde_json::Value::Null => {}
        serde_json::Value::Object(map) => {
            for (key, entry) in map {
                let Ok(number) = key.parse::<u32>() else {
                    warn!("Skipping patient record with non-numeric key {}", key);
                    continue;
                };
                records.insert(PatientId::new(number), serde_json::from_value(entry)?);
            }
        }
        serde_json::Value::Array(entries) => {
            for (index, entry) in entries.into_iter().enumerate() {
                if entry.is_null() {
                    continue;
                }
                records.insert(PatientId::new(index as u32), serde_json::from_value(entry)?);
            }
        }
        other => {
            return Err(AcneError::Persistence(format!(
                "患者记录格式错误: {}",
                other
            )))
        }
    }
    Ok(records)
}

/// 解析计数器值，不存在时为 0
fn parse_counter(path: &str, value: serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Null => Ok(0),
        other => other.as_u64().ok_or_else(|| {
            AcneError::Persistence(format!("计数器 {} 不是非负整数: {}", path, other))
        }),
    }
}

#[async_trait]
impl RecordStore for RealtimeDatabaseConnector {
    async fn get_counter(&self, severity: Severity) -> Result<u64> {
        let path = format!("{}/{}", COUNTER_ROOT, severity);
        let value = self.get_value(&path).await?;
        parse_counter(&path, value)
    }

    async fn set_counter(&self, severity: Severity, value: u64) -> Result<()> {
        let path = format!("{}/{}", COUNTER_ROOT, severity);
        self.put_value(&path, &value).await
    }

    async fn set_patient_record(&self, patient: PatientId, record: &PatientRecord) -> Result<()> {
        let path = format!("{}/{}", PATIENT_RECORD_ROOT, patient.number());
        self.put_value(&path, record).await?;
        info!("Patient record written for {}", patient);
        Ok(())
    }

    async fn list_patient_records(&self) -> Result<BTreeMap<PatientId, PatientRecord>> {
        let value = self.get_value(PATIENT_RECORD_ROOT).await?;
        parse_patient_records(value)
    }
}

/// 内存记录库，用于测试和离线运行
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    counters: RwLock<HashMap<Severity, u64>>,
    records: RwLock<BTreeMap<PatientId, PatientRecord>>,
    fail_counter_writes: AtomicBool,
    fail_record_writes: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟计数器写入失败
    pub fn set_fail_counter_writes(&self, fail: bool) {
        self.fail_counter_writes.store(fail, Ordering::SeqCst);
    }

    /// 模拟患者记录写入失败
    pub fn set_fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_counter(&self, severity: Severity) -> Result<u64> {
        Ok(self.counters.read().await.get(&severity).copied().unwrap_or(0))
    }

    async fn set_counter(&self, severity: Severity, value: u64) -> Result<()> {
        if self.fail_counter_writes.load(Ordering::SeqCst) {
            return Err(AcneError::StorageUnavailable("计数器写入失败".to_string()));
        }
        self.counters.write().await.insert(severity, value);
        Ok(())
    }

    async fn set_patient_record(&self, patient: PatientId, record: &PatientRecord) -> Result<()> {
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(AcneError::StorageUnavailable("患者记录写入失败".to_string()));
        }
        self.records.write().await.insert(patient, record.clone());
        Ok(())
    }

    async fn list_patient_records(&self) -> Result<BTreeMap<PatientId, PatientRecord>> {
        Ok(self.records.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(severity: Severity) -> PatientRecord {
        PatientRecord {
            date: "Oct-19-2026".to_string(),
            time: "09:30 AM".to_string(),
            severity,
        }
    }

    #[test]
    fn test_parse_object_records() {
        let value = json!({
            "3": {"date": "Oct-19-2026", "time": "09:30 AM", "severity": "Mild"},
            "12": {"date": "Oct-19-2026", "time": "09:30 AM", "severity": "Severe"},
            "draft": {"date": "", "time": "", "severity": "None"}
        });
        let records = parse_patient_records(value).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&PatientId::new(12)].severity, Severity::Severe);
    }

    #[test]
    fn test_parse_array_records() {
        let value = json!([
            null,
            {"date": "Oct-19-2026", "time": "09:30 AM", "severity": "Moderate"},
            null,
            {"date": "Oct-19-2026", "time": "09:30 AM", "severity": "None"}
        ]);
        let records = parse_patient_records(value).unwrap();
        assert_eq!(
            records.keys().copied().collect::<Vec<_>>(),
            vec![PatientId::new(1), PatientId::new(3)]
        );
    }

    #[test]
    fn test_parse_null_is_empty() {
        assert!(parse_patient_records(serde_json::Value::Null).unwrap().is_empty());
        assert!(parse_patient_records(json!(5)).is_err());
    }

    #[test]
    fn test_parse_counter_values() {
        assert_eq!(parse_counter("acnegrade/Mild", serde_json::Value::Null).unwrap(), 0);
        assert_eq!(parse_counter("acnegrade/Mild", json!(7)).unwrap(), 7);

        for malformed in [json!("7"), json!(2.5), json!(-1), json!({"count": 1})] {
            let err = parse_counter("acnegrade/Mild", malformed).unwrap_err();
            assert!(matches!(err, AcneError::Persistence(_)));
        }
    }

    #[test]
    fn test_connector_urls() {
        let connector = RealtimeDatabaseConnector::new(
            "https://example-rtdb.firebaseio.com/",
            AuthenticationConfig::None,
        );
        assert_eq!(
            connector.url("acnegrade/Mild"),
            "https://example-rtdb.firebaseio.com/acnegrade/Mild.json"
        );
    }

    #[tokio::test]
    async fn test_unreachable_connector_is_retryable() {
        let connector =
            RealtimeDatabaseConnector::new("http://127.0.0.1:9", AuthenticationConfig::None);
        let err = connector.get_counter(Severity::Mild).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(connector.status().await, ConnectorStatus::Error(_)));
        assert!(!connector.check_connection().await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_counters_and_records() {
        let store = InMemoryRecordStore::new();
        assert_eq!(store.get_counter(Severity::Mild).await.unwrap(), 0);
        store.set_counter(Severity::Mild, 3).await.unwrap();
        assert_eq!(store.get_counter(Severity::Mild).await.unwrap(), 3);

        store
            .set_patient_record(PatientId::new(1), &record(Severity::Mild))
            .await
            .unwrap();
        store
            .set_patient_record(PatientId::new(1), &record(Severity::Severe))
            .await
            .unwrap();
        let records = store.list_patient_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[&PatientId::new(1)].severity, Severity::Severe);
    }

    #[tokio::test]
    async fn test_in_memory_failure_injection() {
        let store = InMemoryRecordStore::new();
        store.set_fail_counter_writes(true);
        assert!(store.set_counter(Severity::None, 1).await.is_err());
        store.set_fail_counter_writes(false);
        assert!(store.set_counter(Severity::None, 1).await.is_ok());

        store.set_fail_record_writes(true);
        let err = store
            .set_patient_record(PatientId::new(2), &record(Severity::Mild))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
