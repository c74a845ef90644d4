//! 本地文件记录库
//!
//! 未配置远端数据库时使用，计数器和患者记录保存在同一个 JSON 文件中，
//! 布局与远端一致：`acnegrade` 下为计数器，`patientData` 下为患者记录。

use crate::connectors::RecordStore;
use acne_core::{PatientId, PatientRecord, Result, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordFile {
    /// 以分级名为键的计数器
    #[serde(default, rename = "acnegrade")]
    counters: BTreeMap<String, u64>,
    /// 以患者编号为键的记录
    #[serde(default, rename = "patientData")]
    records: BTreeMap<u32, PatientRecord>,
}

/// 文件记录库
pub struct FileRecordStore {
    path: PathBuf,
    data: RwLock<RecordFile>,
}

impl FileRecordStore {
    /// 打开记录文件，不存在时从空记录开始
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read(&path).await?;
            serde_json::from_slice(&content)?
        } else {
            RecordFile::default()
        };

        info!(
            "Loaded {} patient records from {}",
            data.records.len(),
            path.display()
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 先写临时文件再替换
    async fn save(&self, data: &RecordFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(data)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// 修改副本并落盘，落盘成功后才替换内存数据
    async fn update(&self, apply: impl FnOnce(&mut RecordFile)) -> Result<()> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        apply(&mut next);
        self.save(&next).await?;
        *data = next;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn get_counter(&self, severity: Severity) -> Result<u64> {
        Ok(self
            .data
            .read()
            .await
            .counters
            .get(severity.as_str())
            .copied()
            .unwrap_or(0))
    }

    async fn set_counter(&self, severity: Severity, value: u64) -> Result<()> {
        self.update(|data| {
            data.counters.insert(severity.as_str().to_string(), value);
        })
        .await
    }

    async fn set_patient_record(&self, patient: PatientId, record: &PatientRecord) -> Result<()> {
        let record = record.clone();
        self.update(|data| {
            data.records.insert(patient.number(), record);
        })
        .await?;
        info!("Patient record written for {}", patient);
        Ok(())
    }

    async fn list_patient_records(&self) -> Result<BTreeMap<PatientId, PatientRecord>> {
        Ok(self
            .data
            .read()
            .await
            .records
            .iter()
            .map(|(number, record)| (PatientId::new(*number), record.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(severity: Severity) -> PatientRecord {
        PatientRecord {
            date: "Oct-19-2026".to_string(),
            time: "09:30 AM".to_string(),
            severity,
        }
    }

    #[tokio::test]
    async fn test_counters_and_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("records.json");

        {
            let store = FileRecordStore::open(&path).await.unwrap();
            store.set_counter(Severity::Moderate, 2).await.unwrap();
            store
                .set_patient_record(PatientId::new(3), &record(Severity::Moderate))
                .await
                .unwrap();
        }

        let store = FileRecordStore::open(&path).await.unwrap();
        assert_eq!(store.get_counter(Severity::Moderate).await.unwrap(), 2);
        assert_eq!(store.get_counter(Severity::Severe).await.unwrap(), 0);
        let records = store.list_patient_records().await.unwrap();
        assert_eq!(records[&PatientId::new(3)].severity, Severity::Moderate);
    }

    #[tokio::test]
    async fn test_file_layout_matches_remote_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::open(dir.path().join("records.json")).await.unwrap();
        store.set_counter(Severity::Mild, 1).await.unwrap();
        store
            .set_patient_record(PatientId::new(1), &record(Severity::Mild))
            .await
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(value["acnegrade"]["Mild"], 1);
        assert_eq!(value["patientData"]["1"]["severity"], "Mild");
        assert!(!dir.path().join("records.json.tmp").exists());
    }
}
