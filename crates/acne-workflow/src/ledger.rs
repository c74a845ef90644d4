//! 严重程度账本
//!
//! 维护各严重程度的患者人数，以及每位患者最近确认的严重程度。
//! 患者重新评分时，旧分级减一、新分级加一，整个对账在一把锁内完成。

use acne_core::{PatientId, Result, Severity, SeverityLedgerEntry};
use acne_integration::RecordStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// 账本存储接口
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 患者最近确认的严重程度
    async fn last_severity(&self, patient: PatientId) -> Result<Option<Severity>>;

    /// 记录患者最近确认的严重程度
    async fn set_last_severity(&self, patient: PatientId, severity: Severity) -> Result<()>;

    /// 读取分级人数
    async fn get_count(&self, severity: Severity) -> Result<u64>;

    /// 写入分级人数
    async fn set_count(&self, severity: Severity, value: u64) -> Result<()>;
}

/// 内存账本存储
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    history: RwLock<HashMap<PatientId, Severity>>,
    counts: RwLock<HashMap<Severity, u64>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn last_severity(&self, patient: PatientId) -> Result<Option<Severity>> {
        Ok(self.history.read().await.get(&patient).copied())
    }

    async fn set_last_severity(&self, patient: PatientId, severity: Severity) -> Result<()> {
        self.history.write().await.insert(patient, severity);
        Ok(())
    }

    async fn get_count(&self, severity: Severity) -> Result<u64> {
        Ok(self.counts.read().await.get(&severity).copied().unwrap_or(0))
    }

    async fn set_count(&self, severity: Severity, value: u64) -> Result<()> {
        self.counts.write().await.insert(severity, value);
        Ok(())
    }
}

/// 持久化账本存储
///
/// 患者历史保存在本地 JSON 文件（以患者显示名为键），人数计数器保存在远端记录库。
pub struct PersistentLedgerStore {
    history_path: PathBuf,
    history: RwLock<BTreeMap<String, Severity>>,
    counters: Arc<dyn RecordStore>,
}

impl PersistentLedgerStore {
    /// 打开历史文件，不存在时从空历史开始
    pub async fn open(history_path: impl Into<PathBuf>, counters: Arc<dyn RecordStore>) -> Result<Self> {
        let history_path = history_path.into();
        let history = if tokio::fs::try_exists(&history_path).await? {
            let content = tokio::fs::read(&history_path).await?;
            serde_json::from_slice(&content)?
        } else {
            BTreeMap::new()
        };

        info!(
            "Loaded severity history for {} patients from {}",
            history.len(),
            history_path.display()
        );

        Ok(Self {
            history_path,
            history: RwLock::new(history),
            counters,
        })
    }

    /// 先写临时文件再替换，避免写一半的历史文件
    async fn save(&self, history: &BTreeMap<String, Severity>) -> Result<()> {
        if let Some(parent) = self.history_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.history_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(history)?).await?;
        tokio::fs::rename(&tmp, &self.history_path).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PersistentLedgerStore {
    async fn last_severity(&self, patient: PatientId) -> Result<Option<Severity>> {
        Ok(self.history.read().await.get(&patient.display_name()).copied())
    }

    async fn set_last_severity(&self, patient: PatientId, severity: Severity) -> Result<()> {
        let mut history = self.history.write().await;
        let previous = history.insert(patient.display_name(), severity);
        if let Err(e) = self.save(&history).await {
            match previous {
                Some(previous) => history.insert(patient.display_name(), previous),
                None => history.remove(&patient.display_name()),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get_count(&self, severity: Severity) -> Result<u64> {
        self.counters.get_counter(severity).await
    }

    async fn set_count(&self, severity: Severity, value: u64) -> Result<()> {
        self.counters.set_counter(severity, value).await
    }
}

/// 严重程度账本
pub struct SeverityLedger {
    store: Arc<dyn LedgerStore>,
    lock: Mutex<()>,
}

impl SeverityLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// 对账：更新患者的严重程度并调整分级人数
    ///
    /// 先读出全部计数器再写入；中途失败时回滚本次已写入的计数器。
    pub async fn reconcile(&self, patient: PatientId, new_severity: Severity) -> Result<SeverityLedgerEntry> {
        let _guard = self.lock.lock().await;

        let previous = self
            .store
            .last_severity(patient)
            .await
            .map_err(|e| e.into_persistence("读取患者历史失败"))?;
        let mut counts = self
            .read_counts()
            .await
            .map_err(|e| e.into_persistence("读取计数器失败"))?;

        let mut updates: Vec<(Severity, u64)> = Vec::new();
        if previous != Some(new_severity) {
            if let Some(previous) = previous {
                updates.push((previous, counts[&previous].saturating_sub(1)));
            }
            updates.push((new_severity, counts[&new_severity] + 1));
        }

        // 已写入计数器的原值，用于回滚
        let mut written: Vec<(Severity, u64)> = Vec::new();
        for (severity, next) in &updates {
            if let Err(e) = self.store.set_count(*severity, *next).await {
                self.rollback(&written).await;
                return Err(e.into_persistence("写入计数器失败"));
            }
            written.push((*severity, counts[severity]));
        }

        if let Err(e) = self.store.set_last_severity(patient, new_severity).await {
            self.rollback(&written).await;
            return Err(e.into_persistence("写入患者历史失败"));
        }

        counts.extend(updates);
        info!(
            "Reconciled {}: {:?} -> {} ({:?})",
            patient, previous, new_severity, counts
        );

        Ok(SeverityLedgerEntry {
            patient,
            previous,
            current: new_severity,
            counts,
        })
    }

    async fn rollback(&self, written: &[(Severity, u64)]) {
        for (severity, original) in written.iter().rev() {
            match self.store.set_count(*severity, *original).await {
                Ok(()) => warn!("Rolled back {} counter to {}", severity, original),
                Err(e) => error!("Failed to roll back {} counter to {}: {}", severity, original, e),
            }
        }
    }

    async fn read_counts(&self) -> Result<BTreeMap<Severity, u64>> {
        let mut counts = BTreeMap::new();
        for severity in Severity::ALL {
            counts.insert(severity, self.store.get_count(severity).await?);
        }
        Ok(counts)
    }

    /// 各分级人数
    pub async fn counts(&self) -> Result<BTreeMap<Severity, u64>> {
        let _guard = self.lock.lock().await;
        self.read_counts().await
    }

    /// 患者最近确认的严重程度
    pub async fn last_severity(&self, patient: PatientId) -> Result<Option<Severity>> {
        self.store.last_severity(patient).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acne_core::AcneError;
    use acne_integration::{FileRecordStore, InMemoryRecordStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ledger() -> SeverityLedger {
        SeverityLedger::new(Arc::new(InMemoryLedgerStore::new()))
    }

    fn total(counts: &BTreeMap<Severity, u64>) -> u64 {
        counts.values().sum()
    }

    #[tokio::test]
    async fn test_first_reconcile_increments_only() {
        let ledger = ledger();
        let entry = ledger.reconcile(PatientId::new(1), Severity::Mild).await.unwrap();

        assert_eq!(entry.previous, None);
        assert_eq!(entry.counts[&Severity::Mild], 1);
        assert_eq!(total(&entry.counts), 1);
    }

    #[tokio::test]
    async fn test_same_severity_is_idempotent() {
        let ledger = ledger();
        let patient = PatientId::new(1);
        let first = ledger.reconcile(patient, Severity::Moderate).await.unwrap();
        let second = ledger.reconcile(patient, Severity::Moderate).await.unwrap();

        assert_eq!(first.counts, second.counts);
        assert_eq!(second.previous, Some(Severity::Moderate));
    }

    #[tokio::test]
    async fn test_move_and_restore() {
        let ledger = ledger();
        ledger.reconcile(PatientId::new(1), Severity::Mild).await.unwrap();
        ledger.reconcile(PatientId::new(2), Severity::Severe).await.unwrap();
        let baseline = ledger.counts().await.unwrap();

        let moved = ledger.reconcile(PatientId::new(1), Severity::Severe).await.unwrap();
        assert_eq!(moved.counts[&Severity::Mild], 0);
        assert_eq!(moved.counts[&Severity::Severe], 2);

        let restored = ledger.reconcile(PatientId::new(1), Severity::Mild).await.unwrap();
        assert_eq!(restored.counts, baseline);
    }

    #[tokio::test]
    async fn test_counters_never_negative() {
        let store = Arc::new(InMemoryLedgerStore::new());
        // 历史存在但计数器已被外部清零
        store.set_last_severity(PatientId::new(1), Severity::Mild).await.unwrap();
        let ledger = SeverityLedger::new(store);

        let entry = ledger.reconcile(PatientId::new(1), Severity::Moderate).await.unwrap();
        assert_eq!(entry.counts[&Severity::Mild], 0);
        assert_eq!(entry.counts[&Severity::Moderate], 1);
    }

    #[tokio::test]
    async fn test_sum_matches_distinct_patients() {
        let ledger = ledger();
        let moves = [
            (1, Severity::Mild),
            (2, Severity::Severe),
            (1, Severity::Moderate),
            (3, Severity::None),
            (2, Severity::Severe),
            (4, Severity::Mild),
            (3, Severity::Severe),
            (1, Severity::Mild),
        ];
        for (patient, severity) in moves {
            ledger.reconcile(PatientId::new(patient), severity).await.unwrap();
        }

        let counts = ledger.counts().await.unwrap();
        assert_eq!(total(&counts), 4);
        assert_eq!(counts[&Severity::Mild], 2);
        assert_eq!(counts[&Severity::Severe], 2);
        assert_eq!(counts[&Severity::None], 0);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_same_band() {
        let ledger = Arc::new(ledger());
        let mut handles = Vec::new();
        for n in 1..=40u32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let patient = PatientId::new(n);
                ledger.reconcile(patient, Severity::Mild).await.unwrap();
                ledger.reconcile(patient, Severity::Moderate).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts[&Severity::Mild], 0);
        assert_eq!(counts[&Severity::Moderate], 40);
    }

    /// 第 N 次写计数器时失败
    struct FlakyStore {
        inner: InMemoryLedgerStore,
        writes: AtomicUsize,
        fail_on_write: usize,
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn last_severity(&self, patient: PatientId) -> Result<Option<Severity>> {
            self.inner.last_severity(patient).await
        }

        async fn set_last_severity(&self, patient: PatientId, severity: Severity) -> Result<()> {
            self.inner.set_last_severity(patient, severity).await
        }

        async fn get_count(&self, severity: Severity) -> Result<u64> {
            self.inner.get_count(severity).await
        }

        async fn set_count(&self, severity: Severity, value: u64) -> Result<()> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on_write {
                return Err(AcneError::StorageUnavailable("counter offline".into()));
            }
            self.inner.set_count(severity, value).await
        }
    }

    #[tokio::test]
    async fn test_failed_increment_rolls_back_decrement() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryLedgerStore::new(),
            writes: AtomicUsize::new(0),
            // 第 1 次写：首次评分；第 2 次写：减旧分级；第 3 次写：加新分级失败
            fail_on_write: 3,
        });
        let ledger = SeverityLedger::new(store.clone());
        let patient = PatientId::new(1);
        ledger.reconcile(patient, Severity::Mild).await.unwrap();

        let err = ledger.reconcile(patient, Severity::Severe).await.unwrap_err();
        assert!(err.is_retryable());

        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts[&Severity::Mild], 1);
        assert_eq!(counts[&Severity::Severe], 0);
        assert_eq!(ledger.last_severity(patient).await.unwrap(), Some(Severity::Mild));

        // 重试成功
        let entry = ledger.reconcile(patient, Severity::Severe).await.unwrap();
        assert_eq!(entry.counts[&Severity::Mild], 0);
        assert_eq!(entry.counts[&Severity::Severe], 1);
    }

    #[tokio::test]
    async fn test_persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patient_severity.json");
        let counters: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());

        {
            let store = PersistentLedgerStore::open(&path, counters.clone()).await.unwrap();
            let ledger = SeverityLedger::new(Arc::new(store));
            ledger.reconcile(PatientId::new(5), Severity::Moderate).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Patient No. 5"));

        let store = PersistentLedgerStore::open(&path, counters.clone()).await.unwrap();
        let ledger = SeverityLedger::new(Arc::new(store));
        let entry = ledger.reconcile(PatientId::new(5), Severity::Mild).await.unwrap();
        assert_eq!(entry.previous, Some(Severity::Moderate));
        assert_eq!(counters.get_counter(Severity::Moderate).await.unwrap(), 0);
        assert_eq!(counters.get_counter(Severity::Mild).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_counters_and_history_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let history_path = dir.path().join("patient_severity.json");
        let records_path = dir.path().join("records.json");

        {
            let counters: Arc<dyn RecordStore> =
                Arc::new(FileRecordStore::open(&records_path).await.unwrap());
            let store = PersistentLedgerStore::open(&history_path, counters).await.unwrap();
            let ledger = SeverityLedger::new(Arc::new(store));
            ledger.reconcile(PatientId::new(1), Severity::Mild).await.unwrap();
            ledger.reconcile(PatientId::new(2), Severity::Moderate).await.unwrap();
        }

        let counters: Arc<dyn RecordStore> =
            Arc::new(FileRecordStore::open(&records_path).await.unwrap());
        let store = PersistentLedgerStore::open(&history_path, counters).await.unwrap();
        let ledger = SeverityLedger::new(Arc::new(store));
        assert_eq!(total(&ledger.counts().await.unwrap()), 2);

        let entry = ledger.reconcile(PatientId::new(1), Severity::Severe).await.unwrap();
        assert_eq!(entry.previous, Some(Severity::Mild));
        assert_eq!(entry.counts[&Severity::Mild], 0);
        assert_eq!(entry.counts[&Severity::Moderate], 1);
        assert_eq!(entry.counts[&Severity::Severe], 1);
        assert_eq!(total(&entry.counts), 2);
    }

    /// 计数器只允许读取有限次数
    struct LimitedReadStore {
        inner: InMemoryLedgerStore,
        reads: AtomicUsize,
        max_reads: usize,
    }

    #[async_trait]
    impl LedgerStore for LimitedReadStore {
        async fn last_severity(&self, patient: PatientId) -> Result<Option<Severity>> {
            self.inner.last_severity(patient).await
        }

        async fn set_last_severity(&self, patient: PatientId, severity: Severity) -> Result<()> {
            self.inner.set_last_severity(patient, severity).await
        }

        async fn get_count(&self, severity: Severity) -> Result<u64> {
            if self.reads.fetch_add(1, Ordering::SeqCst) >= self.max_reads {
                return Err(AcneError::StorageUnavailable("counter offline".into()));
            }
            self.inner.get_count(severity).await
        }

        async fn set_count(&self, severity: Severity, value: u64) -> Result<()> {
            self.inner.set_count(severity, value).await
        }
    }

    #[tokio::test]
    async fn test_committed_reconcile_does_not_read_counters_again() {
        let store = Arc::new(LimitedReadStore {
            inner: InMemoryLedgerStore::new(),
            reads: AtomicUsize::new(0),
            max_reads: Severity::ALL.len(),
        });
        let ledger = SeverityLedger::new(store.clone());

        let entry = ledger.reconcile(PatientId::new(1), Severity::Mild).await.unwrap();
        assert_eq!(entry.counts[&Severity::Mild], 1);
        assert_eq!(total(&entry.counts), 1);
        assert_eq!(store.inner.get_count(Severity::Mild).await.unwrap(), 1);
        assert_eq!(
            ledger.last_severity(PatientId::new(1)).await.unwrap(),
            Some(Severity::Mild)
        );
    }

    #[tokio::test]
    async fn test_remote_counter_failure_leaves_history_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let counters = Arc::new(InMemoryRecordStore::new());
        let store = PersistentLedgerStore::open(dir.path().join("h.json"), counters.clone())
            .await
            .unwrap();
        let ledger = SeverityLedger::new(Arc::new(store));

        counters.set_fail_counter_writes(true);
        let err = ledger.reconcile(PatientId::new(1), Severity::Mild).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ledger.last_severity(PatientId::new(1)).await.unwrap(), None);
    }
}
