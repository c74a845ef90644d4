//! 工作流引擎
//!
//! 协调图像存储、评分引擎、账本和远端归档，对外提供就诊流程的统一接口。

use crate::{
    ledger::SeverityLedger,
    session::{PatientRegistry, PatientSession},
    state_machine::{SessionEvent, SessionStateMachine},
};
use acne_core::{
    utils::{latest_patient_display, patient_record_at},
    AcneError, ImageFormat, IntakeStatus, PatientId, PatientRecord, Region, Result,
    SessionState, Severity, SeverityLedgerEntry, SeverityResult, SubmissionReceipt,
};
use acne_grading::{RegionImages, ScoringEngine};
use acne_integration::RecordStore;
use acne_storage::{decode_image, render_result_visual, ArchiveReceipt, ArchiveStore, ImageStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 确认归档回执
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    pub patient: PatientId,
    pub severity: Severity,
    pub record: PatientRecord,
    pub ledger: SeverityLedgerEntry,
    pub archive: ArchiveReceipt,
}

/// 工作流引擎
pub struct WorkflowEngine {
    images: Arc<dyn ImageStore>,
    scoring: ScoringEngine,
    ledger: Arc<SeverityLedger>,
    records: Arc<dyn RecordStore>,
    archive: Arc<dyn ArchiveStore>,
    registry: PatientRegistry,
    state_machine: SessionStateMachine,
    sessions: Mutex<HashMap<PatientId, Arc<Mutex<PatientSession>>>>,
}

impl WorkflowEngine {
    pub fn new(
        images: Arc<dyn ImageStore>,
        scoring: ScoringEngine,
        ledger: Arc<SeverityLedger>,
        records: Arc<dyn RecordStore>,
        archive: Arc<dyn ArchiveStore>,
        registry: PatientRegistry,
    ) -> Self {
        Self {
            images,
            scoring,
            ledger,
            records,
            archive,
            registry,
            state_machine: SessionStateMachine::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 获取患者会话
    ///
    /// 进程重启后会话不在内存中，按存储中的图像重建。
    async fn session(&self, patient: PatientId) -> Result<Arc<Mutex<PatientSession>>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&patient) {
            return Ok(session.clone());
        }

        let latest = self.registry.latest().await.map_or(0, |p| p.number());
        if patient.number() == 0 || patient.number() > latest {
            return Err(AcneError::NotFound(format!("患者 {}", patient)));
        }

        let state = if self.any_image(patient).await? {
            SessionState::ReadyToAnalyze
        } else {
            SessionState::Intake
        };
        debug!("Restored session for {} in state {:?}", patient, state);

        let session = Arc::new(Mutex::new(PatientSession::new(patient, state)));
        sessions.insert(patient, session.clone());
        Ok(session)
    }

    async fn any_image(&self, patient: PatientId) -> Result<bool> {
        for region in Region::ALL {
            if self.images.exists(patient, region).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 创建新患者
    pub async fn create_patient(&self) -> Result<PatientId> {
        let patient = self.registry.allocate().await?;
        self.images.create_patient(patient).await?;

        let state = self
            .state_machine
            .transition(SessionState::Created, SessionEvent::PatientAllocated)?;
        self.sessions.lock().await.insert(
            patient,
            Arc::new(Mutex::new(PatientSession::new(patient, state))),
        );

        info!("Created {}", patient);
        Ok(patient)
    }

    /// 提交区域图像
    ///
    /// 格式不受支持或数据无法解码时直接拒绝，不改变任何状态。
    /// 模糊检查只作提示，不阻止提交。
    pub async fn submit_region_image(
        &self,
        patient: PatientId,
        region: Region,
        bytes: &[u8],
        image_type: &str,
    ) -> Result<SubmissionReceipt> {
        let format = ImageFormat::parse(image_type)?;
        if bytes.is_empty() {
            return Err(AcneError::Validation(format!("{} 图像数据为空", region)));
        }
        let decoded = decode_image(bytes, format)?;

        let session = self.session(patient).await?;
        let mut session = session.lock().await;
        let next = self
            .state_machine
            .transition(session.state, SessionEvent::ImageSubmitted)?;

        let is_blurred = self.images.is_image_blurred(&decoded);
        if is_blurred {
            warn!("{} image for {} looks blurred", region, patient);
        }

        self.images.write(patient, region, bytes, format).await?;
        session.state = next;
        session.result = None;

        Ok(SubmissionReceipt {
            accepted: true,
            region,
            is_blurred,
        })
    }

    /// 各区域图像采集情况
    pub async fn intake_status(&self, patient: PatientId) -> Result<IntakeStatus> {
        self.session(patient).await?;

        let mut status = IntakeStatus::new();
        for region in Region::ALL {
            status.insert(region, self.images.exists(patient, region).await?);
        }
        Ok(status)
    }

    /// 分析患者当前的区域图像
    ///
    /// 重新分析会覆盖之前的结果，账本只在确认时更新。
    pub async fn analyze(&self, patient: PatientId) -> Result<SeverityResult> {
        let session = self.session(patient).await?;
        let mut session = session.lock().await;
        let next = self
            .state_machine
            .transition(session.state, SessionEvent::AnalysisCompleted)?;

        let mut images = RegionImages::new();
        for region in Region::ALL {
            match self.images.read(patient, region).await {
                Ok(bytes) => {
                    images.insert(region, bytes);
                }
                Err(AcneError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let result = self.scoring.analyze(patient, &images).await;
        session.state = next;
        session.result = Some(result.clone());
        Ok(result)
    }

    /// 确认分析结果
    ///
    /// 依次渲染结果图、归档、写患者记录，最后对账。任一步失败都保持
    /// Analyzed 状态，调用方可以重试；账本只在前面各步成功后才更新。
    pub async fn finalize(&self, patient: PatientId, result: &SeverityResult) -> Result<FinalizeReceipt> {
        let session = self.session(patient).await?;
        let mut session = session.lock().await;
        let next = self
            .state_machine
            .transition(session.state, SessionEvent::Finalized)?;

        let held = match &session.result {
            Some(held) if held.analysis_id == result.analysis_id && result.patient == patient => {
                held.clone()
            }
            _ => {
                return Err(AcneError::Validation(format!(
                    "{} 的分析结果 {} 已过期，请重新分析",
                    patient, result.analysis_id
                )))
            }
        };

        self.render_results(&held)
            .await
            .map_err(|e| e.into_persistence("保存结果图失败"))?;

        let archive = self
            .archive
            .upload_folder(&self.images.patient_dir(patient), &patient.display_name())
            .await
            .map_err(|e| e.into_persistence("归档失败"))?;

        let record = patient_record_at(&chrono::Local::now(), held.severity);
        self.records
            .set_patient_record(patient, &record)
            .await
            .map_err(|e| e.into_persistence("写入患者记录失败"))?;

        let ledger = self.ledger.reconcile(patient, held.severity).await?;

        session.state = next;
        info!(
            "Finalized {} with severity {} ({} files archived)",
            patient,
            held.severity,
            archive.files.len()
        );

        Ok(FinalizeReceipt {
            patient,
            severity: held.severity,
            record,
            ledger,
            archive,
        })
    }

    /// 为成功检测的区域保存结果图，先清掉上次确认留下的结果图
    async fn render_results(&self, result: &SeverityResult) -> Result<()> {
        self.images.clear_results(result.patient).await?;
        for score in &result.region_scores {
            if !score.image_present || score.error.is_some() {
                continue;
            }
            let image = self.images.read(result.patient, score.region).await?;
            let visual = render_result_visual(&image, &score.detections)?;
            self.images
                .write_result(result.patient, score.region, &visual)
                .await?;
        }
        Ok(())
    }

    /// 删除区域图像，图像不存在时返回 false
    pub async fn remove_region_image(&self, patient: PatientId, region: Region) -> Result<bool> {
        let session = self.session(patient).await?;
        let mut session = session.lock().await;

        if !self.images.delete(patient, region).await? {
            debug!("No {} image to remove for {}", region, patient);
            return Ok(false);
        }

        let event = if self.any_image(patient).await? {
            SessionEvent::ImageRemoved
        } else {
            SessionEvent::LastImageRemoved
        };
        match self.state_machine.transition(session.state, event) {
            Ok(next) => session.state = next,
            Err(e) => warn!("Session {} not updated after removal: {}", patient, e),
        }
        session.result = None;

        info!("Removed {} image for {}", region, patient);
        Ok(true)
    }

    /// 最近创建的患者
    pub async fn latest_patient(&self) -> Option<PatientId> {
        self.registry.latest().await
    }

    /// 最近患者的显示文本
    pub async fn latest_patient_display(&self) -> String {
        latest_patient_display(self.latest_patient().await)
    }

    /// 是否已保存结果图
    pub async fn has_results(&self, patient: PatientId) -> Result<bool> {
        self.images.has_results(patient).await
    }

    /// 各分级人数
    pub async fn severity_counts(&self) -> Result<BTreeMap<Severity, u64>> {
        self.ledger.counts().await
    }

    /// 患者记录，可按显示名过滤（不区分大小写）
    pub async fn patient_records(&self, search: Option<&str>) -> Result<BTreeMap<PatientId, PatientRecord>> {
        let records = self.records.list_patient_records().await?;
        let Some(search) = search.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()) else {
            return Ok(records);
        };

        Ok(records
            .into_iter()
            .filter(|(patient, _)| patient.display_name().to_lowercase().contains(&search))
            .collect())
    }

    /// 会话当前状态
    pub async fn session_state(&self, patient: PatientId) -> Result<SessionState> {
        let session = self.session(patient).await?;
        let state = session.lock().await.state;
        Ok(state)
    }

    /// 会话持有的分析结果
    pub async fn current_result(&self, patient: PatientId) -> Result<Option<SeverityResult>> {
        let session = self.session(patient).await?;
        let result = session.lock().await.result.clone();
        Ok(result)
    }
}
