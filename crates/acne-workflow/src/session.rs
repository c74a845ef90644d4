//! 患者会话与编号分配

use acne_core::{PatientId, Result, SessionState, SeverityResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 患者就诊会话
#[derive(Debug, Clone)]
pub struct PatientSession {
    pub patient: PatientId,
    pub state: SessionState,
    /// 最近一次分析结果，图像变化后清空
    pub result: Option<SeverityResult>,
}

impl PatientSession {
    pub fn new(patient: PatientId, state: SessionState) -> Self {
        Self {
            patient,
            state,
            result: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    last_allocated: u32,
}

/// 单调递增的患者编号分配器
///
/// 编号持久化在注册表文件中，空缺编号不会复用。
#[derive(Debug)]
pub struct PatientRegistry {
    path: Option<PathBuf>,
    last_allocated: Mutex<u32>,
}

impl PatientRegistry {
    /// 打开注册表文件
    ///
    /// `seed` 为存储中已存在的最大患者编号，注册表落后于它时以它为准。
    pub async fn open(path: impl Into<PathBuf>, seed: u32) -> Result<Self> {
        let path = path.into();
        let stored = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read(&path).await?;
            serde_json::from_slice::<RegistryFile>(&content)?.last_allocated
        } else {
            0
        };

        let last_allocated = stored.max(seed);
        info!(
            "Patient registry {} opened, last allocated number {}",
            path.display(),
            last_allocated
        );

        Ok(Self {
            path: Some(path),
            last_allocated: Mutex::new(last_allocated),
        })
    }

    /// 不落盘的注册表
    pub fn in_memory(seed: u32) -> Self {
        Self {
            path: None,
            last_allocated: Mutex::new(seed),
        }
    }

    /// 分配下一个患者编号
    pub async fn allocate(&self) -> Result<PatientId> {
        let mut last = self.last_allocated.lock().await;
        let next = *last + 1;

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let content = serde_json::to_vec_pretty(&RegistryFile {
                last_allocated: next,
            })?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, content).await?;
            tokio::fs::rename(&tmp, path).await?;
        }

        *last = next;
        debug!("Allocated patient number {}", next);
        Ok(PatientId::new(next))
    }

    /// 最近分配的患者，没有患者时为 None
    pub async fn latest(&self) -> Option<PatientId> {
        match *self.last_allocated.lock().await {
            0 => None,
            n => Some(PatientId::new(n)),
        }
    }
}
