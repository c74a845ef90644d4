//! 患者区域图像存储管理
//!
//! 目录布局：`{base}/Patient No. N/Patient No. N_{Region}.{ext}`，
//! 结果图位于 `{base}/Patient No. N/result/{Region}_result.jpg`。

use crate::quality::BlurDetector;
use acne_core::{AcneError, ImageFormat, PatientId, Region, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 结果图目录名
pub const RESULT_DIR_NAME: &str = "result";

/// 区域图像存储接口
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// 区域图像是否存在（任一支持的格式）
    async fn exists(&self, patient: PatientId, region: Region) -> Result<bool>;

    /// 写入区域图像，覆盖该区域已有的图像
    async fn write(
        &self,
        patient: PatientId,
        region: Region,
        bytes: &[u8],
        format: ImageFormat,
    ) -> Result<PathBuf>;

    /// 读取区域图像，不存在时返回 NotFound
    async fn read(&self, patient: PatientId, region: Region) -> Result<Vec<u8>>;

    /// 删除区域图像，返回是否确实删除了文件
    async fn delete(&self, patient: PatientId, region: Region) -> Result<bool>;

    /// 模糊检查
    fn is_blurred(&self, bytes: &[u8]) -> Result<bool>;

    /// 已解码图像的模糊检查
    fn is_image_blurred(&self, img: &DynamicImage) -> bool;

    /// 创建患者目录
    async fn create_patient(&self, patient: PatientId) -> Result<PathBuf>;

    /// 已存在的最大患者编号，没有患者时为 0
    async fn highest_patient_number(&self) -> Result<u32>;

    /// 保存区域结果图
    async fn write_result(&self, patient: PatientId, region: Region, bytes: &[u8])
        -> Result<PathBuf>;

    /// 清除患者的全部结果图
    async fn clear_results(&self, patient: PatientId) -> Result<()>;

    /// 是否已有结果图
    async fn has_results(&self, patient: PatientId) -> Result<bool>;

    /// 患者本地目录，用于归档
    fn patient_dir(&self, patient: PatientId) -> PathBuf;
}

/// 本地文件系统存储
pub struct LocalImageStore {
    base_path: PathBuf,
    blur: BlurDetector,
}

impl LocalImageStore {
    pub fn new(base_path: impl Into<PathBuf>, blur: BlurDetector) -> Self {
        Self {
            base_path: base_path.into(),
            blur,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn image_path(&self, patient: PatientId, region: Region, format: ImageFormat) -> PathBuf {
        let name = patient.display_name();
        self.patient_dir(patient)
            .join(format!("{}_{}.{}", name, region, format.extension()))
    }

    fn result_path(&self, patient: PatientId, region: Region) -> PathBuf {
        self.patient_dir(patient)
            .join(RESULT_DIR_NAME)
            .join(format!("{}_result.jpg", region))
    }

    /// 找到区域图像的实际路径
    async fn locate(&self, patient: PatientId, region: Region) -> Result<Option<PathBuf>> {
        for format in ImageFormat::ALL {
            let path = self.image_path(patient, region, format);
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn exists(&self, patient: PatientId, region: Region) -> Result<bool> {
        Ok(self.locate(patient, region).await?.is_some())
    }

    async fn write(
        &self,
        patient: PatientId,
        region: Region,
        bytes: &[u8],
        format: ImageFormat,
    ) -> Result<PathBuf> {
        let full_path = self.image_path(patient, region, format);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 同一区域只保留一张图像
        for other in ImageFormat::ALL.into_iter().filter(|f| *f != format) {
            let stale = self.image_path(patient, region, other);
            if tokio::fs::try_exists(&stale).await? {
                tokio::fs::remove_file(&stale).await?;
                debug!("Removed stale {} image {}", other, stale.display());
            }
        }

        tokio::fs::write(&full_path, bytes).await?;
        info!("Stored {} image for {} at {}", region, patient, full_path.display());
        Ok(full_path)
    }

    async fn read(&self, patient: PatientId, region: Region) -> Result<Vec<u8>> {
        match self.locate(patient, region).await? {
            Some(path) => Ok(tokio::fs::read(path).await?),
            None => Err(AcneError::NotFound(format!("{} 的 {} 图像", patient, region))),
        }
    }

    async fn delete(&self, patient: PatientId, region: Region) -> Result<bool> {
        let mut removed = false;
        for format in ImageFormat::ALL {
            let path = self.image_path(patient, region, format);
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path).await?;
                removed = true;
            }
        }
        Ok(removed)
    }

    fn is_blurred(&self, bytes: &[u8]) -> Result<bool> {
        self.blur.is_blurred(bytes)
    }

    fn is_image_blurred(&self, img: &DynamicImage) -> bool {
        self.blur.is_image_blurred(img)
    }

    async fn create_patient(&self, patient: PatientId) -> Result<PathBuf> {
        let dir = self.patient_dir(patient);
        tokio::fs::create_dir_all(&dir).await?;
        info!("New patient folder created: {}", dir.display());
        Ok(dir)
    }

    async fn highest_patient_number(&self) -> Result<u32> {
        if !tokio::fs::try_exists(&self.base_path).await? {
            return Ok(0);
        }

        let mut highest = 0;
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(patient) = name.to_str().and_then(PatientId::parse_display_name) {
                highest = highest.max(patient.number());
            }
        }
        Ok(highest)
    }

    async fn write_result(
        &self,
        patient: PatientId,
        region: Region,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = self.result_path(patient, region);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn clear_results(&self, patient: PatientId) -> Result<()> {
        let dir = self.patient_dir(patient).join(RESULT_DIR_NAME);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
            debug!("Cleared result visuals in {}", dir.display());
        }
        Ok(())
    }

    async fn has_results(&self, patient: PatientId) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.patient_dir(patient).join(RESULT_DIR_NAME)).await?)
    }

    fn patient_dir(&self, patient: PatientId) -> PathBuf {
        self.base_path.join(patient.display_name())
    }
}
