//! 远端归档
//!
//! 将患者目录（区域图像与结果图）上传到对象存储，目录结构被展平。

use acne_core::{AcneError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::{path::Path as ObjectPath, ObjectStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// 已归档文件条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 远端对象路径
    pub remote_path: String,
    /// 文件大小
    pub size: u64,
    /// SHA-256 摘要
    pub sha256: String,
}

/// 归档回执
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    pub remote_folder: String,
    pub files: Vec<ArchivedFile>,
    pub completed_at: DateTime<Utc>,
}

/// 远端归档接口
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// 上传本地目录下的全部文件到远端目录
    async fn upload_folder(&self, local_path: &Path, remote_path: &str) -> Result<ArchiveReceipt>;
}

/// 基于 object_store 的归档实现
pub struct ObjectStoreArchive {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreArchive {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// 内存对象存储，用于测试和演示
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), prefix)
    }

    /// 本地目录作为对象存储
    pub fn local(root: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(root.as_ref())
            .map_err(|e| AcneError::Config(format!("无法打开归档目录: {}", e)))?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    /// S3 兼容对象存储，凭据从环境变量读取
    pub fn s3(bucket: &str, region: Option<&str>, prefix: impl Into<String>) -> Result<Self> {
        let mut builder = object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        let store = builder
            .build()
            .map_err(|e| AcneError::Config(format!("S3 配置错误: {}", e)))?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    /// 底层对象存储
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    fn remote_folder(&self, remote_path: &str) -> String {
        let remote_path = remote_path.trim_matches('/');
        if self.prefix.is_empty() {
            remote_path.to_string()
        } else {
            format!("{}/{}", self.prefix, remote_path)
        }
    }
}

/// 递归收集目录下的文件
async fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

fn calculate_file_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ArchiveStore for ObjectStoreArchive {
    async fn upload_folder(&self, local_path: &Path, remote_path: &str) -> Result<ArchiveReceipt> {
        if !tokio::fs::try_exists(local_path).await? {
            return Err(AcneError::NotFound(format!(
                "归档目录不存在: {}",
                local_path.display()
            )));
        }

        let remote_folder = self.remote_folder(remote_path);
        let mut archived = Vec::new();

        for file in collect_files(local_path).await? {
            let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let data = tokio::fs::read(&file).await?;
            let object_path = format!("{}/{}", remote_folder, file_name);
            let size = data.len() as u64;
            let sha256 = calculate_file_hash(&data);

            self.store
                .put(&ObjectPath::from(object_path.as_str()), Bytes::from(data))
                .await
                .map_err(|e| {
                    error!("Failed to upload {} to {}: {}", file.display(), object_path, e);
                    AcneError::StorageUnavailable(format!("上传 {} 失败: {}", object_path, e))
                })?;

            debug!("Uploaded {} ({} bytes)", object_path, size);
            archived.push(ArchivedFile {
                local_path: file,
                remote_path: object_path,
                size,
                sha256,
            });
        }

        info!(
            "Archived {} files from {} to {}",
            archived.len(),
            local_path.display(),
            remote_folder
        );

        Ok(ArchiveReceipt {
            remote_folder,
            files: archived,
            completed_at: Utc::now(),
        })
    }
}
