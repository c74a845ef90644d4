//! # 影像存储模块
//!
//! 负责患者区域图像的存储、质量检查、结果图渲染以及远端归档。

pub mod annotate;
pub mod archive;
pub mod quality;
pub mod storage;

pub use annotate::render_result_visual;
pub use archive::{ArchiveReceipt, ArchiveStore, ArchivedFile, ObjectStoreArchive};
pub use quality::{decode_image, laplacian_variance, BlurDetector, DEFAULT_BLUR_THRESHOLD};
pub use storage::{ImageStore, LocalImageStore, RESULT_DIR_NAME};
