//! 错误定义模块

use thiserror::Error;

/// 分级系统统一错误类型
#[derive(Error, Debug)]
pub enum AcneError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("病灶检测错误: {0}")]
    Detection(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("存储后端不可用: {0}")]
    StorageUnavailable(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl AcneError {
    /// 调用方是否可以重试该操作
    pub fn is_retryable(&self) -> bool {
        matches!(self, AcneError::Persistence(_) | AcneError::StorageUnavailable(_))
    }

    /// 提交阶段的失败：可重试错误保持原样，其余归为持久化错误并附带步骤
    pub fn into_persistence(self, step: &str) -> AcneError {
        if self.is_retryable() {
            self
        } else {
            AcneError::Persistence(format!("{}: {}", step, self))
        }
    }
}

/// 分级系统统一结果类型
pub type Result<T> = std::result::Result<T, AcneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AcneError::Persistence("ledger".into()).is_retryable());
        assert!(AcneError::StorageUnavailable("bucket".into()).is_retryable());
        assert!(!AcneError::Validation("format".into()).is_retryable());
        assert!(!AcneError::NotFound("image".into()).is_retryable());
    }

    #[test]
    fn test_into_persistence_keeps_retryable() {
        let err = AcneError::StorageUnavailable("bucket".into()).into_persistence("归档失败");
        assert!(matches!(err, AcneError::StorageUnavailable(_)));

        let err = AcneError::Validation("bad image".into()).into_persistence("保存结果图失败");
        match err {
            AcneError::Persistence(message) => {
                assert!(message.starts_with("保存结果图失败"));
                assert!(message.contains("bad image"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_io_conversion() {
        let err: AcneError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, AcneError::Io(_)));
    }
}
