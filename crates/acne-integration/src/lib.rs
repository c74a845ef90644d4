//! # 外部记录集成模块
//!
//! 提供与远端记录库的集成功能，包括：
//! - 按严重程度分级的人数计数器
//! - 患者检查记录（日期、时间、严重程度）
//! - 实时数据库 REST 连接器、本地文件实现与内存实现

pub mod connectors;
pub mod file_store;

pub use connectors::{
    AuthenticationConfig, ConnectorStatus, InMemoryRecordStore, RealtimeDatabaseConnector,
    RecordStore, COUNTER_ROOT, PATIENT_RECORD_ROOT,
};
pub use file_store::FileRecordStore;
