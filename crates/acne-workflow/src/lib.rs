//! # 就诊工作流模块
//!
//! 提供痤疮分级就诊流程的管理功能，包括：
//! - 会话状态机：管理患者从图像采集、分析到确认归档的生命周期
//! - 严重程度账本：患者重新评分时保持各分级人数一致
//! - 编号分配：单调递增的患者编号
//! - 工作流引擎：协调存储、评分、归档与远端记录

pub mod engine;
pub mod ledger;
pub mod session;
pub mod state_machine;

// 重新导出主要类型
pub use engine::{FinalizeReceipt, WorkflowEngine};
pub use ledger::{InMemoryLedgerStore, LedgerStore, PersistentLedgerStore, SeverityLedger};
pub use session::{PatientRegistry, PatientSession};
pub use state_machine::{SessionEvent, SessionStateMachine};
