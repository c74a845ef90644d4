//! # AcneGrade
//!
//! 痤疮严重程度分级系统的门面 crate，重新导出各子模块。

pub use acne_admin as admin;
pub use acne_core as core;
pub use acne_grading as grading;
pub use acne_integration as integration;
pub use acne_storage as storage;
pub use acne_workflow as workflow;
