//! # 严重程度评分模块
//!
//! 提供病灶检测接口和评分引擎：
//! - 病灶检测：封装推理服务，返回病灶类型与置信度
//! - 评分引擎：按区域权重汇总最高病灶分级，映射严重程度与治疗建议

pub mod detector;
pub mod scoring;

pub use detector::{HttpLesionDetector, LesionDetector, DEFAULT_CONFIDENCE_THRESHOLD};
pub use scoring::{
    recommended_treatment, score_region, severity_for_score, RegionImages, ScoringEngine,
};
