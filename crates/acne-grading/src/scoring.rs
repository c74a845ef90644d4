//! 评分引擎
//!
//! 每个区域取最高病灶分级乘以区域权重，求和得到总分，再映射为严重程度和治疗建议。

use crate::detector::{LesionDetector, DEFAULT_CONFIDENCE_THRESHOLD};
use acne_core::{
    AcneError, LesionDetection, LesionType, PatientId, Region, RegionScore, Result, Severity,
    SeverityResult,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 区域图像，缺少的区域即未采集
pub type RegionImages = BTreeMap<Region, Vec<u8>>;

const TREATMENT_NONE: &str = "No treatment required";
const TREATMENT_MILD: &str = "Comedones: Topical Retinoids and Salicylic Acid; \
     Papules: Topical Retinoids +/- BPO or Antibiotic and Azelaic Acid";
const TREATMENT_MODERATE: &str = "Topical Retinoids +/- BPO or Azelaic Acid, Oral Antibiotics (ABO), \
     Hormonal Therapy, Isotretonic";
const TREATMENT_SEVERE: &str = "Oral Isotretonin, Topical Antibiotics + Topical Retinoids + BPO, \
     Hormonal Therapy + Topical Retinoids +/- BPO or Topical ABO";

/// 总分到严重程度：0 无，1-19 轻度，20-31 中度，32 及以上重度
pub fn severity_for_score(total_score: u32) -> Severity {
    match total_score {
        0 => Severity::None,
        1..=19 => Severity::Mild,
        20..=31 => Severity::Moderate,
        _ => Severity::Severe,
    }
}

/// 严重程度对应的治疗建议
pub fn recommended_treatment(severity: Severity) -> &'static str {
    match severity {
        Severity::None => TREATMENT_NONE,
        Severity::Mild => TREATMENT_MILD,
        Severity::Moderate => TREATMENT_MODERATE,
        Severity::Severe => TREATMENT_SEVERE,
    }
}

/// 区域得分与该区域最高分级的病灶类型
///
/// 同分时保留先出现的检测。
pub fn score_region(region: Region, detections: &[LesionDetection]) -> (u32, Option<LesionType>) {
    let mut highest: Option<(u32, LesionType)> = None;
    for detection in detections {
        if let Some(grade) = detection.lesion_type.grade() {
            if highest.map_or(true, |(best, _)| grade > best) {
                highest = Some((grade, detection.lesion_type));
            }
        }
    }

    match highest {
        Some((grade, lesion_type)) => (grade * region.weight(), Some(lesion_type)),
        None => (0, None),
    }
}

/// 评分引擎
pub struct ScoringEngine {
    detector: Arc<dyn LesionDetector>,
    confidence_threshold: f32,
    detection_timeout: Duration,
}

impl ScoringEngine {
    pub fn new(detector: Arc<dyn LesionDetector>) -> Self {
        Self {
            detector,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            detection_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_detection_timeout(mut self, timeout: Duration) -> Self {
        self.detection_timeout = timeout;
        self
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// 对单个区域运行检测，超时视为检测失败
    async fn detect_region(&self, region: Region, image: &[u8]) -> Result<Vec<LesionDetection>> {
        let detections = tokio::time::timeout(
            self.detection_timeout,
            self.detector.detect(image, self.confidence_threshold),
        )
        .await
        .map_err(|_| {
            AcneError::Detection(format!(
                "{} 区域检测超时 ({:?})",
                region, self.detection_timeout
            ))
        })??;

        Ok(detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .collect())
    }

    /// 分析患者的区域图像
    ///
    /// 检测失败的区域计 0 分，并在结果中标记为部分结果。
    pub async fn analyze(&self, patient: PatientId, images: &RegionImages) -> SeverityResult {
        let mut region_scores = Vec::with_capacity(Region::ALL.len());
        let mut failed_regions = Vec::new();
        let mut total_score = 0;
        let mut highest_lesion_type: Option<LesionType> = None;

        for region in Region::ALL {
            let Some(image) = images.get(&region) else {
                region_scores.push(RegionScore::absent(region));
                continue;
            };

            match self.detect_region(region, image).await {
                Ok(detections) => {
                    let (score, highest) = score_region(region, &detections);
                    debug!(
                        "{} {}: {} detections, highest {:?}, score {}",
                        patient,
                        region,
                        detections.len(),
                        highest,
                        score
                    );

                    if let Some(lesion) = highest {
                        let better = match highest_lesion_type.and_then(|h| h.grade()) {
                            Some(best) => lesion.grade().map_or(false, |g| g > best),
                            None => true,
                        };
                        if better {
                            highest_lesion_type = Some(lesion);
                        }
                    }

                    total_score += score;
                    region_scores.push(RegionScore {
                        region,
                        image_present: true,
                        highest_lesion: highest,
                        score,
                        detections,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("Lesion detection failed for {} {}: {}", patient, region, e);
                    failed_regions.push(region);
                    region_scores.push(RegionScore {
                        region,
                        image_present: true,
                        highest_lesion: None,
                        score: 0,
                        detections: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let severity = severity_for_score(total_score);
        info!(
            "Analyzed {}: total score {}, severity {}{}",
            patient,
            total_score,
            severity,
            if failed_regions.is_empty() { "" } else { " (partial)" }
        );

        SeverityResult {
            analysis_id: Uuid::new_v4(),
            patient,
            region_scores,
            total_score,
            highest_lesion_type,
            severity,
            recommended_treatment: recommended_treatment(severity).to_string(),
            partial: !failed_regions.is_empty(),
            failed_regions,
            analyzed_at: Utc::now(),
        }
    }
}
