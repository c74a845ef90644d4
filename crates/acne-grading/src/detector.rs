//! 病灶检测接口
//!
//! 推理模型作为外部服务存在，这里只定义调用约定和 HTTP 客户端。

use acne_core::{AcneError, BoundingBox, LesionDetection, LesionType, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// 默认置信度阈值，刻意偏低以减少漏检
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.01;

/// 病灶检测接口
#[async_trait]
pub trait LesionDetector: Send + Sync {
    /// 检测图像中的病灶
    async fn detect(&self, image: &[u8], confidence_threshold: f32) -> Result<Vec<LesionDetection>>;
}

/// 推理服务返回的单个检测
#[derive(Debug, Deserialize)]
struct RawDetection {
    label: String,
    confidence: f32,
    #[serde(default, rename = "box")]
    bbox: Option<[f32; 4]>,
}

/// 推理服务响应
#[derive(Debug, Deserialize)]
struct DetectionResponse {
    detections: Vec<RawDetection>,
}

impl From<RawDetection> for LesionDetection {
    fn from(raw: RawDetection) -> Self {
        LesionDetection {
            lesion_type: LesionType::from_label(&raw.label),
            confidence: raw.confidence,
            bbox: raw.bbox.map(|[x0, y0, x1, y1]| BoundingBox { x0, y0, x1, y1 }),
        }
    }
}

/// 通过 HTTP 调用推理服务的检测器
///
/// 客户端在首次检测时创建并复用，不随请求重建。
pub struct HttpLesionDetector {
    endpoint: String,
    timeout: Duration,
    client: OnceCell<reqwest::Client>,
}

impl HttpLesionDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
            client: OnceCell::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get_or_try_init(|| async {
                info!("Initializing lesion detector client for {}", self.endpoint);
                reqwest::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| AcneError::Detection(format!("模型客户端初始化失败: {}", e)))
            })
            .await
    }
}

#[async_trait]
impl LesionDetector for HttpLesionDetector {
    async fn detect(&self, image: &[u8], confidence_threshold: f32) -> Result<Vec<LesionDetection>> {
        let client = self.client().await?;
        let url = format!("{}/detect", self.endpoint);

        let response = client
            .post(&url)
            .query(&[("conf", confidence_threshold)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| AcneError::Detection(format!("模型不可用: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
            || status == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(AcneError::Detection(format!("图像无法识别: {}", status)));
        }
        if !status.is_success() {
            return Err(AcneError::Detection(format!("模型服务返回错误: {}", status)));
        }

        let body: DetectionResponse = response
            .json()
            .await
            .map_err(|e| AcneError::Detection(format!("模型响应解析失败: {}", e)))?;

        debug!("Detector returned {} detections", body.detections.len());
        Ok(body.detections.into_iter().map(LesionDetection::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detection_response() {
        let json = r#"{
            "detections": [
                {"label": "papules", "confidence": 0.42, "box": [1.0, 2.0, 30.0, 40.0]},
                {"label": "scar", "confidence": 0.9}
            ]
        }"#;
        let response: DetectionResponse = serde_json::from_str(json).unwrap();
        let detections: Vec<LesionDetection> = response
            .detections
            .into_iter()
            .map(LesionDetection::from)
            .collect();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].lesion_type, LesionType::Papules);
        assert_eq!(detections[0].bbox.unwrap().x1, 30.0);
        assert_eq!(detections[1].lesion_type, LesionType::Other);
        assert!(detections[1].bbox.is_none());
    }

    #[test]
    fn test_endpoint_normalized() {
        let detector = HttpLesionDetector::new("http://localhost:8000/", Duration::from_secs(5));
        assert_eq!(detector.endpoint(), "http://localhost:8000");
    }

    #[tokio::test]
    async fn test_unreachable_model_is_detection_error() {
        let detector = HttpLesionDetector::new("http://127.0.0.1:9", Duration::from_millis(200));
        let result = detector.detect(b"image", DEFAULT_CONFIDENCE_THRESHOLD).await;
        assert!(matches!(result, Err(AcneError::Detection(_))));
    }
}
