//! 核心数据模型定义

use crate::error::{AcneError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 患者显示名前缀
pub const PATIENT_NAME_PREFIX: &str = "Patient No. ";

/// 患者标识，按顺序分配的编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(u32);

impl PatientId {
    pub fn new(number: u32) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// 显示名，同时也是患者目录名，如 "Patient No. 7"
    pub fn display_name(&self) -> String {
        format!("{}{}", PATIENT_NAME_PREFIX, self.0)
    }

    /// 从显示名解析患者编号
    pub fn parse_display_name(name: &str) -> Option<Self> {
        name.strip_prefix(PATIENT_NAME_PREFIX)
            .and_then(|n| n.trim().parse::<u32>().ok())
            .map(Self)
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// 面部拍摄区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Region {
    Forehead,
    LeftCheeks,
    RightCheeks,
    Nose,
    Chin,
}

impl Region {
    /// 固定的遍历顺序，决定最高病灶类型的并列取舍
    pub const ALL: [Region; 5] = [
        Region::Forehead,
        Region::LeftCheeks,
        Region::RightCheeks,
        Region::Nose,
        Region::Chin,
    ];

    /// 区域权重
    pub fn weight(&self) -> u32 {
        match self {
            Region::Forehead | Region::LeftCheeks | Region::RightCheeks => 2,
            Region::Nose | Region::Chin => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Forehead => "Forehead",
            Region::LeftCheeks => "LeftCheeks",
            Region::RightCheeks => "RightCheeks",
            Region::Nose => "Nose",
            Region::Chin => "Chin",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = AcneError;

    fn from_str(s: &str) -> Result<Self> {
        Region::ALL
            .iter()
            .copied()
            .find(|region| region.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AcneError::Validation(format!("未知区域: {}", s)))
    }
}

/// 病灶类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LesionType {
    Comedones, // 粉刺
    Papules,   // 丘疹
    Pustules,  // 脓疱
    Nodules,   // 结节
    Other,     // 其他，不参与评分
}

impl LesionType {
    /// 临床分级，Other 没有分级
    pub fn grade(&self) -> Option<u32> {
        match self {
            LesionType::Comedones => Some(1),
            LesionType::Papules => Some(2),
            LesionType::Pustules => Some(3),
            LesionType::Nodules => Some(4),
            LesionType::Other => None,
        }
    }

    /// 由模型类别名映射，无法识别的类别归为 Other
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "comedones" => LesionType::Comedones,
            "papules" => LesionType::Papules,
            "pustules" => LesionType::Pustules,
            "nodules" => LesionType::Nodules,
            _ => LesionType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LesionType::Comedones => "comedones",
            LesionType::Papules => "papules",
            LesionType::Pustules => "pustules",
            LesionType::Nodules => "nodules",
            LesionType::Other => "other",
        }
    }
}

impl fmt::Display for LesionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 严重程度分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    None,
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::None,
        Severity::Mild,
        Severity::Moderate,
        Severity::Severe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "None",
            Severity::Mild => "Mild",
            Severity::Moderate => "Moderate",
            Severity::Severe => "Severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AcneError;

    fn from_str(s: &str) -> Result<Self> {
        Severity::ALL
            .iter()
            .copied()
            .find(|severity| severity.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AcneError::Validation(format!("未知严重程度: {}", s)))
    }
}

/// 支持的图像格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

    /// 解析客户端声明的图像类型，只接受 png/jpeg/jpg
    pub fn parse(image_type: &str) -> Result<Self> {
        match image_type.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            other => Err(AcneError::Validation(format!("不支持的图像类型: {}", other))),
        }
    }

    /// 文件扩展名
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// 检测框（像素坐标）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

/// 单个病灶检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LesionDetection {
    pub lesion_type: LesionType,
    pub confidence: f32,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl LesionDetection {
    pub fn new(lesion_type: LesionType, confidence: f32) -> Self {
        Self {
            lesion_type,
            confidence,
            bbox: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

/// 单个区域的评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionScore {
    pub region: Region,
    pub image_present: bool,
    /// 该区域最高分级的病灶类型
    pub highest_lesion: Option<LesionType>,
    /// 最高分级 × 区域权重
    pub score: u32,
    pub detections: Vec<LesionDetection>,
    /// 检测失败原因，失败区域计 0 分
    pub error: Option<String>,
}

impl RegionScore {
    pub fn absent(region: Region) -> Self {
        Self {
            region,
            image_present: false,
            highest_lesion: None,
            score: 0,
            detections: Vec::new(),
            error: None,
        }
    }
}

/// 一次分析的严重程度结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityResult {
    /// 分析编号，用于在确认时识别过期结果
    pub analysis_id: Uuid,
    pub patient: PatientId,
    pub region_scores: Vec<RegionScore>,
    pub total_score: u32,
    pub highest_lesion_type: Option<LesionType>,
    pub severity: Severity,
    pub recommended_treatment: String,
    /// 有区域检测失败时为 true
    pub partial: bool,
    pub failed_regions: Vec<Region>,
    pub analyzed_at: DateTime<Utc>,
}

impl SeverityResult {
    /// 指定区域的得分，未分析的区域为 0
    pub fn region_score(&self, region: Region) -> u32 {
        self.region_scores
            .iter()
            .find(|score| score.region == region)
            .map(|score| score.score)
            .unwrap_or(0)
    }
}

/// 患者就诊会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,        // 已创建
    Intake,         // 采集中，尚无图像
    ReadyToAnalyze, // 至少一张图像，可分析
    Analyzed,       // 已分析，结果未确认
    Finalized,      // 已确认并归档
}

/// 账本对账结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityLedgerEntry {
    pub patient: PatientId,
    pub previous: Option<Severity>,
    pub current: Severity,
    /// 对账后各分级的人数
    pub counts: BTreeMap<Severity, u64>,
}

/// 远端患者记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub date: String,
    pub time: String,
    pub severity: Severity,
}

/// 图像提交回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub accepted: bool,
    pub region: Region,
    /// 模糊提示，仅供参考，不阻止提交
    pub is_blurred: bool,
}

/// 各区域图像是否已采集
pub type IntakeStatus = BTreeMap<Region, bool>;
