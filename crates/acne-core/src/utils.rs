//! 通用工具函数

use crate::models::{PatientId, PatientRecord, Severity};
use chrono::{DateTime, TimeZone};

/// 没有任何患者时的显示文本
pub const NO_PATIENT_DISPLAY: &str = "No Data Patient";

/// 最近患者的显示文本
pub fn latest_patient_display(latest: Option<PatientId>) -> String {
    match latest {
        Some(patient) => patient.display_name(),
        None => NO_PATIENT_DISPLAY.to_string(),
    }
}

/// 按远端记录格式生成患者记录，日期如 "Oct-19-2026"，时间如 "14:05 PM"
pub fn patient_record_at<Tz>(now: &DateTime<Tz>, severity: Severity) -> PatientRecord
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    PatientRecord {
        date: now.format("%b-%d-%Y").to_string(),
        time: now.format("%H:%M %p").to_string(),
        severity,
    }
}
