//! 分级工作流演示程序
//!
//! 在临时目录和内存存储上跑通完整流程：创建患者、提交区域图像、分析、确认归档、复诊重新评分

use acnegrade::core::{LesionDetection, LesionType, Region, Result};
use acnegrade::grading::{LesionDetector, ScoringEngine};
use acnegrade::integration::InMemoryRecordStore;
use acnegrade::storage::{BlurDetector, LocalImageStore, ObjectStoreArchive};
use acnegrade::workflow::{InMemoryLedgerStore, PatientRegistry, SeverityLedger, WorkflowEngine};
use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;

/// 按图像平均亮度给出病灶，代替真实推理服务
struct BrightnessDetector;

#[async_trait]
impl LesionDetector for BrightnessDetector {
    async fn detect(&self, image: &[u8], _confidence_threshold: f32) -> Result<Vec<LesionDetection>> {
        let gray = image::load_from_memory(image)
            .map_err(|e| acnegrade::core::AcneError::Detection(e.to_string()))?
            .to_luma8();
        let count = (gray.width() as u64 * gray.height() as u64).max(1);
        let mean = gray.pixels().map(|p| p.0[0] as u64).sum::<u64>() / count;

        let lesion = match mean {
            0..=63 => LesionType::Nodules,
            64..=127 => LesionType::Pustules,
            128..=191 => LesionType::Papules,
            _ => LesionType::Comedones,
        };
        Ok(vec![LesionDetection::new(lesion, 0.8)])
    }
}

fn sample_image(shade: u8) -> anyhow::Result<Vec<u8>> {
    let img = RgbImage::from_fn(64, 64, |x, y| {
        if (x / 2 + y / 2) % 2 == 0 {
            Rgb([shade, shade, shade])
        } else {
            Rgb([shade / 2, shade / 2, shade / 2])
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)?;
    Ok(buf)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt::init();

    let workdir = tempfile::tempdir()?;
    let records = Arc::new(InMemoryRecordStore::new());
    let engine = WorkflowEngine::new(
        Arc::new(LocalImageStore::new(workdir.path(), BlurDetector::default())),
        ScoringEngine::new(Arc::new(BrightnessDetector)),
        Arc::new(SeverityLedger::new(Arc::new(InMemoryLedgerStore::new()))),
        records,
        Arc::new(ObjectStoreArchive::in_memory("patients")),
        PatientRegistry::in_memory(0),
    );

    println!("痤疮分级工作流演示\n");
    println!("最近患者: {}", engine.latest_patient_display().await);

    // 1. 三位患者，图像亮度不同
    for shade in [240u8, 160, 60] {
        let patient = engine.create_patient().await?;
        for region in Region::ALL {
            let receipt = engine
                .submit_region_image(patient, region, &sample_image(shade)?, "png")
                .await?;
            if receipt.is_blurred {
                println!("  {} {} 图像模糊，建议重拍", patient, region);
            }
        }

        let result = engine.analyze(patient).await?;
        println!(
            "{}: 总分 {} -> {} ({})",
            patient, result.total_score, result.severity, result.recommended_treatment
        );

        let receipt = engine.finalize(patient, &result).await?;
        println!("  已归档 {} 个文件到 {}", receipt.archive.files.len(), receipt.archive.remote_folder);
    }

    println!("\n分级人数: {:?}", engine.severity_counts().await?);

    // 2. 复诊：第三位患者好转，只剩额头一张图像
    let patient = engine
        .latest_patient()
        .await
        .ok_or_else(|| anyhow::anyhow!("no patient created"))?;
    for region in [Region::LeftCheeks, Region::RightCheeks, Region::Nose, Region::Chin] {
        engine.remove_region_image(patient, region).await?;
    }
    engine
        .submit_region_image(patient, Region::Forehead, &sample_image(250)?, "png")
        .await?;
    let result = engine.analyze(patient).await?;
    let receipt = engine.finalize(patient, &result).await?;
    println!(
        "\n{} 复诊: {:?} -> {}",
        patient, receipt.ledger.previous, receipt.ledger.current
    );
    println!("分级人数: {:?}", receipt.ledger.counts);

    println!("\n患者记录:");
    for (patient, record) in engine.patient_records(None).await? {
        println!("  {} {} {} {}", patient, record.date, record.time, record.severity);
    }

    Ok(())
}
