//! 各公开/内部数据集在数据根目录下的位置.

use std::path::Path;

use mri_berry::consts::PROSTATE158_TRAINING_SET_LEN;
use mri_berry::dataset::{ArchiveLayout, ArchiveSource};

/// ProstateX 病例 ID 的公共子串, 用于从病例列表中区分 ProstateX 与 RUMC.
pub const PROSTATEX_PATTERN: &str = "ProstateX";

/// Prostate158 训练集.
pub fn prostate158(data_root: &Path) -> ArchiveSource {
    ArchiveSource::new(
        data_root,
        "public-datasets/prostate158/prostate158_train/train",
        ArchiveLayout::Prostate158,
    )
    .with_expected_len(PROSTATE158_TRAINING_SET_LEN)
}

/// ProstateX, 只收集 `subjects` 中的病例.
pub fn prostatex(data_root: &Path, subjects: Vec<String>) -> ArchiveSource {
    ArchiveSource::new(
        data_root,
        "public-datasets/prostateX/images",
        ArchiveLayout::PatientStudy {
            annotations_dir: "public-datasets/prostateX/annotations/granular-delineations-TZPZ"
                .into(),
        },
    )
    .with_subject_list(subjects)
}

/// RUMC, 只收集 `subjects` 中的病例.
pub fn rumc(data_root: &Path, subjects: Vec<String>) -> ArchiveSource {
    ArchiveSource::new(
        data_root,
        "rumc/images",
        ArchiveLayout::PatientStudy {
            annotations_dir: "rumc/annotations/zonal-segmentations/granular-delineations-TZPZ"
                .into(),
        },
    )
    .with_subject_list(subjects)
}

/// PI-CAI 公开训练集, 无标注.
pub fn picai(data_root: &Path) -> ArchiveSource {
    ArchiveSource::new(
        data_root,
        "picai/public_training/images",
        ArchiveLayout::PatientStudyUnannotated,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mri_berry::dataset::CollectArchive;

    #[test]
    fn test_archive_dirs() {
        let root = Path::new("/data/prostate-MRI");
        assert_eq!(
            prostate158(root).archive_dir(),
            root.join("public-datasets/prostate158/prostate158_train/train")
        );
        assert_eq!(rumc(root, vec![]).archive_dir(), root.join("rumc/images"));
        assert_eq!(
            picai(root).archive_dir(),
            root.join("picai/public_training/images")
        );
    }

    #[test]
    fn test_item_paths_resolve_against_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let case = root.join("picai/public_training/images/10000");
        std::fs::create_dir_all(&case).unwrap();
        for m in ["t2w", "adc", "hbv"] {
            std::fs::write(case.join(format!("10000_1000000_{m}.mha")), b"").unwrap();
        }

        let items = picai(root).collect().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].scan_paths[0],
            Path::new("picai/public_training/images/10000/10000_1000000_t2w.mha")
        );
        assert!(items[0].scan_paths.iter().all(|p| root.join(p).is_file()));
    }
}
