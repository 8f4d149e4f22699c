//! 原始影像归档扫描.
//!
//! 在一个数据根目录下, 按归档的目录布局找出每个检查的扫描文件和标注文件,
//! 生成 [`ArchiveItem`] 列表. 所有路径都相对于数据根目录.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// 归档扫描错误.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// 无法读取目录.
    #[error("cannot read archive directory `{}`: {source}", .path.display())]
    Io {
        /// 出错的目录.
        path: PathBuf,
        /// 原始错误.
        source: std::io::Error,
    },

    /// 没有找到任何完整病例.
    #[error("did not find any sample in `{}`, aborting", .0.display())]
    EmptyArchive(PathBuf),

    /// 病例数与期望不一致.
    #[error("dataset `{}` should have {expected} cases, found {found}", .path.display())]
    CountMismatch {
        /// 归档影像目录.
        path: PathBuf,
        /// 期望病例数.
        expected: usize,
        /// 实际病例数.
        found: usize,
    },
}

/// 一个检查 (病例) 的扫描与标注.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveItem {
    /// 病人 ID.
    pub patient_id: String,

    /// 检查 ID.
    pub study_id: String,

    /// 扫描路径, 按 T2W, ADC, HBV 顺序排列.
    pub scan_paths: Vec<PathBuf>,

    /// 标注路径. 用于推理的归档没有标注.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_path: Option<PathBuf>,
}

impl ArchiveItem {
    /// 获取 `{patient_id}_{study_id}` 形式的病例 ID.
    #[inline]
    pub fn subject_id(&self) -> String {
        format!("{}_{}", self.patient_id, self.study_id)
    }
}

/// 归档目录布局.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveLayout {
    /// Prostate158: `{images_dir}/{study}/{t2,adc,dwi}.nii.gz`,
    /// 标注为该目录下文件名以 `t2_anatomy_reader` 开头的第一个文件.
    /// 病人 ID 与检查 ID 都是目录名.
    Prostate158,

    /// ProstateX / RUMC: `{images_dir}/{patient}/{patient}_{study}_{t2w,adc,hbv}.mha`,
    /// 标注为 `{annotations_dir}/{patient}_{study}.nii.gz`.
    PatientStudy {
        /// 标注目录, 相对于数据根目录.
        annotations_dir: PathBuf,
    },

    /// PI-CAI: 目录结构与 [`ArchiveLayout::PatientStudy`] 相同, 但没有标注.
    PatientStudyUnannotated,
}

impl ArchiveLayout {
    /// 各模态的文件名 (或文件名后缀), 按模型通道顺序排列.
    #[inline]
    pub const fn modalities(&self) -> [&'static str; 3] {
        match self {
            Self::Prostate158 => ["t2", "adc", "dwi"],
            Self::PatientStudy { .. } | Self::PatientStudyUnannotated => ["t2w", "adc", "hbv"],
        }
    }
}

/// 被跳过的病例.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCase {
    /// 病例 ID, 或无法解析的文件名.
    pub subject_id: String,

    /// 跳过原因.
    pub reason: SkipReason,
}

/// 病例被跳过的原因.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// 缺少标注. 参数为期望的标注路径, 相对于数据根目录 (Prostate158 为检查目录).
    MissingAnnotation(PathBuf),

    /// 缺少扫描. 参数为缺失的扫描路径.
    MissingScans(Vec<PathBuf>),

    /// 文件名不是 `{patient}_{study}_{modality}.mha` 形式.
    MalformedName,
}

impl fmt::Display for SkippedCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            SkipReason::MissingAnnotation(p) => {
                write!(f, "Annotation for {} not found! At {}", self.subject_id, p.display())
            }
            SkipReason::MissingScans(paths) => write!(
                f,
                "Scans for {} not found: {}",
                self.subject_id,
                paths.iter().map(|p| p.display()).join(", ")
            ),
            SkipReason::MalformedName => {
                write!(f, "Cannot derive patient and study ID from `{}`", self.subject_id)
            }
        }
    }
}

/// 一次扫描的结果.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// 完整病例.
    pub items: Vec<ArchiveItem>,

    /// 被跳过的病例.
    pub skipped: Vec<SkippedCase>,
}

/// 可以产生病例列表的归档. 多个归档的结果按顺序拼接为一份设置文件.
pub trait CollectArchive {
    /// 收集病例.
    fn collect(&self) -> Result<Vec<ArchiveItem>, ArchiveError>;
}

impl<F> CollectArchive for F
where
    F: Fn() -> Result<Vec<ArchiveItem>, ArchiveError>,
{
    #[inline]
    fn collect(&self) -> Result<Vec<ArchiveItem>, ArchiveError> {
        self()
    }
}

/// 位于数据根目录下的一个归档.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    data_root: PathBuf,
    images_dir: PathBuf,
    layout: ArchiveLayout,
    subject_list: Option<BTreeSet<String>>,
    expected_len: Option<usize>,
}

impl ArchiveSource {
    /// 创建归档. `images_dir` 相对于 `data_root`.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        data_root: P,
        images_dir: Q,
        layout: ArchiveLayout,
    ) -> Self {
        Self {
            data_root: data_root.as_ref().to_owned(),
            images_dir: images_dir.as_ref().to_owned(),
            layout,
            subject_list: None,
            expected_len: None,
        }
    }

    /// 只收集 `subjects` 中列出的病例. 最终病例数必须与列表长度一致.
    ///
    /// 只对 `{patient}_{study}` 形式的布局有效.
    pub fn with_subject_list<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subject_list = Some(subjects.into_iter().map(Into::into).collect());
        self
    }

    /// 要求最终病例数恰好为 `n`.
    #[inline]
    pub fn with_expected_len(mut self, n: usize) -> Self {
        self.expected_len = Some(n);
        self
    }

    /// 获取归档影像目录的绝对路径.
    #[inline]
    pub fn archive_dir(&self) -> PathBuf {
        self.data_root.join(&self.images_dir)
    }

    /// 扫描归档.
    ///
    /// # 返回值
    ///
    /// 1. 影像目录不可读时返回 `Err(ArchiveError::Io)`.
    /// 2. 没有任何完整病例时返回 `Err(ArchiveError::EmptyArchive)`.
    /// 3. 病例数与病例列表长度或期望病例数不一致时返回 `Err(ArchiveError::CountMismatch)`.
    pub fn scan(&self) -> Result<ScanOutcome, ArchiveError> {
        let archive_dir = self.archive_dir();
        if let Some(list) = &self.subject_list {
            info!("Collecting {} cases", list.len());
        }

        let mut outcome = ScanOutcome::default();
        for entry in sorted_entries(&archive_dir)? {
            if !archive_dir.join(&entry).is_dir() {
                continue;
            }
            match &self.layout {
                ArchiveLayout::Prostate158 => self.scan_study_dir(&entry, &mut outcome)?,
                ArchiveLayout::PatientStudy { annotations_dir } => {
                    self.scan_patient_dir(&entry, Some(annotations_dir), &mut outcome)?
                }
                ArchiveLayout::PatientStudyUnannotated => {
                    self.scan_patient_dir(&entry, None, &mut outcome)?
                }
            }
        }

        let found = outcome.items.len();
        if found == 0 {
            return Err(ArchiveError::EmptyArchive(archive_dir));
        }
        let expected = self
            .subject_list
            .as_ref()
            .map(BTreeSet::len)
            .or(self.expected_len);
        if let Some(expected) = expected {
            if expected != found {
                return Err(ArchiveError::CountMismatch {
                    path: archive_dir,
                    expected,
                    found,
                });
            }
        }
        Ok(outcome)
    }

    /// `{images_dir}/{study}/` 布局.
    fn scan_study_dir(&self, study: &str, outcome: &mut ScanOutcome) -> Result<(), ArchiveError> {
        let study_dir = self.images_dir.join(study);
        let scan_paths: Vec<PathBuf> = self
            .layout
            .modalities()
            .iter()
            .map(|m| study_dir.join(format!("{m}.nii.gz")))
            .collect();

        let annotation = sorted_entries(&self.data_root.join(&study_dir))?
            .into_iter()
            .find(|name| name.starts_with("t2_anatomy_reader"));
        let Some(annotation) = annotation else {
            outcome.skipped.push(SkippedCase {
                subject_id: study.to_string(),
                reason: SkipReason::MissingAnnotation(study_dir),
            });
            return Ok(());
        };

        self.push_if_complete(
            study.to_string(),
            study.to_string(),
            scan_paths,
            Some(study_dir.join(annotation)),
            outcome,
        );
        Ok(())
    }

    /// `{images_dir}/{patient}/{patient}_{study}_{modality}.mha` 布局.
    fn scan_patient_dir(
        &self,
        patient: &str,
        annotations_dir: Option<&PathBuf>,
        outcome: &mut ScanOutcome,
    ) -> Result<(), ArchiveError> {
        let patient_dir = self.images_dir.join(patient);
        let subject_ids: Vec<String> = sorted_entries(&self.data_root.join(&patient_dir))?
            .into_iter()
            .filter(|name| name.contains(".mha") && !name.contains("._"))
            .map(|name| name.replace(".mha", "").split('_').take(2).join("_"))
            .sorted()
            .dedup()
            .collect();

        for subject_id in subject_ids {
            if let Some(list) = &self.subject_list {
                if !list.contains(&subject_id) {
                    continue;
                }
            }

            let Some((patient_id, study_id)) = subject_id
                .split_once('_')
                .filter(|(p, s)| !p.is_empty() && !s.is_empty())
            else {
                outcome.skipped.push(SkippedCase {
                    subject_id: subject_id.clone(),
                    reason: SkipReason::MalformedName,
                });
                continue;
            };
            let (patient_id, study_id) = (patient_id.to_string(), study_id.to_string());

            let scan_paths: Vec<PathBuf> = self
                .layout
                .modalities()
                .iter()
                .map(|m| patient_dir.join(format!("{subject_id}_{m}.mha")))
                .collect();

            let annotation_path = match annotations_dir {
                Some(dir) => {
                    let path = dir.join(format!("{subject_id}.nii.gz"));
                    if !self.data_root.join(&path).exists() {
                        outcome.skipped.push(SkippedCase {
                            subject_id,
                            reason: SkipReason::MissingAnnotation(path),
                        });
                        continue;
                    }
                    Some(path)
                }
                None => None,
            };

            self.push_if_complete(patient_id, study_id, scan_paths, annotation_path, outcome);
        }
        Ok(())
    }

    fn push_if_complete(
        &self,
        patient_id: String,
        study_id: String,
        scan_paths: Vec<PathBuf>,
        annotation_path: Option<PathBuf>,
        outcome: &mut ScanOutcome,
    ) {
        let missing: Vec<PathBuf> = scan_paths
            .iter()
            .filter(|p| !self.data_root.join(p).exists())
            .cloned()
            .collect();
        if missing.is_empty() {
            outcome.items.push(ArchiveItem {
                patient_id,
                study_id,
                scan_paths,
                annotation_path,
            });
        } else {
            let subject_id = if patient_id == study_id {
                patient_id
            } else {
                format!("{patient_id}_{study_id}")
            };
            outcome.skipped.push(SkippedCase {
                subject_id,
                reason: SkipReason::MissingScans(missing),
            });
        }
    }
}

impl CollectArchive for ArchiveSource {
    fn collect(&self) -> Result<Vec<ArchiveItem>, ArchiveError> {
        let outcome = self.scan()?;
        for case in outcome.skipped.iter() {
            warn!("{case}");
        }
        info!(
            "Collected {} cases from {}",
            outcome.items.len(),
            self.archive_dir().display()
        );
        Ok(outcome.items)
    }
}

/// 按字节序排序的目录项名称.
fn sorted_entries(dir: &Path) -> Result<Vec<String>, ArchiveError> {
    let err = |source: std::io::Error| ArchiveError::Io {
        path: dir.to_owned(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(err)? {
        let entry = entry.map_err(err)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort_unstable();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"").unwrap();
    }

    #[test]
    fn test_compound_names_require_all_modalities() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for f in ["A_1_t2w.mha", "A_1_adc.mha", "A_1_hbv.mha", "A_2_t2w.mha", "A_2_adc.mha"] {
            touch(root, &format!("images/A/{f}"));
        }
        touch(root, "images/A/._A_3_t2w.mha");
        touch(root, "images/README.md");

        let outcome = ArchiveSource::new(root, "images", ArchiveLayout::PatientStudyUnannotated)
            .scan()
            .unwrap();
        assert_eq!(outcome.items.len(), 1);
        let item = &outcome.items[0];
        assert_eq!(item.subject_id(), "A_1");
        assert_eq!(
            item.scan_paths,
            vec![
                PathBuf::from("images/A/A_1_t2w.mha"),
                PathBuf::from("images/A/A_1_adc.mha"),
                PathBuf::from("images/A/A_1_hbv.mha"),
            ]
        );
        assert_eq!(item.annotation_path, None);
        assert_eq!(
            outcome.skipped,
            vec![SkippedCase {
                subject_id: "A_2".into(),
                reason: SkipReason::MissingScans(vec![PathBuf::from("images/A/A_2_hbv.mha")]),
            }]
        );
    }

    #[test]
    fn test_missing_annotation_is_a_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for s in ["10000_1000000", "10001_1000001"] {
            for m in ["t2w", "adc", "hbv"] {
                touch(root, &format!("images/{}/{s}_{m}.mha", &s[..5]));
            }
        }
        touch(root, "annotations/10001_1000001.nii.gz");

        let layout = ArchiveLayout::PatientStudy {
            annotations_dir: "annotations".into(),
        };
        let outcome = ArchiveSource::new(root, "images", layout.clone()).scan().unwrap();
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].patient_id, "10001");
        assert_eq!(outcome.items[0].study_id, "1000001");
        assert_eq!(
            outcome.items[0].annotation_path,
            Some(PathBuf::from("annotations/10001_1000001.nii.gz"))
        );
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].subject_id, "10000_1000000");
        assert_eq!(
            outcome.skipped[0].reason,
            SkipReason::MissingAnnotation(PathBuf::from("annotations/10000_1000000.nii.gz"))
        );

        // 病例列表要求的病例不完整时整体失败.
        let res = ArchiveSource::new(root, "images", layout)
            .with_subject_list(["10000_1000000", "10001_1000001"])
            .scan();
        assert!(matches!(
            res,
            Err(ArchiveError::CountMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_prostate158_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for f in [
            "t2.nii.gz",
            "adc.nii.gz",
            "dwi.nii.gz",
            "t2_anatomy_reader2.nii.gz",
            "t2_anatomy_reader1.nii.gz",
        ] {
            touch(root, &format!("train/020/{f}"));
        }
        for f in ["t2.nii.gz", "adc.nii.gz", "dwi.nii.gz"] {
            touch(root, &format!("train/021/{f}"));
        }

        let source = ArchiveSource::new(root, "train", ArchiveLayout::Prostate158);
        let outcome = source.scan().unwrap();
        assert_eq!(outcome.items.len(), 1);
        let item = &outcome.items[0];
        assert_eq!((item.patient_id.as_str(), item.study_id.as_str()), ("020", "020"));
        assert_eq!(
            item.annotation_path,
            Some(PathBuf::from("train/020/t2_anatomy_reader1.nii.gz"))
        );
        assert_eq!(item.scan_paths[2], PathBuf::from("train/020/dwi.nii.gz"));
        assert_eq!(outcome.skipped[0].subject_id, "021");
        assert_eq!(
            outcome.skipped[0].reason,
            SkipReason::MissingAnnotation(PathBuf::from("train/021"))
        );

        assert!(matches!(
            source.with_expected_len(139).scan(),
            Err(ArchiveError::CountMismatch { expected: 139, .. })
        ));
    }

    #[test]
    fn test_empty_and_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("images")).unwrap();
        let source =
            ArchiveSource::new(dir.path(), "images", ArchiveLayout::PatientStudyUnannotated);
        assert!(matches!(source.scan(), Err(ArchiveError::EmptyArchive(_))));

        let source = ArchiveSource::new(dir.path(), "nope", ArchiveLayout::Prostate158);
        assert!(matches!(source.collect(), Err(ArchiveError::Io { .. })));
    }

    #[test]
    fn test_item_json_omits_missing_annotation() {
        let item = ArchiveItem {
            patient_id: "10000".into(),
            study_id: "1000000".into(),
            scan_paths: vec!["a/10000_1000000_t2w.mha".into()],
            annotation_path: None,
        };
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"patient_id":"10000","study_id":"1000000","#,
                r#""scan_paths":["a/10000_1000000_t2w.mha"]}"#
            )
        );
        assert_eq!(serde_json::from_str::<ArchiveItem>(&json).unwrap(), item);
    }
}
