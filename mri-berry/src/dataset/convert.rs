//! 将 mha2nnunet 设置文件中的病例转换为 nnU-Net v1 原始数据目录.
//!
//! ```text
//! {output_dir}/{task}/
//! ├── imagesTr/{subject}_{channel:04}.nii.gz
//! ├── labelsTr/{subject}.nii.gz
//! ├── imagesTs/{subject}_{channel:04}.nii.gz   (无标注的病例)
//! └── dataset.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use super::archive::ArchiveItem;
use super::settings::Mha2nnUnetSettings;
use crate::io::{self, ImageError};
use crate::preprocess::{PreprocessError, Sample};
use crate::MriLabel;

/// 数据集转换错误.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// 读写图像失败.
    #[error("case {subject}: {source}")]
    Image {
        /// 病例 ID.
        subject: String,
        /// 原始错误.
        source: ImageError,
    },

    /// 预处理参数不合法.
    #[error("case {subject}: {source}")]
    Preprocess {
        /// 病例 ID.
        subject: String,
        /// 原始错误.
        source: PreprocessError,
    },

    /// 文件系统错误.
    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        /// 出错的路径.
        path: PathBuf,
        /// 原始错误.
        source: std::io::Error,
    },

    /// 无法序列化 `dataset.json`.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// 标注预处理函数.
pub type AnnotationPreprocess = fn(&mut MriLabel);

/// 将分区标注 (移行带, 外周带等) 合并为全腺体标注.
pub fn whole_gland_annotation(label: &mut MriLabel) {
    let n = label.binarize();
    debug!("Merged {n} zonal voxels into the whole gland");
}

/// 转换统计.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertReport {
    /// 新转换的病例数.
    pub converted: usize,

    /// 输出已存在而被跳过的病例数.
    pub skipped: usize,
}

/// mha2nnunet 转换器.
#[derive(Debug, Clone)]
pub struct Mha2nnUnetConverter {
    output_dir: PathBuf,
    scans_dir: PathBuf,
    annotations_dir: PathBuf,
    settings: Mha2nnUnetSettings,
    annotation_preprocess: AnnotationPreprocess,
}

/// 单个病例的输出路径.
struct CaseOutput {
    scans: Vec<PathBuf>,
    label: Option<PathBuf>,
}

impl CaseOutput {
    fn exists(&self) -> bool {
        self.scans.iter().chain(self.label.iter()).all(|p| p.exists())
    }
}

impl Mha2nnUnetConverter {
    /// 创建转换器. 扫描路径相对于 `scans_dir`, 标注路径相对于 `annotations_dir`.
    ///
    /// 默认的标注预处理为 [`whole_gland_annotation`].
    pub fn new<P, Q, R>(
        output_dir: P,
        scans_dir: Q,
        annotations_dir: R,
        settings: Mha2nnUnetSettings,
    ) -> Self
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        Self {
            output_dir: output_dir.as_ref().to_owned(),
            scans_dir: scans_dir.as_ref().to_owned(),
            annotations_dir: annotations_dir.as_ref().to_owned(),
            settings,
            annotation_preprocess: whole_gland_annotation,
        }
    }

    /// 替换标注预处理函数.
    #[inline]
    pub fn with_annotation_preprocess(mut self, f: AnnotationPreprocess) -> Self {
        self.annotation_preprocess = f;
        self
    }

    /// 获取任务目录 `{output_dir}/{task}`.
    #[inline]
    pub fn task_dir(&self) -> PathBuf {
        self.output_dir.join(&self.settings.dataset_json.task)
    }

    /// 获取 `dataset.json` 路径.
    #[inline]
    pub fn dataset_json_path(&self) -> PathBuf {
        self.task_dir().join("dataset.json")
    }

    fn case_output(&self, item: &ArchiveItem) -> CaseOutput {
        let task_dir = self.task_dir();
        let subject = item.subject_id();
        let images_dir = if item.annotation_path.is_some() {
            task_dir.join("imagesTr")
        } else {
            task_dir.join("imagesTs")
        };
        CaseOutput {
            scans: (0..item.scan_paths.len())
                .map(|i| images_dir.join(format!("{subject}_{i:04}.nii.gz")))
                .collect(),
            label: item
                .annotation_path
                .as_ref()
                .map(|_| task_dir.join("labelsTr").join(format!("{subject}.nii.gz"))),
        }
    }

    /// 转换全部病例. 输出文件已全部存在的病例会被跳过.
    pub fn convert(&self) -> Result<ConvertReport, ConvertError> {
        let mut report = ConvertReport::default();
        let total = self.settings.archive.len();
        for (i, item) in self.settings.archive.iter().enumerate() {
            let output = self.case_output(item);
            if output.exists() {
                debug!("Skipping {}, output exists", item.subject_id());
                report.skipped += 1;
                continue;
            }
            info!("[{}/{total}] Converting {}", i + 1, item.subject_id());
            self.convert_item(item, &output)?;
            report.converted += 1;
        }
        info!(
            "Converted {} cases, skipped {} existing cases.",
            report.converted, report.skipped
        );
        Ok(report)
    }

    fn convert_item(&self, item: &ArchiveItem, output: &CaseOutput) -> Result<(), ConvertError> {
        let subject = item.subject_id();
        let image_err = |source| ConvertError::Image {
            subject: subject.clone(),
            source,
        };

        let scans = item
            .scan_paths
            .iter()
            .map(|p| io::read_scan(self.scans_dir.join(p)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(image_err)?;
        let label = match &item.annotation_path {
            Some(p) => {
                let mut label = io::read_label(self.annotations_dir.join(p)).map_err(image_err)?;
                (self.annotation_preprocess)(&mut label);
                Some(label)
            }
            None => None,
        };

        let mut sample = Sample::new(scans, label, self.settings.preprocessing.clone())
            .map_err(|source| ConvertError::Preprocess {
                subject: subject.clone(),
                source,
            })?;
        sample.preprocess();
        let (scans, label) = sample.into_parts();

        for path in output.scans.iter().chain(output.label.iter()) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| ConvertError::Io {
                    path: parent.to_owned(),
                    source,
                })?;
            }
        }
        for (scan, path) in scans.iter().zip(output.scans.iter()) {
            io::write_image_atomic(scan, path).map_err(image_err)?;
        }
        if let (Some(label), Some(path)) = (label, output.label.as_ref()) {
            io::write_image_atomic(&label, path).map_err(image_err)?;
        }
        Ok(())
    }

    /// 按已转换的病例写 `dataset.json`.
    pub fn create_dataset_json(&self) -> Result<NnUnetDatasetJson, ConvertError> {
        let mut training = Vec::new();
        let mut test = Vec::new();
        for item in self.settings.archive.iter() {
            let output = self.case_output(item);
            if !output.exists() {
                continue;
            }
            let subject = item.subject_id();
            match output.label {
                Some(_) => training.push(TrainingCase {
                    image: format!("./imagesTr/{subject}.nii.gz"),
                    label: format!("./labelsTr/{subject}.nii.gz"),
                }),
                None => test.push(format!("./imagesTs/{subject}.nii.gz")),
            }
        }

        let d = &self.settings.dataset_json;
        let json = NnUnetDatasetJson {
            name: d.task.clone(),
            description: d.description.clone(),
            tensor_image_size: d.tensor_image_size.clone(),
            reference: d.reference.clone(),
            licence: d.licence.clone(),
            release: d.release.clone(),
            modality: d.modality.clone(),
            labels: d.labels.clone(),
            num_training: training.len(),
            num_test: test.len(),
            training,
            test,
        };

        let path = self.dataset_json_path();
        let io_err = |source: std::io::Error| ConvertError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(self.task_dir()).map_err(io_err)?;
        let text = serde_json::to_string_pretty(&json)?;
        fs::write(&path, text).map_err(io_err)?;
        info!(
            "Wrote {} with {} training and {} test cases",
            path.display(),
            json.num_training,
            json.num_test
        );
        Ok(json)
    }
}

/// nnU-Net v1 `dataset.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NnUnetDatasetJson {
    /// 任务名.
    pub name: String,
    /// 描述.
    pub description: String,
    /// 张量维度描述.
    #[serde(rename = "tensorImageSize")]
    pub tensor_image_size: String,
    /// 参考文献.
    pub reference: String,
    /// 许可证.
    pub licence: String,
    /// 版本.
    pub release: String,
    /// 通道索引到模态名.
    pub modality: std::collections::BTreeMap<String, String>,
    /// 标签值到标签名.
    pub labels: std::collections::BTreeMap<String, String>,
    /// 训练病例数.
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    /// 测试病例数.
    #[serde(rename = "numTest")]
    pub num_test: usize,
    /// 训练病例. 图像路径不含通道后缀.
    pub training: Vec<TrainingCase>,
    /// 测试病例.
    pub test: Vec<String>,
}

/// `dataset.json` 中的一个训练病例.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingCase {
    /// 图像路径.
    pub image: String,
    /// 标注路径.
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::settings::DatasetJson;
    use crate::io::{read_label, read_scan, write_image};
    use crate::preprocess::PreprocessingSettings;
    use crate::{Geometry, MriScan};
    use ndarray::Array3;

    fn write_case(root: &Path, patient: &str, study: &str, annotated: bool) -> ArchiveItem {
        let g = Geometry::with_spacing([0.5, 0.5, 3.0]).unwrap();
        let scan_paths: Vec<PathBuf> = ["t2w", "adc", "hbv"]
            .iter()
            .map(|m| PathBuf::from(format!("images/{patient}/{patient}_{study}_{m}.mha")))
            .collect();
        for (i, p) in scan_paths.iter().enumerate() {
            let path = root.join(p);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            let scan = MriScan::new(g, Array3::from_elem((2, 3, 4), i as f32));
            write_image(&scan, path).unwrap();
        }

        let annotation_path = annotated.then(|| {
            let rel = PathBuf::from(format!("annotations/{patient}_{study}.nii.gz"));
            let mut data = Array3::<u8>::zeros((2, 3, 4));
            data[(0, 1, 1)] = 1;
            data[(1, 1, 2)] = 2;
            let path = root.join(&rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            write_image(&MriLabel::new(g, data), path).unwrap();
            rel
        });

        ArchiveItem {
            patient_id: patient.into(),
            study_id: study.into(),
            scan_paths,
            annotation_path,
        }
    }

    #[test]
    fn test_convert_writes_nnunet_layout() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let settings = Mha2nnUnetSettings {
            dataset_json: DatasetJson::whole_gland(),
            preprocessing: PreprocessingSettings::default(),
            archive: vec![
                write_case(&data, "10000", "1000000", true),
                write_case(&data, "10001", "1000001", false),
            ],
        };
        let out = dir.path().join("nnUNet_raw_data");
        let converter = Mha2nnUnetConverter::new(&out, &data, &data, settings);

        let report = converter.convert().unwrap();
        assert_eq!(report, ConvertReport { converted: 2, skipped: 0 });

        let task = out.join("Task2202_prostate_segmentation");
        let adc = read_scan(task.join("imagesTr/10000_1000000_0001.nii.gz")).unwrap();
        assert_eq!(adc.shape(), (2, 3, 4));
        assert!(adc.data().iter().all(|v| *v == 1.0));
        assert!(task.join("imagesTs/10001_1000001_0002.nii.gz").is_file());

        let label = read_label(task.join("labelsTr/10000_1000000.nii.gz")).unwrap();
        assert!(label.is_binary());
        assert_eq!(label.count(1), 2);

        let json = converter.create_dataset_json().unwrap();
        assert_eq!((json.num_training, json.num_test), (1, 1));
        assert_eq!(json.training[0].image, "./imagesTr/10000_1000000.nii.gz");
        assert_eq!(json.test, vec!["./imagesTs/10001_1000001.nii.gz"]);
        let text = fs::read_to_string(converter.dataset_json_path()).unwrap();
        assert!(text.contains("\"numTraining\": 1"));
        assert!(text.contains("\"name\": \"Task2202_prostate_segmentation\""));

        // 再次转换时跳过已有输出.
        let report = converter.convert().unwrap();
        assert_eq!(report, ConvertReport { converted: 0, skipped: 2 });
    }

    #[test]
    fn test_missing_scan_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = write_case(dir.path(), "10000", "1000000", false);
        item.scan_paths[1] = "images/10000/missing.mha".into();
        let settings = Mha2nnUnetSettings {
            dataset_json: DatasetJson::whole_gland(),
            preprocessing: PreprocessingSettings::default(),
            archive: vec![item],
        };
        let converter =
            Mha2nnUnetConverter::new(dir.path().join("out"), dir.path(), dir.path(), settings);
        assert!(matches!(
            converter.convert(),
            Err(ConvertError::Image {
                subject,
                source: ImageError::Io { .. },
            }) if subject == "10000_1000000"
        ));
    }
}
