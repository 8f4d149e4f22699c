//! 前列腺全腺体分割推理流程.
//!
//! 输入校验 -> 预处理 -> `nnUNet_predict` -> 重采样回参考扫描网格 -> 原子写入.
//! 任何一步失败都会中止整个流程, 不做重试.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::consts::{Sequence, OUTPUT_DIR_NAME, OUTPUT_FILE_NAME};
use crate::inference::{InferenceEngine, InferenceError, PredictParams};
use crate::io::{self, ImageError};
use crate::preprocess::{
    resample_to_reference, Interpolation, PreprocessError, PreprocessingSettings, Sample,
};
use crate::MriLabel;

pub mod request;

pub use request::{InferenceRequest, ValidationError};

/// 推理程序输出的分割结果文件名.
const PREDICTION_FILE_NAME: &str = "scan.nii.gz";

/// 推理流程错误.
#[derive(Debug, thiserror::Error)]
pub enum AlgorithmError {
    /// 输入不合法.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// 读写图像失败.
    #[error(transparent)]
    Image(#[from] ImageError),

    /// 预处理失败.
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    /// 推理失败.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// 无法创建目录.
    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        /// 出错的路径.
        path: PathBuf,
        /// 原始错误.
        source: std::io::Error,
    },
}

/// 推理流程的全部路径与推理参数.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmConfig {
    /// 各序列的输入目录, 按模型通道顺序排列.
    pub input_dirs: Vec<PathBuf>,

    /// 分割结果的输出路径.
    pub output_path: PathBuf,

    /// 推理程序的输入目录.
    pub nnunet_input_dir: PathBuf,

    /// 推理程序的输出目录.
    pub nnunet_output_dir: PathBuf,

    /// 模型权重目录.
    pub results_dir: PathBuf,

    /// 参与集成的 folds.
    pub folds: Vec<u32>,

    /// checkpoint 名.
    pub checkpoint: Option<String>,

    /// 是否同时输出概率图.
    pub store_probability_maps: bool,

    /// 是否关闭测试时增强.
    pub disable_augmentation: bool,

    /// 是否关闭滑窗重叠.
    pub disable_patch_overlap: bool,
}

impl Default for AlgorithmConfig {
    /// 推理容器中的默认路径.
    fn default() -> Self {
        Self::with_roots("/input", "/output", "/opt/algorithm")
    }
}

impl AlgorithmConfig {
    /// 由输入根目录, 输出根目录和算法根目录构造:
    ///
    /// ```text
    /// {input_root}/images/transverse-{t2,adc,hbv}-prostate-mri/
    /// {output_root}/images/transverse-whole-prostate-mri/prostate_gland.mha
    /// {algorithm_root}/nnunet/{input,output}/
    /// {algorithm_root}/results/
    /// ```
    pub fn with_roots<P, Q, R>(input_root: P, output_root: Q, algorithm_root: R) -> Self
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        let images = input_root.as_ref().join("images");
        let alg = algorithm_root.as_ref();
        let params = PredictParams::new("", "", "");
        Self {
            input_dirs: Sequence::ALL
                .iter()
                .map(|s| images.join(s.input_dir_name()))
                .collect(),
            output_path: output_root
                .as_ref()
                .join("images")
                .join(OUTPUT_DIR_NAME)
                .join(OUTPUT_FILE_NAME),
            nnunet_input_dir: alg.join("nnunet").join("input"),
            nnunet_output_dir: alg.join("nnunet").join("output"),
            results_dir: alg.join("results"),
            folds: params.folds,
            checkpoint: params.checkpoint,
            store_probability_maps: params.store_probability_maps,
            disable_augmentation: params.disable_augmentation,
            disable_patch_overlap: params.disable_patch_overlap,
        }
    }

    /// 本次推理的参数.
    pub fn predict_params(&self) -> PredictParams {
        let mut params = PredictParams::new(
            &self.nnunet_input_dir,
            &self.nnunet_output_dir,
            &self.results_dir,
        );
        params.folds = self.folds.clone();
        params.checkpoint = self.checkpoint.clone();
        params.store_probability_maps = self.store_probability_maps;
        params.disable_augmentation = self.disable_augmentation;
        params.disable_patch_overlap = self.disable_patch_overlap;
        params
    }
}

/// 前列腺全腺体分割算法.
#[derive(Debug)]
pub struct ProstateSegmentationAlgorithm<E> {
    config: AlgorithmConfig,
    request: InferenceRequest,
    engine: E,
}

impl<E: InferenceEngine> ProstateSegmentationAlgorithm<E> {
    /// 校验输入, 然后创建输出目录与推理程序的工作目录.
    ///
    /// 校验失败时不会创建任何目录.
    pub fn new(config: AlgorithmConfig, engine: E) -> Result<Self, AlgorithmError> {
        let request = InferenceRequest::new(&config.input_dirs, &config.output_path)?;
        for (i, scan) in request.scan_paths().iter().enumerate() {
            info!("Input scan {i}: {}", scan.display());
        }

        let output_dir = config.output_path.parent().map(Path::to_owned);
        for dir in output_dir
            .iter()
            .chain([&config.nnunet_input_dir, &config.nnunet_output_dir])
        {
            fs::create_dir_all(dir).map_err(|source| AlgorithmError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            config,
            request,
            engine,
        })
    }

    /// 获取配置.
    #[inline]
    pub fn config(&self) -> &AlgorithmConfig {
        &self.config
    }

    /// 获取推理请求.
    #[inline]
    pub fn request(&self) -> &InferenceRequest {
        &self.request
    }

    /// 读取输入扫描, 中心裁剪到前列腺区域, 写入推理程序的输入目录.
    ///
    /// 返回写出的文件路径, 按模型通道顺序排列.
    pub fn preprocess_input(&self) -> Result<Vec<PathBuf>, AlgorithmError> {
        let scans = self
            .request
            .scan_paths()
            .iter()
            .map(io::read_scan)
            .collect::<Result<Vec<_>, _>>()?;

        let mut sample = Sample::new(scans, None, PreprocessingSettings::prostate_crop())?;
        sample.preprocess();
        let (scans, _) = sample.into_parts();

        let mut paths = Vec::with_capacity(scans.len());
        for (i, scan) in scans.iter().enumerate() {
            let path = self.config.nnunet_input_dir.join(format!("scan_{i:04}.nii.gz"));
            io::write_image_atomic(scan, &path)?;
            paths.push(path);
        }
        info!(
            "Preprocessed {} scan(s) to shape {:?}",
            paths.len(),
            scans.first().map(|s| s.shape())
        );
        Ok(paths)
    }

    /// 调用推理程序. 阻塞直到推理结束.
    pub fn predict(&self) -> Result<(), AlgorithmError> {
        self.engine.predict(&self.config.predict_params())?;
        Ok(())
    }

    /// 读取推理结果, 重采样回参考扫描的网格, 并清空元数据.
    pub fn postprocess(&self) -> Result<MriLabel, AlgorithmError> {
        let prediction =
            io::read_label(self.config.nnunet_output_dir.join(PREDICTION_FILE_NAME))?;
        let reference = match self.request.reference_scan() {
            Some(path) => io::read_scan(path)?,
            None => return Ok(prediction),
        };
        let mut label = resample_to_reference(&prediction, &reference, Interpolation::Nearest, 0);
        label.strip_metadata();
        Ok(label)
    }

    /// 执行完整的推理流程, 将结果原子写入输出路径.
    pub fn process(&self) -> Result<(), AlgorithmError> {
        self.preprocess_input()?;
        self.predict()?;
        let label = self.postprocess()?;
        io::write_image_atomic(&label, self.request.output_path())?;
        info!(
            "Saved prostate gland segmentation ({} voxels) to {}",
            label.count(crate::consts::label::PROSTATE_GLAND),
            self.request.output_path().display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::IDENTITY;
    use crate::{Geometry, MriScan};
    use itertools::Itertools;
    use ndarray::Array3;
    use std::cell::Cell;

    /// 阈值分割, 代替 nnU-Net.
    #[derive(Debug, Default)]
    struct ThresholdEngine {
        calls: Cell<usize>,
    }

    impl InferenceEngine for ThresholdEngine {
        fn predict(&self, params: &PredictParams) -> Result<(), InferenceError> {
            self.calls.set(self.calls.get() + 1);
            let t2 = io::read_scan(params.input_dir.join("scan_0000.nii.gz")).unwrap();
            let mut label = t2.filled_like(0u8);
            for (l, s) in label.data_mut().iter_mut().zip(t2.data().iter()) {
                *l = u8::from(*s > 50.0);
            }
            io::write_image(&label, params.output_dir.join(PREDICTION_FILE_NAME)).unwrap();
            Ok(())
        }
    }

    #[derive(Debug)]
    struct MissingEngine;

    impl InferenceEngine for MissingEngine {
        fn predict(&self, _: &PredictParams) -> Result<(), InferenceError> {
            Err(InferenceError::Spawn {
                program: "nnUNet_predict".into(),
                source: std::io::ErrorKind::NotFound.into(),
            })
        }
    }

    fn t2() -> MriScan {
        let g = Geometry::new([4.0, 4.0, 9.0], [-100.0, -80.0, 20.0], IDENTITY).unwrap();
        let mut data = Array3::<f32>::from_elem((12, 56, 60), 10.0);
        data.slice_mut(ndarray::s![4..8, 20..36, 20..40]).fill(100.0);
        MriScan::new(g, data)
            .with_metadata([("PatientID".to_string(), "10000".to_string())].into())
    }

    fn write_inputs(config: &AlgorithmConfig, with_adc: bool) {
        let t2 = t2();
        for (i, dir) in config.input_dirs.iter().enumerate() {
            fs::create_dir_all(dir).unwrap();
            if i == 1 && !with_adc {
                continue;
            }
            io::write_image(&t2, dir.join(format!("10000_1000000_{i}.mha"))).unwrap();
        }
    }

    fn config(root: &Path) -> AlgorithmConfig {
        AlgorithmConfig::with_roots(root.join("input"), root.join("output"), root.join("alg"))
    }

    #[test]
    fn test_default_paths() {
        let c = AlgorithmConfig::default();
        assert_eq!(
            c.input_dirs[1],
            Path::new("/input/images/transverse-adc-prostate-mri")
        );
        assert_eq!(
            c.output_path,
            Path::new("/output/images/transverse-whole-prostate-mri/prostate_gland.mha")
        );
        assert_eq!(c.nnunet_output_dir, Path::new("/opt/algorithm/nnunet/output"));

        let p = c.predict_params();
        assert_eq!(p.results_dir, Path::new("/opt/algorithm/results"));
        assert_eq!(p.folds, vec![0, 1, 2, 3, 4]);
        assert!(p.store_probability_maps);
    }

    #[test]
    fn test_end_to_end_with_threshold_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        write_inputs(&config, true);

        let engine = ThresholdEngine::default();
        let alg = ProstateSegmentationAlgorithm::new(config.clone(), &engine).unwrap();
        alg.process().unwrap();
        assert_eq!(engine.calls.get(), 1);

        let scratch: Vec<_> = fs::read_dir(&config.nnunet_input_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .sorted()
            .collect();
        assert_eq!(scratch, ["scan_0000.nii.gz", "scan_0001.nii.gz", "scan_0002.nii.gz"]);
        let cropped = io::read_scan(config.nnunet_input_dir.join("scan_0000.nii.gz")).unwrap();
        assert_eq!(cropped.shape(), (9, 48, 48));

        let out_dir = config.output_path.parent().unwrap();
        assert_eq!(fs::read_dir(out_dir).unwrap().count(), 1);
        let out = io::read_label(&config.output_path).unwrap();
        let t2 = t2();
        assert_eq!(out.shape(), t2.shape());
        assert_eq!(out.geometry(), t2.geometry());
        assert!(out.is_binary());
        assert_eq!(out.count(1), 4 * 16 * 20);
        assert_eq!(out[(5, 25, 30)], 1);
        assert_eq!(out[(0, 0, 0)], 0);
        assert!(out.metadata().is_empty());
    }

    #[test]
    fn test_missing_adc_fails_before_any_work() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        write_inputs(&config, false);

        let engine = ThresholdEngine::default();
        let err = ProstateSegmentationAlgorithm::new(config.clone(), &engine).unwrap_err();
        assert!(matches!(
            err,
            AlgorithmError::Validation(ValidationError::MissingSequence { ref name, .. })
                if name == "transverse-adc-prostate-mri"
        ));
        assert_eq!(engine.calls.get(), 0);
        assert!(!tmp.path().join("output").exists());
        assert!(!tmp.path().join("alg").exists());
    }

    #[test]
    fn test_inference_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        write_inputs(&config, true);

        let alg = ProstateSegmentationAlgorithm::new(config.clone(), MissingEngine).unwrap();
        assert!(matches!(
            alg.process(),
            Err(AlgorithmError::Inference(InferenceError::Spawn { .. }))
        ));
        assert!(!config.output_path.exists());
    }
}
