//! 预处理: 统一一组 bpMRI 扫描 (及其标注) 的分辨率, 网格大小与空间信息.
//!
//! 处理流程 ([`Sample::preprocess`]):
//!
//! 1. 重采样到目标分辨率 (可选);
//! 2. 中心裁剪 / 填充到目标网格大小 (可选);
//! 3. 网格大小相同且只有亚体素差异的扫描直接复制第一个扫描的空间信息;
//! 4. 其余仍不一致的扫描与标注重采样到第一个扫描的网格上.
//!
//! 处理完成后所有扫描与标注位于同一网格.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Idx3d, MriLabel, MriScan, Vec3};

pub mod crop;
pub mod resample;

pub use crop::{crop_or_pad, crop_or_pad_physical, matrix_size_for};
pub use resample::{resample_to_grid, resample_to_reference, resample_to_spacing, Interpolation};

/// 判断两个网格是否一致时使用的容差.
const GRID_TOLERANCE: f64 = 1e-6;

/// 判断空间信息是否只有亚体素差异时, 分辨率与方向的容差.
const ALIGN_TOLERANCE: f64 = 1e-3;

/// 预处理错误.
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    /// 没有任何扫描.
    #[error("a sample needs at least one scan")]
    NoScans,

    /// 参数不合法.
    #[error("invalid preprocessing settings: {0}")]
    InvalidSettings(&'static str),
}

/// 预处理参数. 所有三维参数都按 `(z, y, x)` 组织.
///
/// 序列化时省略未设置的字段, 因此默认参数对应空 JSON 对象.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingSettings {
    /// 目标网格大小.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix_size: Option<[usize; 3]>,

    /// 目标分辨率, 以毫米为单位.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacing: Option<Vec3>,

    /// 目标物理尺寸, 以毫米为单位.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_size: Option<Vec3>,

    /// 只裁剪, 不填充.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub crop_only: bool,
}

impl PreprocessingSettings {
    /// 不做任何重采样和裁剪, 只对齐网格.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 推理前使用的前列腺裁剪参数: 81 x 192 x 192 毫米, 只裁剪.
    pub fn prostate_crop() -> Self {
        Self::new()
            .with_physical_size(crate::consts::PROSTATE_PHYSICAL_SIZE)
            .with_crop_only(true)
    }

    /// 设置目标网格大小.
    #[inline]
    pub fn with_matrix_size(mut self, matrix_size: [usize; 3]) -> Self {
        self.matrix_size = Some(matrix_size);
        self
    }

    /// 设置目标分辨率.
    #[inline]
    pub fn with_spacing(mut self, spacing: Vec3) -> Self {
        self.spacing = Some(spacing);
        self
    }

    /// 设置目标物理尺寸.
    #[inline]
    pub fn with_physical_size(mut self, physical_size: Vec3) -> Self {
        self.physical_size = Some(physical_size);
        self
    }

    /// 设置是否只裁剪.
    #[inline]
    pub fn with_crop_only(mut self, crop_only: bool) -> Self {
        self.crop_only = crop_only;
        self
    }

    /// 检查参数合法性.
    pub fn validate(&self) -> Result<(), PreprocessError> {
        let positive = |v: &Vec3| v.iter().all(|x| x.is_finite() && *x > 0.0);
        if self.spacing.as_ref().is_some_and(|s| !positive(s)) {
            return Err(PreprocessError::InvalidSettings("spacing must be positive"));
        }
        if self.physical_size.as_ref().is_some_and(|p| !positive(p)) {
            return Err(PreprocessError::InvalidSettings(
                "physical size must be positive",
            ));
        }
        if self.matrix_size.is_some_and(|m| m.contains(&0)) {
            return Err(PreprocessError::InvalidSettings(
                "matrix size must be non-zero",
            ));
        }
        Ok(())
    }

    /// 设置了物理尺寸但未设置网格大小时, 按 `spacing` 补全网格大小.
    fn resolve_matrix_size(&mut self, spacing: Vec3) {
        if self.matrix_size.is_none() {
            if let Some(physical_size) = self.physical_size {
                let (z, y, x) = matrix_size_for(physical_size, spacing);
                self.matrix_size = Some([z, y, x]);
            }
        }
    }
}

/// 一组同一检查的扫描, 以及可选的标注.
///
/// 第一个扫描是参考扫描, 预处理后其余扫描和标注都对齐到它的网格上.
#[derive(Debug, Clone)]
pub struct Sample {
    /// 扫描, 按模型通道顺序排列.
    pub scans: Vec<MriScan>,

    /// 标注.
    pub label: Option<MriLabel>,

    settings: PreprocessingSettings,
}

impl Sample {
    /// 创建样本. 只设置了物理尺寸时, 网格大小由目标分辨率 (未设置时为第一个扫描的分辨率) 换算.
    pub fn new(
        scans: Vec<MriScan>,
        label: Option<MriLabel>,
        mut settings: PreprocessingSettings,
    ) -> Result<Self, PreprocessError> {
        let first = scans.first().ok_or(PreprocessError::NoScans)?;
        settings.validate()?;
        let spacing = settings
            .spacing
            .unwrap_or_else(|| first.geometry().spacing_zyx());
        settings.resolve_matrix_size(spacing);
        Ok(Self {
            scans,
            label,
            settings,
        })
    }

    /// 获取 (补全后的) 预处理参数.
    #[inline]
    pub fn settings(&self) -> &PreprocessingSettings {
        &self.settings
    }

    /// 执行预处理.
    pub fn preprocess(&mut self) {
        if let Some(spacing) = self.settings.spacing {
            self.resample_spacing(spacing);
        }
        if self.settings.matrix_size.is_some() {
            self.centre_crop();
        }
        self.align_physical_metadata();
        self.resample_to_first_scan();
    }

    /// 消费自我, 获得扫描与标注.
    #[inline]
    pub fn into_parts(self) -> (Vec<MriScan>, Option<MriLabel>) {
        (self.scans, self.label)
    }

    fn resample_spacing(&mut self, spacing: Vec3) {
        debug!("Resampling {} scan(s) to spacing {spacing:?}", self.scans.len());
        for scan in self.scans.iter_mut() {
            *scan = resample_to_spacing(scan, spacing, Interpolation::Linear);
        }
        if let Some(label) = self.label.as_mut() {
            *label = resample_to_spacing(label, spacing, Interpolation::Nearest);
        }
    }

    fn centre_crop(&mut self) {
        let crop_only = self.settings.crop_only;
        match (self.settings.physical_size, self.settings.matrix_size) {
            // 物理尺寸优先: 每个图像按自身分辨率换算网格大小.
            (Some(physical_size), _) => {
                for scan in self.scans.iter_mut() {
                    *scan = crop_or_pad_physical(scan, physical_size, crop_only);
                }
                if let Some(label) = self.label.as_mut() {
                    *label = crop_or_pad_physical(label, physical_size, crop_only);
                }
            }
            (None, Some([z, y, x])) => {
                let shape: Idx3d = (z, y, x);
                for scan in self.scans.iter_mut() {
                    *scan = crop_or_pad(scan, shape, crop_only);
                }
                if let Some(label) = self.label.as_mut() {
                    *label = crop_or_pad(label, shape, crop_only);
                }
            }
            (None, None) => {}
        }
    }

    fn align_physical_metadata(&mut self) {
        let Some((first, rest)) = self.scans.split_first_mut() else {
            return;
        };
        let reference = first.geometry();
        for (i, scan) in rest.iter_mut().enumerate() {
            if scan.shape() == first.shape()
                && *scan.geometry() != *reference
                && scan.geometry().is_subvoxel_aligned(reference, ALIGN_TOLERANCE)
            {
                debug!("Copying reference geometry to scan {}", i + 1);
                scan.copy_information(first);
            }
        }
        if let Some(label) = self.label.as_mut() {
            if label.shape() == first.shape()
                && label.geometry().is_subvoxel_aligned(reference, ALIGN_TOLERANCE)
            {
                label.copy_information(first);
            }
        }
    }

    fn resample_to_first_scan(&mut self) {
        let Some((first, rest)) = self.scans.split_first_mut() else {
            return;
        };
        for (i, scan) in rest.iter_mut().enumerate() {
            if !scan.same_grid(first, GRID_TOLERANCE) {
                debug!("Resampling scan {} to the reference grid", i + 1);
                *scan = resample_to_reference(scan, first, Interpolation::Linear, 0.0);
            }
        }
        if let Some(label) = self.label.as_mut() {
            if !label.same_grid(first, GRID_TOLERANCE) {
                debug!("Resampling label to the reference grid");
                *label = resample_to_reference(label, first, Interpolation::Nearest, 0);
            }
        }
    }
}
