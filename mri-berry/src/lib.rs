#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供前列腺 bpMRI (T2W, ADC, HBV) 扫描的结构化信息, 基础 I/O 与预处理算法,
//! 以及 nnU-Net 全腺体分割模型的数据集整理和推理编排.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 体素数据一律按 `[z, y, x]` 组织 (与 `ndarray` 标准布局一致),
//!   而物理空间信息 (spacing, origin, direction) 按 `(x, y, z)` 组织, 并使用 ITK 的 LPS 约定.
//! 2. 分割模型本身 (`nnUNet_predict`) 是外部程序, 该 crate 只负责组织输入输出.
//!
//! # 模块概览
//!
//! ### 体素数据与空间信息 ✅
//!
//! [`Volume`] 与 [`Geometry`]. 实现位于 `mri-berry/src/data`.
//!
//! ### MetaImage / NIfTI 读写 ✅
//!
//! 1. `.mha` 格式由本 crate 自行解析, 支持 zlib 压缩;
//! 2. `.nii` / `.nii.gz` 格式借助 `nifti` crate, 在边界处进行 RAS <-> LPS 转换;
//! 3. 提供 "先写临时文件, 再重命名" 的原子写入.
//!
//! 实现位于 `mri-berry/src/io`.
//!
//! ### 预处理 ✅
//!
//! 物理尺寸中心裁剪/填充, 重采样到参考网格, 多序列对齐.
//!
//! 实现位于 `mri-berry/src/preprocess`.
//!
//! ### 数据集整理 ✅
//!
//! 1. 三种归档目录布局的扫描器;
//! 2. mha2nnunet settings 清单生成;
//! 3. nnU-Net raw data 格式转换.
//!
//! 实现位于 `mri-berry/src/dataset`.
//!
//! ### 推理编排 ✅
//!
//! 输入校验 -> 预处理 -> `nnUNet_predict` -> 重采样回原始空间 -> 原子写入.
//!
//! 实现位于 `mri-berry/src/inference` 与 `mri-berry/src/algorithm`.

/// 三维索引, 按 `(z, y, x)` 组织.
pub type Idx3d = (usize, usize, usize);

/// 三维物理向量, 按 `(x, y, z)` 组织, 以毫米为单位.
pub type Vec3 = [f64; 3];

/// 体素数据与空间信息.
mod data;

pub use data::geometry::{self, Geometry};
pub use data::{MriLabel, MriScan, Volume, Voxel};

pub mod consts;

pub mod io;

pub mod preprocess;

pub mod dataset;

pub mod inference;

pub mod algorithm;

pub mod prelude;
