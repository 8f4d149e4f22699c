//! 数据根目录与工作目录.
//!
//! 1. 若命令行参数或环境变量 (`$inputdir`, `$workdir`) 非空, 则使用其值;
//! 2. 否则, 使用 `$HOME/dataset/prostate-MRI` 与 `$HOME/dataset/workdir`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use mri_berry::consts::TASK;
use mri_berry::dataset::home_dataset_dir_with;

/// 默认数据根目录.
pub fn input_dir_or_home(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match arg {
        Some(d) => Ok(d),
        None => home_dataset_dir_with(["prostate-MRI"]).context("cannot locate home directory"),
    }
}

/// 默认工作目录.
pub fn work_dir_or_home(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match arg {
        Some(d) => Ok(d),
        None => home_dataset_dir_with(["workdir"]).context("cannot locate home directory"),
    }
}

/// 训练集设置文件: `{workdir}/mha2nnunet_settings/{task}.json`.
pub fn training_settings_path(workdir: &Path) -> PathBuf {
    workdir
        .join("mha2nnunet_settings")
        .join(format!("{TASK}.json"))
}

/// PI-CAI 推理集设置文件: `{workdir}/mha2nnunet_settings/{task}_picai_inference.json`.
pub fn inference_settings_path(workdir: &Path) -> PathBuf {
    workdir
        .join("mha2nnunet_settings")
        .join(format!("{TASK}_picai_inference.json"))
}

/// nnU-Net 原始数据目录: `{workdir}/nnUNet_raw_data`.
pub fn raw_data_dir(workdir: &Path) -> PathBuf {
    workdir.join("nnUNet_raw_data")
}
