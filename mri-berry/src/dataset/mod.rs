//! 数据集整理: 归档扫描, mha2nnunet 设置文件与 nnU-Net 原始数据转换.

use std::path::{Path, PathBuf};

pub mod archive;
pub mod convert;
pub mod settings;

pub use archive::{
    ArchiveError, ArchiveItem, ArchiveLayout, ArchiveSource, CollectArchive, ScanOutcome,
    SkipReason, SkippedCase,
};
pub use convert::{ConvertError, ConvertReport, Mha2nnUnetConverter};
pub use settings::{
    generate_mha2nnunet_settings, DatasetJson, Mha2nnUnetSettings, SettingsError, SubjectList,
};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}
