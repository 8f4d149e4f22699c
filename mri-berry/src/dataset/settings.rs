//! mha2nnunet 设置文件.
//!
//! 设置文件汇总了若干归档的病例列表, 附带数据集描述和预处理参数,
//! 是数据集转换 ([`super::convert`]) 的输入.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use super::archive::{ArchiveError, ArchiveItem, CollectArchive};
use crate::consts::{label, Sequence, TASK};
use crate::preprocess::PreprocessingSettings;

/// 设置文件错误.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// 归档扫描失败.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// 同一病例出现在多个归档中.
    #[error("case {0} appears in more than one archive")]
    DuplicateCase(String),

    /// 文件读写失败.
    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        /// 出错的文件.
        path: PathBuf,
        /// 原始错误.
        source: std::io::Error,
    },

    /// JSON 格式错误.
    #[error("invalid JSON in `{}`: {source}", .path.display())]
    Json {
        /// 出错的文件.
        path: PathBuf,
        /// 原始错误.
        source: serde_json::Error,
    },
}

/// 数据集描述.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetJson {
    /// nnU-Net 任务名.
    pub task: String,

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
    pub modality: BTreeMap<String, String>,

    /// 标签值到标签名.
    pub labels: BTreeMap<String, String>,
}

impl DatasetJson {
    /// 前列腺全腺体分割数据集.
    pub fn whole_gland() -> Self {
        Self {
            task: TASK.to_string(),
            description: "bpMRI scans with whole-gland prostate segmentations.".to_string(),
            tensor_image_size: "4D".to_string(),
            reference: String::new(),
            licence: String::new(),
            release: "1.0".to_string(),
            modality: Sequence::ALL
                .iter()
                .map(|s| (s.channel().to_string(), s.modality_name().to_string()))
                .collect(),
            labels: [
                (label::BACKGROUND, "background"),
                (label::PROSTATE_GLAND, "prostate_gland"),
            ]
            .into_iter()
            .map(|(v, name)| (v.to_string(), name.to_string()))
            .collect(),
        }
    }
}

/// mha2nnunet 设置.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mha2nnUnetSettings {
    /// 数据集描述.
    pub dataset_json: DatasetJson,

    /// 预处理参数.
    #[serde(default)]
    pub preprocessing: PreprocessingSettings,

    /// 病例列表.
    pub archive: Vec<ArchiveItem>,
}

impl Mha2nnUnetSettings {
    /// 依次调用 `collectors` 并拼接病例列表.
    ///
    /// 同一 `(patient_id, study_id)` 出现两次时返回 `Err(SettingsError::DuplicateCase)`.
    pub fn collect(collectors: &[&dyn CollectArchive]) -> Result<Self, SettingsError> {
        let mut archive = Vec::new();
        for c in collectors {
            archive.extend(c.collect()?);
        }

        let mut seen = HashSet::with_capacity(archive.len());
        for item in archive.iter() {
            if !seen.insert((item.patient_id.as_str(), item.study_id.as_str())) {
                return Err(SettingsError::DuplicateCase(item.subject_id()));
            }
        }

        Ok(Self {
            dataset_json: DatasetJson::whole_gland(),
            preprocessing: PreprocessingSettings::default(),
            archive,
        })
    }

    /// 序列化为 4 空格缩进的 JSON.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        let mut buf = Vec::with_capacity(4096);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        // serde_json 只输出合法 UTF-8.
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// 保存到 `path`. 自动创建父目录, 覆盖已有文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let json = self.to_json_string().map_err(|source| SettingsError::Json {
            path: path.to_owned(),
            source,
        })?;
        let io_err = |source: std::io::Error| SettingsError::Io {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, json).map_err(io_err)
    }

    /// 从 `path` 读取.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            path: path.to_owned(),
            source,
        })
    }
}

/// 收集 `collectors` 中的全部病例, 生成设置文件并保存到 `output_path`.
pub fn generate_mha2nnunet_settings<P: AsRef<Path>>(
    collectors: &[&dyn CollectArchive],
    output_path: P,
) -> Result<Mha2nnUnetSettings, SettingsError> {
    let output_path = output_path.as_ref();
    let settings = Mha2nnUnetSettings::collect(collectors)?;
    settings.save(output_path)?;
    info!(
        "Saved mha2nnunet_settings to {}, with {} cases.",
        output_path.display(),
        settings.archive.len()
    );
    Ok(settings)
}

/// 病例列表文件, 形如 `{"subject_list": ["10000_1000000", ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectList {
    /// `{patient_id}_{study_id}` 形式的病例 ID.
    pub subject_list: Vec<String>,
}

impl SubjectList {
    /// 从 `path` 读取.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            path: path.to_owned(),
            source,
        })
    }

    /// 按 ID 是否包含 `pattern` 拆分为两个列表, 各自保持原有顺序.
    pub fn split_by(&self, pattern: &str) -> (Vec<String>, Vec<String>) {
        self.subject_list
            .iter()
            .cloned()
            .partition(|s| s.contains(pattern))
    }
}
