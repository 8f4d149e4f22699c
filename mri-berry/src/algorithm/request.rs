//! 推理请求与输入校验.

use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

/// 输入扫描的扩展名.
const SCAN_EXTENSION: &str = ".mha";

/// 输入校验错误.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// 输入目录中没有扫描.
    #[error("Could not find scan for {name} in {} (files: {files:?})", .folder.display())]
    MissingSequence {
        /// 序列名, 即输入目录名.
        name: String,
        /// 输入目录.
        folder: PathBuf,
        /// 目录中的全部文件.
        files: Vec<String>,
    },

    /// 输入目录中有多个扫描.
    #[error("Found multiple scans for {name} in {} (files: {files:?})", .folder.display())]
    MultipleScans {
        /// 序列名, 即输入目录名.
        name: String,
        /// 输入目录.
        folder: PathBuf,
        /// 目录中的全部文件.
        files: Vec<String>,
    },
}

/// 一次推理的输入与输出.
///
/// 构造时即完成校验, 之后不可修改.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    input_dirs: Vec<PathBuf>,
    scan_paths: Vec<PathBuf>,
    output_path: PathBuf,
}

impl InferenceRequest {
    /// 校验每个输入目录中恰好有一个 `*.mha` 扫描.
    ///
    /// 不存在的目录视为没有扫描.
    pub fn new<I, P, Q>(input_dirs: I, output_path: Q) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let input_dirs: Vec<PathBuf> = input_dirs
            .into_iter()
            .map(|p| p.as_ref().to_owned())
            .collect();
        let scan_paths = input_dirs
            .iter()
            .map(|d| find_unique_scan(d))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            input_dirs,
            scan_paths,
            output_path: output_path.as_ref().to_owned(),
        })
    }

    /// 获取输入目录.
    #[inline]
    pub fn input_dirs(&self) -> &[PathBuf] {
        &self.input_dirs
    }

    /// 获取扫描路径, 与输入目录一一对应.
    #[inline]
    pub fn scan_paths(&self) -> &[PathBuf] {
        &self.scan_paths
    }

    /// 获取参考扫描 (第一个扫描) 路径. 推理结果最终对齐到它的网格上.
    #[inline]
    pub fn reference_scan(&self) -> Option<&Path> {
        self.scan_paths.first().map(PathBuf::as_path)
    }

    /// 获取输出路径.
    #[inline]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

fn find_unique_scan(folder: &Path) -> Result<PathBuf, ValidationError> {
    let files: Vec<String> = match fs::read_dir(folder) {
        Ok(rd) => rd
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .sorted()
            .collect(),
        Err(_) => Vec::new(),
    };
    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut scans: Vec<PathBuf> = files
        .iter()
        .filter(|f| f.ends_with(SCAN_EXTENSION))
        .map(|f| folder.join(f))
        .filter(|p| p.is_file())
        .collect();
    match scans.len() {
        1 => Ok(scans.remove(0)),
        0 => Err(ValidationError::MissingSequence {
            name,
            folder: folder.to_owned(),
            files,
        }),
        _ => Err(ValidationError::MultipleScans {
            name,
            folder: folder.to_owned(),
            files,
        }),
    }
}
