//! 调用外部 nnU-Net 推理程序.
//!
//! 推理程序是一个阻塞的子进程. 它的退出码非零时整个流程失败, 不做重试.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use itertools::Itertools;
use log::info;

use crate::consts::{CHECKPOINT, DEFAULT_FOLDS, NETWORK, TASK, TRAINER};

/// nnU-Net v1 推理程序的默认名称.
pub const NNUNET_PREDICT: &str = "nnUNet_predict";

/// 推理错误.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// 无法启动推理程序.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        /// 程序名.
        program: String,
        /// 原始错误.
        source: std::io::Error,
    },

    /// 推理程序异常退出.
    #[error("`{program}` exited with {status}")]
    Failed {
        /// 程序名.
        program: String,
        /// 退出状态.
        status: ExitStatus,
    },
}

/// 一次推理的参数.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictParams {
    /// 任务名.
    pub task: String,

    /// trainer 名.
    pub trainer: String,

    /// 网络结构.
    pub network: String,

    /// checkpoint 名. 为 `None` 时使用推理程序的默认值.
    pub checkpoint: Option<String>,

    /// 参与集成的 folds. 为空时使用推理程序的默认值.
    pub folds: Vec<u32>,

    /// 是否同时输出概率图.
    pub store_probability_maps: bool,

    /// 是否关闭测试时增强.
    pub disable_augmentation: bool,

    /// 是否关闭滑窗重叠.
    pub disable_patch_overlap: bool,

    /// 输入目录, 包含 `scan_0000.nii.gz` 等文件.
    pub input_dir: PathBuf,

    /// 输出目录.
    pub output_dir: PathBuf,

    /// 模型权重目录, 通过 `RESULTS_FOLDER` 环境变量传给推理程序.
    pub results_dir: PathBuf,
}

impl PredictParams {
    /// 前列腺全腺体分割模型的默认参数.
    pub fn new<P, Q, R>(input_dir: P, output_dir: Q, results_dir: R) -> Self
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        Self {
            task: TASK.to_string(),
            trainer: TRAINER.to_string(),
            network: NETWORK.to_string(),
            checkpoint: Some(CHECKPOINT.to_string()),
            folds: DEFAULT_FOLDS.to_vec(),
            store_probability_maps: true,
            disable_augmentation: false,
            disable_patch_overlap: false,
            input_dir: input_dir.as_ref().to_owned(),
            output_dir: output_dir.as_ref().to_owned(),
            results_dir: results_dir.as_ref().to_owned(),
        }
    }
}

/// 推理引擎.
pub trait InferenceEngine {
    /// 对 `params.input_dir` 中的病例推理, 结果写入 `params.output_dir`. 阻塞直到推理结束.
    fn predict(&self, params: &PredictParams) -> Result<(), InferenceError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for &E {
    #[inline]
    fn predict(&self, params: &PredictParams) -> Result<(), InferenceError> {
        (**self).predict(params)
    }
}

/// 通过命令行调用 `nnUNet_predict`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NnUnetCli {
    program: OsString,
}

impl Default for NnUnetCli {
    fn default() -> Self {
        Self::new(NNUNET_PREDICT)
    }
}

impl NnUnetCli {
    /// 使用给定程序名或路径.
    #[inline]
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
        }
    }

    /// 获取程序名.
    #[inline]
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// 命令行参数, 不含程序名.
    pub fn args(&self, params: &PredictParams) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-t".into(),
            params.task.as_str().into(),
            "-i".into(),
            params.input_dir.as_os_str().into(),
            "-o".into(),
            params.output_dir.as_os_str().into(),
            "-m".into(),
            params.network.as_str().into(),
            "-tr".into(),
            params.trainer.as_str().into(),
            "--num_threads_preprocessing".into(),
            "2".into(),
            "--num_threads_nifti_save".into(),
            "1".into(),
        ];
        if !params.folds.is_empty() {
            args.push("-f".into());
            args.extend(params.folds.iter().map(|f| f.to_string().into()));
        }
        if let Some(chk) = &params.checkpoint {
            args.push("-chk".into());
            args.push(chk.as_str().into());
        }
        if params.store_probability_maps {
            args.push("--save_npz".into());
        }
        if params.disable_augmentation {
            args.push("--disable_tta".into());
        }
        if params.disable_patch_overlap {
            args.push("--step_size".into());
            args.push("1".into());
        }
        args
    }

    /// 构造子进程命令. `RESULTS_FOLDER` 只对子进程生效.
    pub fn command(&self, params: &PredictParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(params))
            .env("RESULTS_FOLDER", &params.results_dir);
        cmd
    }
}

impl InferenceEngine for NnUnetCli {
    fn predict(&self, params: &PredictParams) -> Result<(), InferenceError> {
        let program = self.program.to_string_lossy().into_owned();
        info!(
            "Running {program} {}",
            self.args(params).iter().map(|a| a.to_string_lossy()).join(" ")
        );

        let status = self
            .command(params)
            .status()
            .map_err(|source| InferenceError::Spawn {
                program: program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(InferenceError::Failed { program, status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PredictParams {
        PredictParams::new(
            "/opt/algorithm/nnunet/input",
            "/opt/algorithm/nnunet/output",
            "/opt/algorithm/results",
        )
    }

    fn args(params: &PredictParams) -> Vec<String> {
        NnUnetCli::default()
            .args(params)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_default_command_line() {
        let expected = "-t Task2202_prostate_segmentation \
            -i /opt/algorithm/nnunet/input -o /opt/algorithm/nnunet/output \
            -m 3d_fullres -tr nnUNetTrainerV2_Loss_FL_and_CE_checkpoints \
            --num_threads_preprocessing 2 --num_threads_nifti_save 1 \
            -f 0 1 2 3 4 -chk model_final_checkpoint --save_npz";
        assert_eq!(args(&params()).join(" "), expected);
    }

    #[test]
    fn test_optional_flags() {
        let mut p = params();
        p.folds.clear();
        p.checkpoint = None;
        p.store_probability_maps = false;
        p.disable_augmentation = true;
        p.disable_patch_overlap = true;
        let a = args(&p);
        assert!(!a.contains(&"-f".to_string()));
        assert!(!a.contains(&"-chk".to_string()));
        assert!(!a.contains(&"--save_npz".to_string()));
        assert_eq!(a[a.len() - 3..], ["--disable_tta", "--step_size", "1"]);

        p.folds = vec![2];
        let a = args(&p);
        let f = a.iter().position(|s| s == "-f").unwrap();
        assert_eq!(a[f + 1], "2");
        assert_eq!(a[f + 2], "--disable_tta");
    }

    #[test]
    fn test_results_folder_is_scoped_to_child() {
        let cmd = NnUnetCli::default().command(&params());
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(
            envs,
            vec![(OsStr::new("RESULTS_FOLDER"), Some(OsStr::new("/opt/algorithm/results")))]
        );
        assert_eq!(cmd.get_program(), NNUNET_PREDICT);
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let cli = NnUnetCli::new("/nonexistent/bin/nnUNet_predict");
        assert!(matches!(
            cli.predict(&params()),
            Err(InferenceError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_fatal() {
        let cli = NnUnetCli::new("false");
        match cli.predict(&params()) {
            Err(InferenceError::Failed { program, status }) => {
                assert_eq!(program, "false");
                assert!(!status.success());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(NnUnetCli::new("true").predict(&params()).is_ok());
    }
}
