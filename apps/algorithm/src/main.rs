//! 推理容器入口: 读取三个 bpMRI 序列, 输出前列腺全腺体分割.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use mri_berry::algorithm::{AlgorithmConfig, ProstateSegmentationAlgorithm};
use mri_berry::inference::{NnUnetCli, NNUNET_PREDICT};
use simple_logger::SimpleLogger;

#[derive(Parser, Debug)]
#[command(name = "process", version, about = "Prostate whole-gland segmentation for bpMRI")]
struct Args {
    /// 输入根目录, 包含 `images/transverse-{t2,adc,hbv}-prostate-mri/`.
    #[arg(long, env = "ALGORITHM_INPUT_DIR", default_value = "/input")]
    input_dir: PathBuf,

    /// 输出根目录.
    #[arg(long, env = "ALGORITHM_OUTPUT_DIR", default_value = "/output")]
    output_dir: PathBuf,

    /// 算法根目录, 包含模型权重 `results/` 与工作目录 `nnunet/`.
    #[arg(long, env = "ALGORITHM_ROOT", default_value = "/opt/algorithm")]
    algorithm_root: PathBuf,

    /// 推理程序名或路径.
    #[arg(long, default_value = NNUNET_PREDICT)]
    program: String,

    /// 参与集成的 folds, 逗号分隔.
    #[arg(long, value_delimiter = ',', default_values_t = [0u32, 1, 2, 3, 4])]
    folds: Vec<u32>,

    /// 不输出概率图.
    #[arg(long)]
    no_probability_maps: bool,

    /// 关闭测试时增强.
    #[arg(long)]
    disable_augmentation: bool,

    /// 关闭滑窗重叠.
    #[arg(long)]
    disable_patch_overlap: bool,
}

impl Args {
    fn config(&self) -> AlgorithmConfig {
        let mut config =
            AlgorithmConfig::with_roots(&self.input_dir, &self.output_dir, &self.algorithm_root);
        config.folds = self.folds.clone();
        config.store_probability_maps = !self.no_probability_maps;
        config.disable_augmentation = self.disable_augmentation;
        config.disable_patch_overlap = self.disable_patch_overlap;
        config
    }
}

fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    let args = Args::parse();
    let config = args.config();
    let output_path = config.output_path.clone();

    let algorithm = ProstateSegmentationAlgorithm::new(config, NnUnetCli::new(&args.program))
        .context("invalid algorithm input")?;
    algorithm
        .process()
        .with_context(|| format!("failed to produce {}", output_path.display()))?;
    Ok(())
}
