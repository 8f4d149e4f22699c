//! 数据集整理工具.
//!
//! 1. `prepare settings`: 扫描 Prostate158, ProstateX 与 RUMC, 生成训练集 mha2nnunet 设置文件;
//! 2. `prepare inference-settings`: 扫描 PI-CAI 公开训练集, 生成推理集设置文件;
//! 3. `prepare convert`: 按设置文件生成 nnU-Net 原始数据目录.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use mri_berry::dataset::{
    generate_mha2nnunet_settings, CollectArchive, Mha2nnUnetConverter, Mha2nnUnetSettings,
    SubjectList,
};
use simple_logger::SimpleLogger;

mod paths;
mod sources;

#[derive(Parser, Debug)]
#[command(name = "prepare", version, about = "Prepare prostate bpMRI archives for nnU-Net")]
struct Cli {
    /// 数据根目录. 缺省时为 `$HOME/dataset/prostate-MRI`.
    #[arg(long, global = true, env = "inputdir")]
    inputdir: Option<PathBuf>,

    /// 工作目录. 缺省时为 `$HOME/dataset/workdir`.
    #[arg(long, global = true, env = "workdir")]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 生成训练集设置文件.
    Settings(Settings),

    /// 生成 PI-CAI 推理集设置文件.
    InferenceSettings,

    /// 转换为 nnU-Net 原始数据.
    Convert(Convert),
}

#[derive(Args, Debug)]
struct Settings {
    /// 病例列表, 形如 `{"subject_list": [...]}`. 包含 ProstateX 与 RUMC 的病例.
    #[arg(long, short = 's')]
    subject_list: PathBuf,
}

impl Settings {
    fn run(&self, inputdir: PathBuf, workdir: PathBuf) -> anyhow::Result<()> {
        let list = SubjectList::load(&self.subject_list)?;
        let (prostatex, rumc) = list.split_by(sources::PROSTATEX_PATTERN);
        info!(
            "Subject list: {} ProstateX and {} RUMC cases",
            prostatex.len(),
            rumc.len()
        );

        let prostate158 = sources::prostate158(&inputdir);
        let prostatex = sources::prostatex(&inputdir, prostatex);
        let rumc = sources::rumc(&inputdir, rumc);
        let collectors: [&dyn CollectArchive; 3] = [&prostate158, &prostatex, &rumc];
        generate_mha2nnunet_settings(&collectors, paths::training_settings_path(&workdir))?;
        Ok(())
    }
}

#[derive(Args, Debug)]
struct Convert {
    /// 设置文件, 其中的路径相对于数据根目录. 缺省时为训练集设置文件.
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Convert {
    fn run(&self, inputdir: PathBuf, workdir: PathBuf) -> anyhow::Result<()> {
        let settings_path = self
            .settings
            .clone()
            .unwrap_or_else(|| paths::training_settings_path(&workdir));
        let settings = Mha2nnUnetSettings::load(&settings_path)?;

        let converter =
            Mha2nnUnetConverter::new(paths::raw_data_dir(&workdir), &inputdir, &inputdir, settings);
        let dataset_json = converter.dataset_json_path();
        if dataset_json.exists() {
            info!("Found dataset.json at {}, skipping..", dataset_json.display());
            return Ok(());
        }

        let report = converter.convert()?;
        info!(
            "Converted {} cases, {} already present",
            report.converted, report.skipped
        );
        converter.create_dataset_json()?;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    let cli = Cli::parse();
    let inputdir = paths::input_dir_or_home(cli.inputdir)?;
    let workdir = paths::work_dir_or_home(cli.workdir)?;

    match cli.command {
        Command::Settings(s) => s.run(inputdir, workdir),
        Command::InferenceSettings => {
            let picai = sources::picai(&inputdir);
            let collectors: [&dyn CollectArchive; 1] = [&picai];
            generate_mha2nnunet_settings(&collectors, paths::inference_settings_path(&workdir))
                .map(|_| ())
                .context("failed to collect the PI-CAI archive")
        }
        Command::Convert(c) => c.run(inputdir, workdir),
    }?;
    info!("Finished.");
    Ok(())
}
