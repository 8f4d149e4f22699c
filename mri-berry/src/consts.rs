//! 通用常量.

/// 标签值.
pub mod label {
    /// 背景的体素值.
    pub const BACKGROUND: u8 = 0;

    /// 前列腺全腺体的体素值.
    pub const PROSTATE_GLAND: u8 = 1;

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, BACKGROUND)
    }

    /// 体素是否属于腺体?
    ///
    /// 原始标注可能按区域 (移行带, 外周带) 细分为多个正整数值,
    /// 它们都视为腺体的一部分.
    #[inline]
    pub const fn is_gland(p: u8) -> bool {
        p >= PROSTATE_GLAND
    }
}

/// nnU-Net 任务名.
pub const TASK: &str = "Task2202_prostate_segmentation";

/// nnU-Net trainer 名.
pub const TRAINER: &str = "nnUNetTrainerV2_Loss_FL_and_CE_checkpoints";

/// nnU-Net 网络结构. 固定为 3D 全分辨率.
pub const NETWORK: &str = "3d_fullres";

/// nnU-Net checkpoint 名.
pub const CHECKPOINT: &str = "model_final_checkpoint";

/// 默认参与集成推理的交叉验证 folds.
pub const DEFAULT_FOLDS: [u32; 5] = [0, 1, 2, 3, 4];

/// 推理前的中心裁剪物理尺寸, 以毫米为单位, 按 `(z, y, x)` 组织.
pub const PROSTATE_PHYSICAL_SIZE: [f64; 3] = [81.0, 192.0, 192.0];

/// Prostate158 训练集大小.
pub const PROSTATE158_TRAINING_SET_LEN: usize = 139;

/// bpMRI 序列 (即模型的输入通道).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Sequence {
    /// T2 加权像.
    T2w,

    /// 表观弥散系数图.
    Adc,

    /// 高 b 值弥散加权像.
    Hbv,
}

impl Sequence {
    /// 按模型通道顺序排列的全部序列.
    pub const ALL: [Sequence; 3] = [Sequence::T2w, Sequence::Adc, Sequence::Hbv];

    /// 推理容器中该序列的输入目录名.
    #[inline]
    pub const fn input_dir_name(&self) -> &'static str {
        match self {
            Self::T2w => "transverse-t2-prostate-mri",
            Self::Adc => "transverse-adc-prostate-mri",
            Self::Hbv => "transverse-hbv-prostate-mri",
        }
    }

    /// nnU-Net `dataset.json` 中的模态名.
    ///
    /// ADC 被标记为 "CT", 以便 nnU-Net 对其使用全局强度归一化.
    #[inline]
    pub const fn modality_name(&self) -> &'static str {
        match self {
            Self::T2w => "T2W",
            Self::Adc => "CT",
            Self::Hbv => "HBV",
        }
    }

    /// 模型通道索引.
    #[inline]
    pub const fn channel(&self) -> usize {
        match self {
            Self::T2w => 0,
            Self::Adc => 1,
            Self::Hbv => 2,
        }
    }
}

/// 推理容器中输出目录名.
pub const OUTPUT_DIR_NAME: &str = "transverse-whole-prostate-mri";

/// 推理容器中输出文件名.
pub const OUTPUT_FILE_NAME: &str = "prostate_gland.mha";
