//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Vec3};

pub use crate::{Geometry, MriLabel, MriScan, Volume, Voxel};

pub use crate::consts::label::{BACKGROUND, PROSTATE_GLAND};
pub use crate::consts::{Sequence, PROSTATE158_TRAINING_SET_LEN, TASK};

pub use crate::io::{read_label, read_scan, write_image, write_image_atomic, ImageError};

pub use crate::preprocess::{
    resample_to_reference, Interpolation, PreprocessingSettings, Sample,
};

pub use crate::dataset::home_dataset_dir_with;
pub use crate::dataset::{
    ArchiveItem, ArchiveLayout, ArchiveSource, CollectArchive, Mha2nnUnetConverter,
    Mha2nnUnetSettings,
};

pub use crate::inference::{InferenceEngine, NnUnetCli, PredictParams};

pub use crate::algorithm::{AlgorithmConfig, ProstateSegmentationAlgorithm};
