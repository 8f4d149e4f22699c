//! 医学图像文件读写.
//!
//! 根据文件扩展名分派: `.mha` 走 [`mha`], `.nii` / `.nii.gz` 走 [`nii`].

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{MriLabel, MriScan, Volume, Voxel};

pub mod mha;
pub mod nii;

pub use mha::ElementType;

/// 图像 I/O 错误.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// 底层 I/O 错误.
    #[error("I/O error on `{}`: {source}", .path.display())]
    Io {
        /// 出错的文件.
        path: PathBuf,
        /// 原始错误.
        source: io::Error,
    },

    /// 无法根据扩展名识别的文件格式.
    #[error("unsupported image format: `{}`", .0.display())]
    UnsupportedFormat(PathBuf),

    /// MetaImage 文件头不合法.
    #[error("malformed MetaImage header in `{}`: {reason}", .path.display())]
    MalformedHeader {
        /// 出错的文件.
        path: PathBuf,
        /// 具体原因.
        reason: String,
    },

    /// 不是三维单通道体数据.
    #[error("`{}` is not a 3-D single-channel volume", .0.display())]
    NotVolume(PathBuf),

    /// 体素数据长度不足.
    #[error(
        "voxel data of `{}` is truncated: expected {expected} bytes, found {found}",
        .path.display()
    )]
    Truncated {
        /// 出错的文件.
        path: PathBuf,
        /// 期望的字节数.
        expected: usize,
        /// 实际的字节数.
        found: usize,
    },

    /// 体素值无法用目标类型表示.
    #[error("voxel value in `{}` cannot be represented as the target element type", .0.display())]
    ValueOutOfRange(PathBuf),

    /// NIfTI 读写错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 数组形状错误.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl ImageError {
    /// 生成附带路径的 I/O 错误构造器.
    pub(crate) fn io<P: AsRef<Path>>(path: P) -> impl FnOnce(io::Error) -> ImageError {
        let path = path.as_ref().to_owned();
        move |source| ImageError::Io { path, source }
    }
}

/// 支持的图像文件格式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageFormat {
    /// MetaImage 单文件格式 (`.mha`).
    MetaImage,

    /// NIfTI-1 格式. 参数指示是否 gzip 压缩 (`.nii.gz`).
    Nifti(bool),
}

impl ImageFormat {
    /// 根据扩展名判断文件格式. 大小写不敏感.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".mha") {
            Ok(Self::MetaImage)
        } else if name.ends_with(".nii.gz") {
            Ok(Self::Nifti(true))
        } else if name.ends_with(".nii") {
            Ok(Self::Nifti(false))
        } else {
            Err(ImageError::UnsupportedFormat(path.to_owned()))
        }
    }
}

/// 可以读写为文件的体素类型.
pub trait ImageVoxel: Voxel {
    /// 写 MetaImage 时使用的元素类型.
    const MET_ELEMENT: ElementType;

    /// 从 NIfTI 体数据读取 `[x, y, z, ...]` 排列的数组.
    fn read_nifti_array(
        volume: nifti::InMemNiftiVolume,
    ) -> nifti::Result<ndarray::ArrayD<Self>>;

    /// 按 `reference` 文件头写 NIfTI. `data` 按 `[x, y, z]` 排列.
    fn write_nifti_array(
        path: &Path,
        reference: &nifti::NiftiHeader,
        data: ndarray::ArrayView3<'_, Self>,
    ) -> nifti::Result<()>;
}

macro_rules! impl_image_voxel {
    ($($t: ty => $met: expr),+) => {
        $(
            impl ImageVoxel for $t {
                const MET_ELEMENT: ElementType = $met;

                fn read_nifti_array(
                    volume: nifti::InMemNiftiVolume,
                ) -> nifti::Result<ndarray::ArrayD<Self>> {
                    use nifti::IntoNdArray;
                    volume.into_ndarray::<$t>()
                }

                fn write_nifti_array(
                    path: &Path,
                    reference: &nifti::NiftiHeader,
                    data: ndarray::ArrayView3<'_, Self>,
                ) -> nifti::Result<()> {
                    nifti::writer::WriterOptions::new(path)
                        .reference_header(reference)
                        .write_nifti(&data)
                }
            }
        )+
    };
}

impl_image_voxel!(f32 => ElementType::Float, u8 => ElementType::UChar);

/// 读取任意支持格式的图像.
pub fn read_image<T: ImageVoxel, P: AsRef<Path>>(path: P) -> Result<Volume<T>, ImageError> {
    let path = path.as_ref();
    match ImageFormat::from_path(path)? {
        ImageFormat::MetaImage => mha::read_mha(path),
        ImageFormat::Nifti(_) => nii::read_nifti(path),
    }
}

/// 读取 MRI 扫描.
#[inline]
pub fn read_scan<P: AsRef<Path>>(path: P) -> Result<MriScan, ImageError> {
    read_image(path)
}

/// 读取 MRI 标注.
#[inline]
pub fn read_label<P: AsRef<Path>>(path: P) -> Result<MriLabel, ImageError> {
    read_image(path)
}

/// 按 `format` 写图像, 不检查 `path` 的扩展名.
pub fn write_image_as<T: ImageVoxel, P: AsRef<Path>>(
    image: &Volume<T>,
    path: P,
    format: ImageFormat,
) -> Result<(), ImageError> {
    match format {
        ImageFormat::MetaImage => mha::write_mha(image, path, true),
        ImageFormat::Nifti(_) => nii::write_nifti(image, path),
    }
}

/// 按扩展名写图像. 已存在的文件会被覆盖.
pub fn write_image<T: ImageVoxel, P: AsRef<Path>>(
    image: &Volume<T>,
    path: P,
) -> Result<(), ImageError> {
    let path = path.as_ref();
    write_image_as(image, path, ImageFormat::from_path(path)?)
}

/// 原子写图像: 先写入同目录下的临时文件, 再重命名到 `path`.
///
/// 任何时刻 `path` 上要么是旧文件, 要么是完整的新文件. 失败时临时文件会被删除.
pub fn write_image_atomic<T: ImageVoxel, P: AsRef<Path>>(
    image: &Volume<T>,
    path: P,
) -> Result<(), ImageError> {
    let path = path.as_ref();
    let format = ImageFormat::from_path(path)?;
    let tmp = partial_path(path)?;

    if let Err(e) = write_image_as(image, &tmp, format) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ImageError::io(path)(e)
    })
}

/// 临时文件路径: `{dir}/.partial-{file_name}`.
///
/// 保留原扩展名, 以便 NIfTI 写入器依据 `.gz` 后缀决定是否压缩.
fn partial_path(path: &Path) -> Result<PathBuf, ImageError> {
    let name = path
        .file_name()
        .ok_or_else(|| ImageError::UnsupportedFormat(path.to_owned()))?;
    let mut tmp = OsString::from(".partial-");
    tmp.push(name);
    Ok(path.with_file_name(tmp))
}

#[cfg(test)]
mod tests {
    use super::{partial_path, read_label, write_image_atomic, ImageError, ImageFormat};
    use crate::{Geometry, MriLabel};
    use ndarray::Array3;
    use std::path::Path;

    #[test]
    fn test_format_from_path() {
        assert_eq!(ImageFormat::from_path("a/b.mha").unwrap(), ImageFormat::MetaImage);
        assert_eq!(
            ImageFormat::from_path("scan_0000.nii.gz").unwrap(),
            ImageFormat::Nifti(true)
        );
        assert_eq!(ImageFormat::from_path("x.NII").unwrap(), ImageFormat::Nifti(false));
        assert!(matches!(
            ImageFormat::from_path("x.mhd"),
            Err(ImageError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_partial_path_keeps_extension() {
        let p = partial_path(Path::new("/out/scan.nii.gz")).unwrap();
        assert_eq!(p, Path::new("/out/.partial-scan.nii.gz"));
        assert_eq!(ImageFormat::from_path(&p).unwrap(), ImageFormat::Nifti(true));
    }

    #[test]
    fn test_atomic_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prostate_gland.mha");
        let label = MriLabel::new(
            Geometry::with_spacing([0.5, 0.5, 3.0]).unwrap(),
            Array3::from_elem((3, 4, 5), 1u8),
        );

        write_image_atomic(&label, &path).unwrap();
        write_image_atomic(&label, &path).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("prostate_gland.mha")]);
        assert_eq!(read_label(&path).unwrap(), label);
    }

    #[test]
    fn test_atomic_write_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("out.mha");
        let label = MriLabel::new(Geometry::default(), Array3::zeros((1, 1, 1)));
        assert!(matches!(
            write_image_atomic(&label, &path),
            Err(ImageError::Io { .. })
        ));
        assert!(!path.exists());
    }
}
