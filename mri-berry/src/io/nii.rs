//! NIfTI-1 (`.nii` / `.nii.gz`) 读写.
//!
//! NIfTI 的物理坐标系是 RAS, 而 [`Geometry`] 使用 LPS,
//! 两者之间只差 x, y 两个坐标分量的符号. 转换只在文件边界进行.
//!
//! 读取时优先使用 sform, 其次 qform, 都不存在时退化为只有分辨率的对角仿射.
//! 写入时同时写出 qform 和 sform (编码均为 1, 即扫描仪坐标系).

use std::path::Path;

use ndarray::{Axis, Ix3};
use nifti::{NiftiHeader, NiftiObject, ReaderOptions};

use super::{ImageError, ImageVoxel};
use crate::geometry::{det3, Geometry, Mat3, IDENTITY};
use crate::{Vec3, Volume};

/// `xyzt_units` 中表示毫米的取值.
const NIFTI_UNITS_MM: u8 = 2;

/// `qform_code` / `sform_code` 中表示扫描仪坐标系的取值.
const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;

/// 读取 `.nii` / `.nii.gz` 文件.
///
/// 允许第 4 维长度为 1 的 4D 文件. NIfTI 文件不携带元信息.
pub fn read_nifti<T: ImageVoxel, P: AsRef<Path>>(path: P) -> Result<Volume<T>, ImageError> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let geometry = geometry_from_header(&header)
        .ok_or_else(|| ImageError::NotVolume(path.to_owned()))?;

    // [x, y, z, (1, ...)] -> [x, y, z].
    let mut data = T::read_nifti_array(obj.into_volume())?;
    while data.ndim() > 3 {
        if data.len_of(Axis(3)) != 1 {
            return Err(ImageError::NotVolume(path.to_owned()));
        }
        data = data.index_axis_move(Axis(3), 0);
    }
    if data.ndim() != 3 {
        return Err(ImageError::NotVolume(path.to_owned()));
    }

    // [x, y, z] -> [z, y, x].
    let data = data.into_dimensionality::<Ix3>()?.permuted_axes([2, 1, 0]);
    let data = if data.is_standard_layout() {
        data
    } else {
        data.as_standard_layout().into_owned()
    };
    Ok(Volume::new(geometry, data))
}

/// 写 `.nii` / `.nii.gz` 文件. 是否压缩由扩展名决定.
///
/// 元信息不会被写出.
pub fn write_nifti<T: ImageVoxel, P: AsRef<Path>>(
    image: &Volume<T>,
    path: P,
) -> Result<(), ImageError> {
    let path = path.as_ref();
    let header = header_from_geometry(image.geometry());
    // [z, y, x] -> [x, y, z].
    T::write_nifti_array(path, &header, image.data().permuted_axes([2, 1, 0]))?;
    Ok(())
}

/// LPS 与 RAS 之间的转换: x, y 分量取反. 该变换是自身的逆.
#[inline]
fn flip_xy(v: Vec3) -> Vec3 {
    [-v[0], -v[1], v[2]]
}

/// 方向矩阵的前两行取反.
#[inline]
fn flip_xy_rows(m: &Mat3) -> Mat3 {
    let mut ans = *m;
    ans[..6].iter_mut().for_each(|v| *v = -*v);
    ans
}

/// 由 NIfTI 文件头计算 LPS 空间信息.
pub fn geometry_from_header(header: &NiftiHeader) -> Option<Geometry> {
    let pixdim = |i: usize| {
        let p = header.pixdim[i].abs() as f64;
        if p > 0.0 && p.is_finite() {
            p
        } else {
            1.0
        }
    };

    let (spacing, origin, direction) = if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut spacing = [0.0; 3];
        let mut direction = [0.0; 9];
        for c in 0..3 {
            let norm = (0..3)
                .map(|r| (rows[r][c] as f64).powi(2))
                .sum::<f64>()
                .sqrt();
            spacing[c] = norm;
            for r in 0..3 {
                direction[r * 3 + c] = rows[r][c] as f64 / norm;
            }
        }
        let origin = [rows[0][3] as f64, rows[1][3] as f64, rows[2][3] as f64];
        (spacing, origin, direction)
    } else if header.qform_code > 0 {
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let direction = quaternion_to_rotation(
            header.quatern_b as f64,
            header.quatern_c as f64,
            header.quatern_d as f64,
            qfac,
        );
        let origin = [
            header.quatern_x as f64,
            header.quatern_y as f64,
            header.quatern_z as f64,
        ];
        ([pixdim(1), pixdim(2), pixdim(3)], origin, direction)
    } else {
        ([pixdim(1), pixdim(2), pixdim(3)], [0.0; 3], IDENTITY)
    };

    Geometry::new(spacing, flip_xy(origin), flip_xy_rows(&direction))
}

/// 由 LPS 空间信息构造 NIfTI 文件头. 数据相关字段由写入器填写.
pub fn header_from_geometry(geometry: &Geometry) -> NiftiHeader {
    let spacing = geometry.spacing();
    let origin = flip_xy(geometry.origin());
    let mut rotation = flip_xy_rows(&geometry.direction());

    let qfac = if det3(&rotation) < 0.0 {
        // qform 只能表示真旋转, 左手系通过 qfac 翻转第三列.
        rotation[2] = -rotation[2];
        rotation[5] = -rotation[5];
        rotation[8] = -rotation[8];
        -1.0
    } else {
        1.0
    };
    let [b, c, d] = rotation_to_quaternion(&rotation);

    let ras = flip_xy_rows(&geometry.direction());
    let srow = |r: usize| {
        [
            (ras[r * 3] * spacing[0]) as f32,
            (ras[r * 3 + 1] * spacing[1]) as f32,
            (ras[r * 3 + 2] * spacing[2]) as f32,
            origin[r] as f32,
        ]
    };

    let mut header = NiftiHeader::default();
    header.pixdim = [
        qfac as f32,
        spacing[0] as f32,
        spacing[1] as f32,
        spacing[2] as f32,
        0.0,
        0.0,
        0.0,
        0.0,
    ];
    header.xyzt_units = NIFTI_UNITS_MM;
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    header.qform_code = NIFTI_XFORM_SCANNER_ANAT;
    header.quatern_b = b as f32;
    header.quatern_c = c as f32;
    header.quatern_d = d as f32;
    header.quatern_x = origin[0] as f32;
    header.quatern_y = origin[1] as f32;
    header.quatern_z = origin[2] as f32;
    header.sform_code = NIFTI_XFORM_SCANNER_ANAT;
    header.srow_x = srow(0);
    header.srow_y = srow(1);
    header.srow_z = srow(2);
    header
}

/// 四元数 `(b, c, d)` 转旋转矩阵, 第三列乘以 `qfac`.
fn quaternion_to_rotation(b: f64, c: f64, d: f64, qfac: f64) -> Mat3 {
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    [
        a * a + b * b - c * c - d * d,
        2.0 * (b * c - a * d),
        2.0 * (b * d + a * c) * qfac,
        2.0 * (b * c + a * d),
        a * a + c * c - b * b - d * d,
        2.0 * (c * d - a * b) * qfac,
        2.0 * (b * d - a * c),
        2.0 * (c * d + a * b),
        (a * a + d * d - c * c - b * b) * qfac,
    ]
}

/// 真旋转矩阵转四元数 `(b, c, d)`, 保证实部 `a >= 0`.
fn rotation_to_quaternion(r: &Mat3) -> [f64; 3] {
    let (r11, r12, r13) = (r[0], r[1], r[2]);
    let (r21, r22, r23) = (r[3], r[4], r[5]);
    let (r31, r32, r33) = (r[6], r[7], r[8]);

    let trace = r11 + r22 + r33 + 1.0;
    let (a, b, c, d) = if trace > 0.5 {
        let a = 0.5 * trace.sqrt();
        (
            a,
            0.25 * (r32 - r23) / a,
            0.25 * (r13 - r31) / a,
            0.25 * (r21 - r12) / a,
        )
    } else {
        let xd = 1.0 + r11 - (r22 + r33);
        let yd = 1.0 + r22 - (r11 + r33);
        let zd = 1.0 + r33 - (r11 + r22);
        if xd > 1.0 {
            let b = 0.5 * xd.sqrt();
            (
                0.25 * (r32 - r23) / b,
                b,
                0.25 * (r12 + r21) / b,
                0.25 * (r13 + r31) / b,
            )
        } else if yd > 1.0 {
            let c = 0.5 * yd.sqrt();
            (
                0.25 * (r13 - r31) / c,
                0.25 * (r12 + r21) / c,
                c,
                0.25 * (r23 + r32) / c,
            )
        } else {
            let d = 0.5 * zd.sqrt();
            (
                0.25 * (r21 - r12) / d,
                0.25 * (r13 + r31) / d,
                0.25 * (r23 + r32) / d,
                d,
            )
        }
    };
    if a < 0.0 {
        [-b, -c, -d]
    } else {
        [b, c, d]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MriLabel, MriScan};
    use ndarray::Array3;

    #[test]
    fn test_lps_identity_quaternion() {
        let g = Geometry::new([0.5, 0.5, 3.0], [10.0, -20.0, 30.0], IDENTITY).unwrap();
        let h = header_from_geometry(&g);
        assert_eq!((h.quatern_b, h.quatern_c, h.quatern_d), (0.0, 0.0, 1.0));
        assert_eq!(h.pixdim[0], 1.0);
        // RAS 原点.
        assert_eq!(h.srow_x, [-0.5, 0.0, 0.0, -10.0]);
        assert_eq!(h.srow_y, [0.0, -0.5, 0.0, 20.0]);
        assert_eq!(h.srow_z, [0.0, 0.0, 3.0, 30.0]);
    }

    #[test]
    fn test_qform_fallback_matches_sform() {
        let direction = [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let g = Geometry::new([0.6, 0.6, 3.6], [-91.5, 12.25, 40.0], direction).unwrap();
        let mut h = header_from_geometry(&g);
        assert!(geometry_from_header(&h).unwrap().approx_eq(&g, 1e-5));

        h.sform_code = 0;
        assert!(geometry_from_header(&h).unwrap().approx_eq(&g, 1e-5));
    }

    #[test]
    fn test_left_handed_direction_uses_qfac() {
        let direction = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0];
        let g = Geometry::new([1.0, 1.0, 2.0], [0.0; 3], direction).unwrap();
        let mut h = header_from_geometry(&g);
        assert_eq!(h.pixdim[0], -1.0);
        h.sform_code = 0;
        assert!(geometry_from_header(&h).unwrap().approx_eq(&g, 1e-6));
    }

    #[test]
    fn test_nifti_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let g = Geometry::new([0.5, 0.5, 3.0], [10.0, -20.0, 30.0], IDENTITY).unwrap();

        let scan = MriScan::new(
            g,
            Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 20 + y * 5 + x) as f32 * 0.5),
        );
        let path = dir.path().join("case_0000.nii.gz");
        write_nifti(&scan, &path).unwrap();
        let back: MriScan = read_nifti(&path).unwrap();
        assert_eq!(back.shape(), (3, 4, 5));
        assert_eq!(back.data(), scan.data());
        assert!(back.geometry().approx_eq(&g, 1e-5));

        let mut label = MriLabel::new(g, Array3::zeros((3, 4, 5)));
        label[(1, 2, 3)] = 1;
        label.metadata_mut().insert("PatientID".into(), "10000".into());
        let path = dir.path().join("case.nii");
        write_nifti(&label, &path).unwrap();
        let back: MriLabel = read_nifti(&path).unwrap();
        assert_eq!(back[(1, 2, 3)], 1);
        assert_eq!(back.count(1), 1);
        assert!(back.metadata().is_empty());
    }
}
