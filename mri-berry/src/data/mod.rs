use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::{Index, IndexMut};

use ndarray::{Array3, ArrayView, ArrayViewMut, Ix3};
use num::{NumCast, ToPrimitive};

use crate::consts::label::*;
use crate::Idx3d;

pub mod geometry;

use geometry::Geometry;

/// 体素类型.
///
/// 目前只有 `f32` (扫描) 和 `u8` (标签) 两种实现, I/O 层也只为它们提供读写.
pub trait Voxel:
    Copy + Default + PartialEq + PartialOrd + Debug + Send + Sync + NumCast + ToPrimitive + 'static
{
    /// 是否是整数类型. 插值结果写回整数类型时需要先四舍五入.
    const IS_INTEGER: bool;

    /// 从 `f64` 转换, 超出表示范围时饱和.
    fn saturating_from_f64(v: f64) -> Self;
}

impl Voxel for f32 {
    const IS_INTEGER: bool = false;

    #[inline]
    fn saturating_from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Voxel for u8 {
    const IS_INTEGER: bool = true;

    #[inline]
    fn saturating_from_f64(v: f64) -> Self {
        // `as` 对浮点到整数的转换是饱和的, NaN 映射为 0.
        v.round() as u8
    }
}

/// 带空间信息的 3D 体数据.
///
/// 体素按 `[z, y, x]` 组织, 空间信息按 `(x, y, z)` 组织. `meta` 保存了文件头中与几何无关的
/// 其它键值对 (例如 MetaImage 中的 DICOM 衍生字段), 发布结果前应调用
/// [`Volume::strip_metadata`] 清除.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    geometry: Geometry,
    data: Array3<T>,
    meta: BTreeMap<String, String>,
}

/// 3D MRI 扫描. 强度值以 `f32` 保存.
pub type MriScan = Volume<f32>;

/// 3D MRI 标注或分割结果. 标签值以 `u8` 保存.
pub type MriLabel = Volume<u8>;

impl<T> Index<Idx3d> for Volume<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl<T> IndexMut<Idx3d> for Volume<T> {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<T> Volume<T> {
    /// 由空间信息和 `[z, y, x]` 体素数据直接创建.
    #[inline]
    pub fn new(geometry: Geometry, data: Array3<T>) -> Self {
        Self {
            geometry,
            data,
            meta: BTreeMap::new(),
        }
    }

    /// 附带元信息创建.
    #[inline]
    pub fn with_metadata(mut self, meta: BTreeMap<String, String>) -> Self {
        self.meta = meta;
        self
    }

    /// 获取空间信息.
    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// 替换空间信息. 体素数据保持不变.
    #[inline]
    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = geometry;
    }

    /// 获取数据形状大小, `(z, y, x)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获取按 `(x, y, z)` 组织的网格大小, 与空间信息的轴顺序一致.
    #[inline]
    pub fn size_xyz(&self) -> [usize; 3] {
        let (z, y, x) = self.shape();
        [x, y, z]
    }

    /// 获取数据体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否不含任何体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    pub fn voxel_volume(&self) -> f64 {
        self.geometry.spacing().iter().product()
    }

    /// 获取网格覆盖的物理尺寸, 以毫米为单位, 按 `(z, y, x)` 组织.
    pub fn physical_size_zyx(&self) -> [f64; 3] {
        let (z, y, x) = self.shape();
        let [sz, sy, sx] = self.geometry.spacing_zyx();
        [z as f64 * sz, y as f64 * sy, x as f64 * sx]
    }

    /// 两个体数据是否位于同一网格 (形状一致, 空间信息在 `tol` 内一致).
    #[inline]
    pub fn same_grid<U>(&self, other: &Volume<U>, tol: f64) -> bool {
        self.shape() == other.shape() && self.geometry.approx_eq(&other.geometry, tol)
    }

    /// 复制 `other` 的空间信息. 对应 ITK 的 `CopyInformation`.
    ///
    /// 两者形状必须一致, 否则程序 panic.
    pub fn copy_information<U>(&mut self, other: &Volume<U>) {
        assert_eq!(self.shape(), other.shape(), "体数据形状不一致");
        self.geometry = other.geometry;
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, T, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, T, Ix3> {
        self.data.view_mut()
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_data(self) -> Array3<T> {
        self.data
    }

    /// 获取元信息.
    #[inline]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// 获取可变元信息.
    #[inline]
    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.meta
    }

    /// 清除全部元信息. 返回被清除的键个数.
    pub fn strip_metadata(&mut self) -> usize {
        let n = self.meta.len();
        self.meta.clear();
        n
    }
}

impl<T: Voxel> Volume<T> {
    /// 逐体素转换类型, 保留空间信息和元信息.
    pub fn cast<U: Voxel>(&self) -> Volume<U> {
        Volume {
            geometry: self.geometry,
            data: self
                .data
                .mapv(|v| U::saturating_from_f64(v.to_f64().unwrap_or_default())),
            meta: self.meta.clone(),
        }
    }

    /// 在同一网格上创建以 `value` 填充的新体数据. 不携带元信息.
    pub fn filled_like<U: Voxel>(&self, value: U) -> Volume<U> {
        Volume::new(self.geometry, Array3::from_elem(self.shape(), value))
    }
}

impl MriLabel {
    /// 获取标注中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 将所有非零标签合并为前列腺腺体, 即 `value >= 1 -> 1`.
    ///
    /// 返回被修改的体素个数.
    pub fn binarize(&mut self) -> usize {
        let mut cnt = 0usize;
        self.data
            .iter_mut()
            .filter(|p| is_gland(**p) && **p != PROSTATE_GLAND)
            .for_each(|p| {
                cnt += 1;
                *p = PROSTATE_GLAND;
            });
        cnt
    }

    /// 所有体素是否只包含背景和腺体.
    #[inline]
    pub fn is_binary(&self) -> bool {
        self.data
            .iter()
            .all(|p| matches!(*p, BACKGROUND | PROSTATE_GLAND))
    }
}

#[cfg(test)]
mod tests {
    use super::geometry::Geometry;
    use super::{MriLabel, MriScan};
    use ndarray::Array3;

    fn label() -> MriLabel {
        let mut data = Array3::<u8>::zeros((2, 3, 4));
        data[(0, 1, 1)] = 1;
        data[(1, 1, 1)] = 2;
        data[(1, 2, 3)] = 3;
        MriLabel::new(Geometry::with_spacing([0.5, 0.5, 3.0]).unwrap(), data)
    }

    #[test]
    fn test_binarize() {
        let mut l = label();
        assert!(!l.is_binary());
        assert_eq!(l.binarize(), 2);
        assert!(l.is_binary());
        assert_eq!(l.count(1), 3);
        assert_eq!(l.count(0), 21);
    }

    #[test]
    fn test_shape_conventions() {
        let l = label();
        assert_eq!(l.shape(), (2, 3, 4));
        assert_eq!(l.size_xyz(), [4, 3, 2]);
        assert_eq!(l.physical_size_zyx(), [6.0, 1.5, 2.0]);
        assert!((l.voxel_volume() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_cast_and_metadata() {
        let mut l = label();
        l.metadata_mut().insert("PatientID".into(), "42".into());
        let s: MriScan = l.cast();
        assert_eq!(s[(1, 1, 1)], 2.0);
        assert_eq!(s.metadata().len(), 1);

        let mut back: MriLabel = s.cast();
        assert_eq!(back, l);
        assert_eq!(back.strip_metadata(), 1);
        assert!(back.metadata().is_empty());
    }
}
