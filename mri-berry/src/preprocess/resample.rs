//! 物理空间重采样.
//!
//! 输出网格上每个体素中心先映射到物理坐标, 再映射到输入网格的连续索引,
//! 最后按插值方式取值. 落在输入网格之外的体素取默认值.

use ndarray::{Array3, ArrayView3, ArrayViewMut2, Axis};

use crate::geometry::{mul_vec, Geometry, Mat3};
use crate::{Idx3d, Vec3, Volume, Voxel};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 插值方式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interpolation {
    /// 最近邻. 用于标注.
    Nearest,

    /// 三线性. 用于扫描.
    Linear,
}

/// 将 `image` 重采样到由 `geometry` 和 `(z, y, x)` 形状 `shape` 描述的网格上.
///
/// 保留 `image` 的元信息.
pub fn resample_to_grid<T: Voxel>(
    image: &Volume<T>,
    geometry: &Geometry,
    shape: Idx3d,
    interp: Interpolation,
    default: T,
) -> Volume<T> {
    let mut data = Array3::from_elem(shape, default);
    if !image.is_empty() {
        let (m, t) = geometry.index_map_to(image.geometry());
        let src = image.data();
        let sampler = Sampler {
            src: &src,
            size: image.size_xyz(),
            m,
            t,
            interp,
            default,
        };

        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                data.axis_iter_mut(Axis(0))
                    .into_par_iter()
                    .enumerate()
                    .for_each(|(z, plane)| sampler.fill_plane(z, plane));
            } else {
                data.axis_iter_mut(Axis(0))
                    .enumerate()
                    .for_each(|(z, plane)| sampler.fill_plane(z, plane));
            }
        }
    }
    Volume::new(*geometry, data).with_metadata(image.metadata().clone())
}

/// 将 `image` 重采样到 `reference` 的网格上. 保留 `image` 的元信息.
#[inline]
pub fn resample_to_reference<T: Voxel, U>(
    image: &Volume<T>,
    reference: &Volume<U>,
    interp: Interpolation,
    default: T,
) -> Volume<T> {
    resample_to_grid(image, reference.geometry(), reference.shape(), interp, default)
}

/// 将 `image` 重采样到新的分辨率 `spacing` (按 `(z, y, x)` 组织).
///
/// 原点和方向不变, 每个轴的新长度为 `round(size * old_spacing / spacing)`, 至少为 1.
/// 越界部分取零值. `spacing` 必须全部为正, 否则 panic.
pub fn resample_to_spacing<T: Voxel>(
    image: &Volume<T>,
    spacing: Vec3,
    interp: Interpolation,
) -> Volume<T> {
    let old = image.geometry().spacing_zyx();
    let (z, y, x) = image.shape();
    let len = |i: usize, n: usize| ((n as f64 * old[i] / spacing[i]).round() as usize).max(1);
    let shape = (len(0, z), len(1, y), len(2, x));
    let geometry = image
        .geometry()
        .with_spacing_unchecked([spacing[2], spacing[1], spacing[0]]);
    resample_to_grid(image, &geometry, shape, interp, T::default())
}

/// 单次重采样的只读上下文.
struct Sampler<'a, 'b, T> {
    src: &'b ArrayView3<'a, T>,
    /// 输入网格大小, `(x, y, z)`.
    size: [usize; 3],
    m: Mat3,
    t: Vec3,
    interp: Interpolation,
    default: T,
}

impl<T: Voxel> Sampler<'_, '_, T> {
    fn fill_plane(&self, z: usize, mut plane: ArrayViewMut2<'_, T>) {
        for ((y, x), v) in plane.indexed_iter_mut() {
            let p = mul_vec(&self.m, &[x as f64, y as f64, z as f64]);
            let p = [p[0] + self.t[0], p[1] + self.t[1], p[2] + self.t[2]];
            *v = match self.interp {
                Interpolation::Nearest => self.nearest(p),
                Interpolation::Linear => self.linear(p),
            };
        }
    }

    #[inline]
    fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.src[(z, y, x)]
    }

    fn nearest(&self, p: Vec3) -> T {
        let mut idx = [0usize; 3];
        for a in 0..3 {
            let r = p[a].round();
            if !(r >= 0.0 && r < self.size[a] as f64) {
                return self.default;
            }
            idx[a] = r as usize;
        }
        self.get(idx[0], idx[1], idx[2])
    }

    fn linear(&self, p: Vec3) -> T {
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        let mut frac = [0.0; 3];
        for a in 0..3 {
            let last = (self.size[a] - 1) as f64;
            if !(p[a] >= -0.5 && p[a] <= last + 0.5) {
                return self.default;
            }
            let c = p[a].clamp(0.0, last);
            let f = c.floor();
            lo[a] = f as usize;
            hi[a] = (lo[a] + 1).min(self.size[a] - 1);
            frac[a] = c - f;
        }

        let mut acc = 0.0;
        for (z, wz) in [(lo[2], 1.0 - frac[2]), (hi[2], frac[2])] {
            if wz == 0.0 {
                continue;
            }
            for (y, wy) in [(lo[1], 1.0 - frac[1]), (hi[1], frac[1])] {
                if wy == 0.0 {
                    continue;
                }
                for (x, wx) in [(lo[0], 1.0 - frac[0]), (hi[0], frac[0])] {
                    if wx == 0.0 {
                        continue;
                    }
                    acc += wz * wy * wx * self.get(x, y, z).to_f64().unwrap_or_default();
                }
            }
        }
        T::saturating_from_f64(acc)
    }
}
