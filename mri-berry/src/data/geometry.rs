//! 体素网格的物理空间信息.
//!
//! 约定与 ITK 一致:
//!
//! ```text
//! physical = origin + direction * (spacing ⊙ index)
//! ```
//!
//! 其中 `index` 按 `(x, y, z)` 组织, `direction` 的第 `i` 列是第 `i` 个体素轴在 LPS
//! 物理坐标系下的单位方向向量.

use crate::Vec3;

/// 3x3 矩阵, 行优先存储.
pub type Mat3 = [f64; 9];

/// 单位矩阵.
pub const IDENTITY: Mat3 = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// 体素网格的空间信息: 分辨率, 原点与方向.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Geometry {
    spacing: Vec3,
    origin: Vec3,
    direction: Mat3,
    /// `direction` 的逆矩阵.
    inverse_direction: Mat3,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: IDENTITY,
            inverse_direction: IDENTITY,
        }
    }
}

impl Geometry {
    /// 创建空间信息. `spacing` 必须全部为正有限值且倒数有限, 方向矩阵必须可逆,
    /// 否则返回 `None`.
    pub fn new(spacing: Vec3, origin: Vec3, direction: Mat3) -> Option<Self> {
        if !(spacing.iter().all(|s| s.is_finite() && *s > 0.0 && s.recip().is_finite())
            && origin.iter().all(|o| o.is_finite())
            && direction.iter().all(|d| d.is_finite()))
        {
            return None;
        }
        let inverse_direction = inverse3(&direction)?;
        Some(Self {
            spacing,
            origin,
            direction,
            inverse_direction,
        })
    }

    /// 仅指定分辨率, 原点位于零点, 方向为单位阵.
    #[inline]
    pub fn with_spacing(spacing: Vec3) -> Option<Self> {
        Self::new(spacing, [0.0; 3], IDENTITY)
    }

    /// 获取体素分辨率, 以毫米为单位, 按 `(x, y, z)` 组织.
    #[inline]
    pub fn spacing(&self) -> Vec3 {
        self.spacing
    }

    /// 获取按 `(z, y, x)` 组织的体素分辨率, 与体素数据的轴顺序一致.
    #[inline]
    pub fn spacing_zyx(&self) -> Vec3 {
        let [x, y, z] = self.spacing;
        [z, y, x]
    }

    /// 获取索引 `(0, 0, 0)` 体素中心的物理坐标.
    #[inline]
    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// 获取方向矩阵 (行优先).
    #[inline]
    pub fn direction(&self) -> Mat3 {
        self.direction
    }

    /// 返回修改了原点的副本.
    #[inline]
    pub fn with_origin(mut self, origin: Vec3) -> Self {
        self.origin = origin;
        self
    }

    /// 返回修改了分辨率的副本.
    ///
    /// `spacing` 的合法性由调用者保证.
    #[inline]
    pub(crate) fn with_spacing_unchecked(mut self, spacing: Vec3) -> Self {
        self.spacing = spacing;
        self
    }

    /// 将 `(x, y, z)` 连续索引转换成物理坐标.
    pub fn index_to_physical(&self, index: Vec3) -> Vec3 {
        let scaled = [
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        ];
        add(&self.origin, &mul_vec(&self.direction, &scaled))
    }

    /// 将物理坐标转换成 `(x, y, z)` 连续索引.
    pub fn physical_to_index(&self, point: Vec3) -> Vec3 {
        mul_vec(&self.physical_to_index_matrix(), &sub(&point, &self.origin))
    }

    /// `direction * diag(spacing)`.
    pub fn index_to_physical_matrix(&self) -> Mat3 {
        let d = &self.direction;
        let s = &self.spacing;
        let mut ans = [0.0; 9];
        for r in 0..3 {
            for c in 0..3 {
                ans[r * 3 + c] = d[r * 3 + c] * s[c];
            }
        }
        ans
    }

    /// `diag(spacing)^-1 * direction^-1`, 即 [`Self::index_to_physical_matrix`] 的逆.
    ///
    /// 分别对两个因子求逆, 分辨率很小时也不会因行列式过小而失败.
    pub fn physical_to_index_matrix(&self) -> Mat3 {
        let d = &self.inverse_direction;
        let s = &self.spacing;
        let mut ans = [0.0; 9];
        for r in 0..3 {
            for c in 0..3 {
                ans[r * 3 + c] = d[r * 3 + c] / s[r];
            }
        }
        ans
    }

    /// 计算从 `self` 的连续索引到 `other` 的连续索引的仿射映射 `(M, t)`,
    /// 满足 `other_index = M * self_index + t`.
    pub fn index_map_to(&self, other: &Geometry) -> (Mat3, Vec3) {
        let inv = other.physical_to_index_matrix();
        let m = mul_mat(&inv, &self.index_to_physical_matrix());
        let t = mul_vec(&inv, &sub(&self.origin, &other.origin));
        (m, t)
    }

    /// 两个空间信息是否在容差 `tol` 内一致.
    pub fn approx_eq(&self, other: &Geometry, tol: f64) -> bool {
        let close = |a: &[f64], b: &[f64]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol);
        close(&self.spacing, &other.spacing)
            && close(&self.origin, &other.origin)
            && close(&self.direction, &other.direction)
    }

    /// 两个空间信息之间是否只有亚体素级别的差异:
    /// 分辨率与方向在 `tol` 内一致, 且原点偏移不超过半个体素.
    pub fn is_subvoxel_aligned(&self, other: &Geometry, tol: f64) -> bool {
        let close = |a: &[f64], b: &[f64]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tol);
        close(&self.spacing, &other.spacing)
            && close(&self.direction, &other.direction)
            && self
                .origin
                .iter()
                .zip(other.origin.iter())
                .zip(self.spacing.iter())
                .all(|((a, b), s)| (a - b).abs() < 0.5 * s)
    }
}

#[inline]
fn add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
fn sub(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// 矩阵乘向量.
#[inline]
pub fn mul_vec(m: &Mat3, v: &Vec3) -> Vec3 {
    [
        m[0] * v[0] + m[1] * v[1] + m[2] * v[2],
        m[3] * v[0] + m[4] * v[1] + m[5] * v[2],
        m[6] * v[0] + m[7] * v[1] + m[8] * v[2],
    ]
}

/// 矩阵乘矩阵.
pub fn mul_mat(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut ans = [0.0; 9];
    for r in 0..3 {
        for c in 0..3 {
            ans[r * 3 + c] = (0..3).map(|k| a[r * 3 + k] * b[k * 3 + c]).sum();
        }
    }
    ans
}

/// 矩阵转置.
#[inline]
pub fn transpose(m: &Mat3) -> Mat3 {
    [m[0], m[3], m[6], m[1], m[4], m[7], m[2], m[5], m[8]]
}

/// 行列式.
#[inline]
pub fn det3(m: &Mat3) -> f64 {
    m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
        + m[2] * (m[3] * m[7] - m[4] * m[6])
}

/// 矩阵求逆. 奇异时返回 `None`.
pub fn inverse3(m: &Mat3) -> Option<Mat3> {
    let det = det3(m);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        (m[4] * m[8] - m[5] * m[7]) * inv_det,
        (m[2] * m[7] - m[1] * m[8]) * inv_det,
        (m[1] * m[5] - m[2] * m[4]) * inv_det,
        (m[5] * m[6] - m[3] * m[8]) * inv_det,
        (m[0] * m[8] - m[2] * m[6]) * inv_det,
        (m[2] * m[3] - m[0] * m[5]) * inv_det,
        (m[3] * m[7] - m[4] * m[6]) * inv_det,
        (m[1] * m[6] - m[0] * m[7]) * inv_det,
        (m[0] * m[4] - m[1] * m[3]) * inv_det,
    ])
}
