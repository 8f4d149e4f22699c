//! 中心裁剪与填充.

use ndarray::{s, Array3};

use crate::{Idx3d, Vec3, Volume, Voxel};

/// 将 `image` 中心裁剪 (或以零值填充) 到 `(z, y, x)` 形状 `shape`.
///
/// 每个轴上, 较长时从 `(len - n) / 2` 处开始截取, 较短时在前方填充 `(n - len) / 2` 个体素,
/// 其余填充在后方. `crop_only` 为真时不做任何填充, 较短的轴保持原长.
///
/// 体素的物理位置保持不变, 即原点会随之移动. 元信息保留.
pub fn crop_or_pad<T: Voxel>(image: &Volume<T>, shape: Idx3d, crop_only: bool) -> Volume<T> {
    let src = [image.shape().0, image.shape().1, image.shape().2];
    let mut target = [shape.0, shape.1, shape.2];
    if crop_only {
        target.iter_mut().zip(src).for_each(|(n, len)| *n = (*n).min(len));
    }

    // 第 a 个轴上: 源数据截取起点, 目标数据写入起点, 拷贝长度.
    let mut start = [0usize; 3];
    let mut pad = [0usize; 3];
    let mut copy = [0usize; 3];
    for a in 0..3 {
        if src[a] >= target[a] {
            start[a] = (src[a] - target[a]) / 2;
            copy[a] = target[a];
        } else {
            pad[a] = (target[a] - src[a]) / 2;
            copy[a] = src[a];
        }
    }

    if target == src {
        return image.clone();
    }

    let mut data = Array3::from_elem((target[0], target[1], target[2]), T::default());
    data.slice_mut(s![
        pad[0]..pad[0] + copy[0],
        pad[1]..pad[1] + copy[1],
        pad[2]..pad[2] + copy[2]
    ])
    .assign(&image.data().slice(s![
        start[0]..start[0] + copy[0],
        start[1]..start[1] + copy[1],
        start[2]..start[2] + copy[2]
    ]));

    // 新网格索引 0 对应原网格的 `start - pad`, 按 (x, y, z) 组织.
    let shift = |a: usize| start[a] as f64 - pad[a] as f64;
    let origin = image
        .geometry()
        .index_to_physical([shift(2), shift(1), shift(0)]);
    Volume::new(image.geometry().with_origin(origin), data).with_metadata(image.metadata().clone())
}

/// 按物理尺寸 `physical_size` (毫米, `(z, y, x)`) 中心裁剪或填充.
///
/// 目标形状由 `image` 自身的分辨率换算: `round(physical_size / spacing)`, 至少为 1.
pub fn crop_or_pad_physical<T: Voxel>(
    image: &Volume<T>,
    physical_size: Vec3,
    crop_only: bool,
) -> Volume<T> {
    crop_or_pad(image, matrix_size_for(physical_size, image.geometry().spacing_zyx()), crop_only)
}

/// 按 `(z, y, x)` 分辨率 `spacing` 换算物理尺寸对应的网格形状.
pub fn matrix_size_for(physical_size: Vec3, spacing: Vec3) -> Idx3d {
    let n = |i: usize| ((physical_size[i] / spacing[i]).round() as usize).max(1);
    (n(0), n(1), n(2))
}
