//! MetaImage (`.mha`) 读写.
//!
//! 文件由若干 `Key = Value` 文本行组成的文件头和紧随其后的二进制体素数据组成.
//! 文件头以 `ElementDataFile` 行结束, 其值为 `LOCAL` 时体素数据在同一文件中,
//! 否则为同目录下的独立数据文件.
//!
//! 体素数据按 x 变化最快的顺序存储, 恰好对应 `[z, y, x]` 的标准布局.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::Array3;
use num::NumCast;

use super::{ImageError, ImageVoxel};
use crate::geometry::{transpose, Geometry};
use crate::{Vec3, Volume};

/// 由本模块负责解析的文件头键. 其余键全部视为元信息.
const KNOWN_KEYS: &[&str] = &[
    "ObjectType",
    "ObjectSubType",
    "NDims",
    "DimSize",
    "ElementSpacing",
    "ElementSize",
    "Offset",
    "Position",
    "Origin",
    "TransformMatrix",
    "Rotation",
    "Orientation",
    "CenterOfRotation",
    "AnatomicalOrientation",
    "BinaryData",
    "BinaryDataByteOrderMSB",
    "ElementByteOrderMSB",
    "CompressedData",
    "CompressedDataSize",
    "ElementType",
    "ElementNumberOfChannels",
    "HeaderSize",
    "ElementDataFile",
];

/// MetaImage 元素类型.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElementType {
    /// `i8`.
    Char,
    /// `u8`.
    UChar,
    /// `i16`.
    Short,
    /// `u16`.
    UShort,
    /// `i32`.
    Int,
    /// `u32`.
    UInt,
    /// `i64`.
    LongLong,
    /// `u64`.
    ULongLong,
    /// `f32`.
    Float,
    /// `f64`.
    Double,
}

impl ElementType {
    /// 解析 `MET_*` 类型名.
    pub fn parse(name: &str) -> Option<Self> {
        let t = match name {
            "MET_CHAR" => Self::Char,
            "MET_UCHAR" => Self::UChar,
            "MET_SHORT" => Self::Short,
            "MET_USHORT" => Self::UShort,
            // MetaIO 中 LONG 为 32 位.
            "MET_INT" | "MET_LONG" => Self::Int,
            "MET_UINT" | "MET_ULONG" => Self::UInt,
            "MET_LONG_LONG" => Self::LongLong,
            "MET_ULONG_LONG" => Self::ULongLong,
            "MET_FLOAT" => Self::Float,
            "MET_DOUBLE" => Self::Double,
            _ => return None,
        };
        Some(t)
    }

    /// `MET_*` 类型名.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Char => "MET_CHAR",
            Self::UChar => "MET_UCHAR",
            Self::Short => "MET_SHORT",
            Self::UShort => "MET_USHORT",
            Self::Int => "MET_INT",
            Self::UInt => "MET_UINT",
            Self::LongLong => "MET_LONG_LONG",
            Self::ULongLong => "MET_ULONG_LONG",
            Self::Float => "MET_FLOAT",
            Self::Double => "MET_DOUBLE",
        }
    }

    /// 单个元素的字节数.
    pub const fn size(&self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::LongLong | Self::ULongLong | Self::Double => 8,
        }
    }
}

/// 解析后的文件头.
#[derive(Debug)]
struct Header {
    dim_size: [usize; 3],
    geometry: Geometry,
    element: ElementType,
    msb: bool,
    compressed: bool,
    compressed_size: Option<usize>,
    data_file: String,
    meta: BTreeMap<String, String>,
}

/// 在 `bytes` 中解析文件头, 返回文件头与体素数据起始偏移.
fn parse_header(path: &Path, bytes: &[u8]) -> Result<(Header, usize), ImageError> {
    let malformed = |reason: String| ImageError::MalformedHeader {
        path: path.to_owned(),
        reason,
    };

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut offset = 0usize;
    let mut finished = false;
    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(bytes.len(), |p| offset + p);
        let line = std::str::from_utf8(&bytes[offset..end])
            .map_err(|_| malformed("non UTF-8 header line".to_string()))?
            .trim_end_matches('\r');
        offset = (end + 1).min(bytes.len());

        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| malformed(format!("expected `Key = Value`, found `{line}`")))?;
        let (key, value) = (key.trim().to_string(), value.trim().to_string());
        let is_last = key == "ElementDataFile";
        fields.insert(key, value);
        if is_last {
            finished = true;
            break;
        }
    }
    if !finished {
        return Err(malformed("missing `ElementDataFile`".to_string()));
    }

    let get = |key: &str| fields.get(key).map(String::as_str);
    let get_any = |keys: &[&str]| keys.iter().find_map(|k| get(*k));
    let is_true = |key: &str| get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"));

    if let Some(t) = get("ObjectType") {
        if t != "Image" {
            return Err(malformed(format!("unsupported ObjectType `{t}`")));
        }
    }
    if get("NDims") != Some("3") {
        return Err(ImageError::NotVolume(path.to_owned()));
    }
    if get("ElementNumberOfChannels").is_some_and(|c| c != "1") {
        return Err(ImageError::NotVolume(path.to_owned()));
    }
    if get("BinaryData").is_some_and(|v| !v.eq_ignore_ascii_case("true")) {
        return Err(malformed("ASCII voxel data is not supported".to_string()));
    }

    let dim: Vec<usize> = parse_numbers(get("DimSize").unwrap_or_default())
        .ok_or_else(|| malformed("invalid `DimSize`".to_string()))?;
    let dim_size: [usize; 3] = dim
        .try_into()
        .map_err(|_| malformed("`DimSize` must have 3 entries".to_string()))?;

    let spacing: Vec3 = match get_any(&["ElementSpacing", "ElementSize"]) {
        Some(s) => {
            parse_vec3(s).ok_or_else(|| malformed("invalid `ElementSpacing`".to_string()))?
        }
        None => [1.0; 3],
    };
    let origin: Vec3 = match get_any(&["Offset", "Position", "Origin"]) {
        Some(s) => parse_vec3(s).ok_or_else(|| malformed("invalid `Offset`".to_string()))?,
        None => [0.0; 3],
    };
    let direction = match get_any(&["TransformMatrix", "Rotation", "Orientation"]) {
        Some(s) => {
            let m: [f64; 9] = parse_numbers::<f64>(s)
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| malformed("invalid `TransformMatrix`".to_string()))?;
            // 文件中依次存储各体素轴的方向向量, 即方向矩阵的列.
            transpose(&m)
        }
        None => crate::geometry::IDENTITY,
    };
    let geometry = Geometry::new(spacing, origin, direction)
        .ok_or_else(|| malformed("degenerate spacing or direction".to_string()))?;

    let element_name =
        get("ElementType").ok_or_else(|| malformed("missing `ElementType`".to_string()))?;
    let element = ElementType::parse(element_name)
        .ok_or_else(|| malformed(format!("unsupported ElementType `{element_name}`")))?;

    let compressed_size = match get("CompressedDataSize") {
        Some(s) => Some(
            s.parse::<usize>()
                .map_err(|_| malformed("invalid `CompressedDataSize`".to_string()))?,
        ),
        None => None,
    };

    let header = Header {
        dim_size,
        geometry,
        element,
        msb: is_true("BinaryDataByteOrderMSB") || is_true("ElementByteOrderMSB"),
        compressed: is_true("CompressedData"),
        compressed_size,
        data_file: get("ElementDataFile").unwrap_or("LOCAL").to_string(),
        meta: fields
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    Ok((header, offset))
}

fn parse_numbers<T: std::str::FromStr>(s: &str) -> Option<Vec<T>> {
    s.split_whitespace().map(|t| t.parse().ok()).collect()
}

fn parse_vec3(s: &str) -> Option<Vec3> {
    parse_numbers::<f64>(s)?.try_into().ok()
}

/// 把原始字节按 `element` 解码并转换为 `T`.
fn decode<T: ImageVoxel>(
    path: &Path,
    raw: &[u8],
    element: ElementType,
    msb: bool,
) -> Result<Vec<T>, ImageError> {
    macro_rules! decode_as {
        ($t: ty) => {{
            const N: usize = std::mem::size_of::<$t>();
            raw.chunks_exact(N)
                .map(|c| {
                    let mut bytes = [0u8; N];
                    bytes.copy_from_slice(c);
                    let v = if msb {
                        <$t>::from_be_bytes(bytes)
                    } else {
                        <$t>::from_le_bytes(bytes)
                    };
                    <T as NumCast>::from(v)
                        .ok_or_else(|| ImageError::ValueOutOfRange(path.to_owned()))
                })
                .collect()
        }};
    }

    match element {
        ElementType::Char => decode_as!(i8),
        ElementType::UChar => decode_as!(u8),
        ElementType::Short => decode_as!(i16),
        ElementType::UShort => decode_as!(u16),
        ElementType::Int => decode_as!(i32),
        ElementType::UInt => decode_as!(u32),
        ElementType::LongLong => decode_as!(i64),
        ElementType::ULongLong => decode_as!(u64),
        ElementType::Float => decode_as!(f32),
        ElementType::Double => decode_as!(f64),
    }
}

/// 解压 MetaIO 写出的数据. 通常为 zlib 流, 也兼容 gzip 流.
///
/// 预分配的容量不超过压缩数据长度的若干倍, 文件头声明的尺寸不可信.
fn inflate(path: &Path, raw: &[u8], expected: usize) -> Result<Vec<u8>, ImageError> {
    let mut out = Vec::with_capacity(expected.min(raw.len().saturating_mul(8)));
    let res = if raw.starts_with(&[0x1f, 0x8b]) {
        GzDecoder::new(raw).read_to_end(&mut out)
    } else {
        ZlibDecoder::new(raw).read_to_end(&mut out)
    };
    res.map_err(ImageError::io(path))?;
    Ok(out)
}

/// 读取 `.mha` 文件.
///
/// 体素值按 `T` 转换, 无法表示时返回 [`ImageError::ValueOutOfRange`].
pub fn read_mha<T: ImageVoxel, P: AsRef<Path>>(path: P) -> Result<Volume<T>, ImageError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(ImageError::io(path))?;
    let (header, offset) = parse_header(path, &bytes)?;

    let detached;
    let raw: &[u8] = if header.data_file.eq_ignore_ascii_case("LOCAL") {
        &bytes[offset..]
    } else if header.data_file.contains(' ') || header.data_file.eq_ignore_ascii_case("LIST") {
        return Err(ImageError::MalformedHeader {
            path: path.to_owned(),
            reason: format!("unsupported ElementDataFile `{}`", header.data_file),
        });
    } else {
        let data_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&header.data_file);
        detached = fs::read(&data_path).map_err(ImageError::io(&data_path))?;
        &detached
    };

    let [x, y, z] = header.dim_size;
    let expected = x
        .checked_mul(y)
        .and_then(|n| n.checked_mul(z))
        .and_then(|n| n.checked_mul(header.element.size()))
        .ok_or_else(|| ImageError::MalformedHeader {
            path: path.to_owned(),
            reason: format!("`DimSize` {x} {y} {z} is too large"),
        })?;

    let inflated;
    let raw: &[u8] = if header.compressed {
        let raw = match header.compressed_size {
            Some(n) if n <= raw.len() => &raw[..n],
            _ => raw,
        };
        inflated = inflate(path, raw, expected)?;
        &inflated
    } else {
        raw
    };
    if raw.len() < expected {
        return Err(ImageError::Truncated {
            path: path.to_owned(),
            expected,
            found: raw.len(),
        });
    }

    let values = decode::<T>(path, &raw[..expected], header.element, header.msb)?;
    let data = Array3::from_shape_vec((z, y, x), values)?;
    Ok(Volume::new(header.geometry, data).with_metadata(header.meta))
}

/// 格式化向量为空格分隔的文本.
fn join<T: ToString>(it: impl IntoIterator<Item = T>) -> String {
    it.into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 写 `.mha` 文件, 体素数据存储在同一文件中, 字节序为小端.
///
/// `compress` 为真时使用 zlib 压缩体素数据. 与几何无关的元信息按键的字典序写入文件头,
/// 与本模块解析的键同名的元信息会被忽略; 值中的换行会被替换为空格.
pub fn write_mha<T: ImageVoxel, P: AsRef<Path>>(
    image: &Volume<T>,
    path: P,
    compress: bool,
) -> Result<(), ImageError> {
    let path = path.as_ref();
    let element = T::MET_ELEMENT;

    let mut raw = Vec::with_capacity(image.len() * element.size());
    // `Volume` 的数据可能不是标准布局, 因此按逻辑顺序迭代.
    for v in image.data().iter() {
        encode_into(&mut raw, *v, element, path)?;
    }

    let payload = if compress {
        let mut enc = ZlibEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
        enc.write_all(&raw).map_err(ImageError::io(path))?;
        enc.finish().map_err(ImageError::io(path))?
    } else {
        raw
    };

    let g = image.geometry();
    let mut header = String::with_capacity(512);
    let mut line = |k: &str, v: String| {
        header.push_str(k);
        header.push_str(" = ");
        header.push_str(&v);
        header.push('\n');
    };
    line("ObjectType", "Image".to_string());
    line("NDims", "3".to_string());
    line("BinaryData", "True".to_string());
    line("BinaryDataByteOrderMSB", "False".to_string());
    line("CompressedData", if compress { "True" } else { "False" }.to_string());
    if compress {
        line("CompressedDataSize", payload.len().to_string());
    }
    line("TransformMatrix", join(transpose(&g.direction())));
    line("Offset", join(g.origin()));
    line("CenterOfRotation", "0 0 0".to_string());
    line("ElementSpacing", join(g.spacing()));
    line("DimSize", join(image.size_xyz()));
    for (k, v) in image.metadata() {
        let k = k.trim();
        if k.is_empty() || k.contains('=') || KNOWN_KEYS.contains(&k) {
            continue;
        }
        line(k, v.replace(['\r', '\n'], " "));
    }
    line("ElementType", element.name().to_string());
    line("ElementDataFile", "LOCAL".to_string());

    let mut file = fs::File::create(path).map_err(ImageError::io(path))?;
    file.write_all(header.as_bytes())
        .and_then(|_| file.write_all(&payload))
        .and_then(|_| file.flush())
        .map_err(ImageError::io(path))
}

/// 将单个体素按 `element` 以小端字节序追加到 `buf`.
fn encode_into<T: ImageVoxel>(
    buf: &mut Vec<u8>,
    v: T,
    element: ElementType,
    path: &Path,
) -> Result<(), ImageError> {
    let out_of_range = || ImageError::ValueOutOfRange(path.to_owned());
    match element {
        ElementType::UChar => buf.push(v.to_u8().ok_or_else(out_of_range)?),
        ElementType::Char => buf.push(v.to_i8().ok_or_else(out_of_range)?.to_le_bytes()[0]),
        ElementType::Float => {
            let v = v.to_f32().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::Double => {
            let v = v.to_f64().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::Short => {
            let v = v.to_i16().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::UShort => {
            let v = v.to_u16().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::Int => {
            let v = v.to_i32().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::UInt => {
            let v = v.to_u32().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::LongLong => {
            let v = v.to_i64().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        ElementType::ULongLong => {
            let v = v.to_u64().ok_or_else(out_of_range)?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_mha, write_mha, ElementType};
    use crate::io::ImageError;
    use crate::{Geometry, MriLabel, MriScan};
    use ndarray::Array3;
    use std::io::Write;

    fn oblique_scan() -> MriScan {
        let direction = [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let g = Geometry::new([0.5, 0.75, 3.6], [-120.25, 33.5, 7.0], direction).unwrap();
        let data =
            Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 100 + y * 10 + x) as f32 - 7.5);
        let mut s = MriScan::new(g, data);
        s.metadata_mut().insert("PatientID".into(), "ProstateX-0001".into());
        s.metadata_mut().insert("0008|103e".into(), "t2_tse_tra".into());
        s
    }

    #[test]
    fn test_mha_compressed_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t2w.mha");
        let scan = oblique_scan();
        write_mha(&scan, &path, true).unwrap();
        assert_eq!(read_mha::<f32, _>(&path).unwrap(), scan);
    }

    #[test]
    fn test_mha_uncompressed_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label.mha");
        let data = Array3::from_shape_fn((2, 2, 3), |(z, y, x)| ((z + y + x) % 2) as u8);
        let label = MriLabel::new(Geometry::with_spacing([1.0, 2.0, 3.0]).unwrap(), data);
        write_mha(&label, &path, false).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("ElementType = MET_UCHAR\nElementDataFile = LOCAL\n"));
        assert!(text.contains("DimSize = 3 2 2\n"));
        assert_eq!(read_mha::<u8, _>(&path).unwrap(), label);
    }

    /// 手写一个 ITK 风格的大端 `MET_SHORT` 文件.
    #[test]
    fn test_mha_big_endian_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adc.mha");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            "ObjectType = Image\nNDims = 3\nBinaryData = True\nBinaryDataByteOrderMSB = True\n\
             CompressedData = False\nTransformMatrix = 1 0 0 0 1 0 0 0 1\nOffset = 1 2 3\n\
             ElementSpacing = 2 2 4\nDimSize = 2 1 1\nAnatomicalOrientation = RAI\n\
             SeriesDescription = ep2d_diff\nElementType = MET_SHORT\nElementDataFile = LOCAL\n"
        )
        .unwrap();
        f.write_all(&(-3i16).to_be_bytes()).unwrap();
        f.write_all(&1200i16.to_be_bytes()).unwrap();
        drop(f);

        let adc = read_mha::<f32, _>(&path).unwrap();
        assert_eq!(adc.shape(), (1, 1, 2));
        assert_eq!(adc[(0, 0, 0)], -3.0);
        assert_eq!(adc[(0, 0, 1)], 1200.0);
        assert_eq!(adc.geometry().origin(), [1.0, 2.0, 3.0]);
        assert_eq!(adc.metadata().len(), 1);
        assert_eq!(adc.metadata()["SeriesDescription"], "ep2d_diff");

        // -3 无法用 u8 表示.
        assert!(matches!(
            read_mha::<u8, _>(&path),
            Err(ImageError::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_mha_truncated_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.mha");
        std::fs::write(
            &path,
            b"NDims = 3\nDimSize = 4 4 4\nElementType = MET_UCHAR\n\
              ElementDataFile = LOCAL\n\x01\x02",
        )
        .unwrap();
        assert!(matches!(
            read_mha::<u8, _>(&path),
            Err(ImageError::Truncated {
                expected: 64,
                found: 2,
                ..
            })
        ));

        std::fs::write(&path, b"NDims = 2\nDimSize = 4 4\nElementDataFile = LOCAL\n").unwrap();
        assert!(matches!(read_mha::<u8, _>(&path), Err(ImageError::NotVolume(_))));

        std::fs::write(&path, b"NDims = 3\nDimSize = 1 1 1\n").unwrap();
        assert!(matches!(
            read_mha::<u8, _>(&path),
            Err(ImageError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_mha_oversized_dims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.mha");
        std::fs::write(
            &path,
            b"NDims = 3\nDimSize = 4294967296 4294967296 4\nElementType = MET_FLOAT\n\
              ElementDataFile = LOCAL\n\x00\x00\x00\x00",
        )
        .unwrap();
        assert!(matches!(
            read_mha::<f32, _>(&path),
            Err(ImageError::MalformedHeader { .. })
        ));

        // 压缩数据远小于声明的尺寸.
        let path = dir.path().join("short.mha");
        std::fs::write(
            &path,
            b"NDims = 3\nDimSize = 65536 65536 64\nElementType = MET_FLOAT\n\
              CompressedData = True\nElementDataFile = LOCAL\n\x78\x9c\x03\x00\x00\x00\x00\x01",
        )
        .unwrap();
        assert!(matches!(
            read_mha::<f32, _>(&path),
            Err(ImageError::Truncated { found: 0, .. })
        ));
    }

    #[test]
    fn test_element_type_names() {
        for t in [ElementType::Char, ElementType::UShort, ElementType::Double] {
            assert_eq!(ElementType::parse(t.name()), Some(t));
        }
        assert_eq!(ElementType::parse("MET_LONG"), Some(ElementType::Int));
        assert_eq!(ElementType::parse("MET_FLOAT_ARRAY"), None);
    }
}
