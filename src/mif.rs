//! MRtrix image (.mif / .mif.gz) I/O
//!
//! Provides functions to load and save MRtrix-format images from/to byte
//! arrays, plus thin file wrappers. Only single-file images are supported
//! (`file: . <offset>`); detached .mih/.dat pairs are rejected.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{FixelError, FixelResult};

/// An MRtrix image held in memory.
///
/// Voxel values are stored as f64 in canonical order (axis 0 varies fastest),
/// regardless of the on-disk layout.
pub struct MifImage {
    /// Image dimensions, one entry per axis
    pub dim: Vec<usize>,
    /// Voxel spacing per axis (mm); padded with 1.0 for axes beyond the header
    pub vox: Vec<f64>,
    /// 3x4 scanner transform (direction cosines + translation), in mm
    pub transform: [[f64; 4]; 3],
    /// Datatype to use when writing (`Float32LE` or `UInt32LE`)
    pub datatype: Datatype,
    /// Additional header key-values, preserved in order
    pub keyval: Vec<(String, String)>,
    /// Voxel data in canonical order
    pub data: Vec<f64>,
}

/// Supported on-disk datatypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Float32LE,
    Float64LE,
    UInt32LE,
    Int32LE,
    UInt16LE,
    Int16LE,
    UInt8,
    Int8,
}

impl Datatype {
    fn from_str(s: &str) -> FixelResult<Self> {
        match s {
            "Float32LE" => Ok(Datatype::Float32LE),
            "Float64LE" => Ok(Datatype::Float64LE),
            "UInt32LE" => Ok(Datatype::UInt32LE),
            "Int32LE" => Ok(Datatype::Int32LE),
            "UInt16LE" => Ok(Datatype::UInt16LE),
            "Int16LE" => Ok(Datatype::Int16LE),
            "UInt8" => Ok(Datatype::UInt8),
            "Int8" => Ok(Datatype::Int8),
            other => Err(FixelError::InputInvalid(format!(
                "unsupported datatype \"{}\"",
                other
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Datatype::Float32LE => "Float32LE",
            Datatype::Float64LE => "Float64LE",
            Datatype::UInt32LE => "UInt32LE",
            Datatype::Int32LE => "Int32LE",
            Datatype::UInt16LE => "UInt16LE",
            Datatype::Int16LE => "Int16LE",
            Datatype::UInt8 => "UInt8",
            Datatype::Int8 => "Int8",
        }
    }

    fn bytes_per_value(self) -> usize {
        match self {
            Datatype::Float64LE => 8,
            Datatype::Float32LE | Datatype::UInt32LE | Datatype::Int32LE => 4,
            Datatype::UInt16LE | Datatype::Int16LE => 2,
            Datatype::UInt8 | Datatype::Int8 => 1,
        }
    }

    fn read_value(self, bytes: &[u8]) -> f64 {
        match self {
            Datatype::Float32LE => {
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            Datatype::Float64LE => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            Datatype::UInt32LE => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            Datatype::Int32LE => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            Datatype::UInt16LE => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            Datatype::Int16LE => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            Datatype::UInt8 => bytes[0] as f64,
            Datatype::Int8 => bytes[0] as i8 as f64,
        }
    }

    fn write_value(self, value: f64, out: &mut Vec<u8>) {
        match self {
            Datatype::Float32LE => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Datatype::Float64LE => out.extend_from_slice(&value.to_le_bytes()),
            Datatype::UInt32LE => out.extend_from_slice(&(value as u32).to_le_bytes()),
            Datatype::Int32LE => out.extend_from_slice(&(value as i32).to_le_bytes()),
            Datatype::UInt16LE => out.extend_from_slice(&(value as u16).to_le_bytes()),
            Datatype::Int16LE => out.extend_from_slice(&(value as i16).to_le_bytes()),
            Datatype::UInt8 => out.push(value as u8),
            Datatype::Int8 => out.push(value as i8 as u8),
        }
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn invalid(msg: impl Into<String>) -> FixelError {
    FixelError::InputInvalid(msg.into())
}

/// Split the header (up to and including "END") from the raw bytes.
/// Returns (header text, byte length of the header including terminator).
fn split_header(bytes: &[u8]) -> FixelResult<(String, usize)> {
    // The header is ASCII text terminated by a line reading "END".
    let mut offset = 0;
    let mut lines = Vec::new();
    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p)
            .ok_or_else(|| invalid("unterminated header"))?;
        let line = std::str::from_utf8(&bytes[offset..end])
            .map_err(|_| invalid("header is not valid UTF-8"))?
            .trim_end_matches('\r')
            .to_string();
        offset = end + 1;
        if line == "END" {
            return Ok((lines.join("\n"), offset));
        }
        lines.push(line);
    }
    Err(invalid("header not terminated by END"))
}

fn parse_floats(value: &str) -> FixelResult<Vec<f64>> {
    value
        .split(',')
        .map(|v| {
            let v = v.trim();
            if v.eq_ignore_ascii_case("nan") {
                Ok(f64::NAN)
            } else {
                v.parse::<f64>()
                    .map_err(|_| invalid(format!("malformed numeric field \"{}\"", v)))
            }
        })
        .collect()
}

/// Parse a signed layout entry such as "+2" or "-0" into (rank, reversed)
fn parse_layout_entry(entry: &str) -> FixelResult<(usize, bool)> {
    let entry = entry.trim();
    let (reversed, digits) = match entry.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, entry.strip_prefix('+').unwrap_or(entry)),
    };
    let rank = digits
        .parse::<usize>()
        .map_err(|_| invalid(format!("malformed layout entry \"{}\"", entry)))?;
    Ok((rank, reversed))
}

/// Load an MRtrix image from bytes (gzip auto-detected)
pub fn load_mif(bytes: &[u8]) -> FixelResult<MifImage> {
    if is_gzip(bytes) {
        let mut decoded = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut decoded)
            .map_err(|e| invalid(format!("failed to decompress gzipped image: {}", e)))?;
        return load_mif(&decoded);
    }

    let (header, _header_len) = split_header(bytes)?;
    let mut lines = header.lines();
    let magic = lines.next().unwrap_or("");
    if magic != "mrtrix image" {
        return Err(invalid(format!(
            "not an MRtrix image (first line \"{}\")",
            magic
        )));
    }

    let mut dim: Option<Vec<usize>> = None;
    let mut vox: Vec<f64> = Vec::new();
    let mut layout: Option<Vec<(usize, bool)>> = None;
    let mut datatype: Option<Datatype> = None;
    let mut data_offset: Option<usize> = None;
    let mut transform_rows: Vec<[f64; 4]> = Vec::new();
    let mut keyval = Vec::new();

    for line in lines {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("malformed header line \"{}\"", line)))?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "dim" => {
                dim = Some(
                    value
                        .split(',')
                        .map(|v| {
                            v.trim()
                                .parse::<usize>()
                                .map_err(|_| invalid(format!("malformed dim field \"{}\"", v)))
                        })
                        .collect::<FixelResult<_>>()?,
                );
            }
            "vox" => vox = parse_floats(value)?,
            "layout" => {
                layout = Some(
                    value
                        .split(',')
                        .map(parse_layout_entry)
                        .collect::<FixelResult<_>>()?,
                );
            }
            "datatype" => datatype = Some(Datatype::from_str(value)?),
            "file" => {
                let mut parts = value.split_whitespace();
                let name = parts.next().unwrap_or("");
                if name != "." {
                    return Err(invalid("detached data files (.mih/.dat) are not supported"));
                }
                data_offset = Some(
                    parts
                        .next()
                        .unwrap_or("0")
                        .parse::<usize>()
                        .map_err(|_| invalid("malformed file offset"))?,
                );
            }
            "transform" => {
                let row = parse_floats(value)?;
                if row.len() != 4 {
                    return Err(invalid("transform rows must have 4 entries"));
                }
                transform_rows.push([row[0], row[1], row[2], row[3]]);
            }
            _ => keyval.push((key.to_string(), value.to_string())),
        }
    }

    let dim = dim.ok_or_else(|| invalid("header missing dim field"))?;
    if dim.is_empty() || dim.iter().any(|&d| d == 0) {
        return Err(invalid("image dimensions must all be non-zero"));
    }
    let datatype = datatype.ok_or_else(|| invalid("header missing datatype field"))?;
    let data_offset = data_offset.ok_or_else(|| invalid("header missing file field"))?;
    let ndim = dim.len();
    let count: usize = dim.iter().product();

    while vox.len() < ndim {
        vox.push(1.0);
    }

    let mut transform = identity_transform();
    for (i, row) in transform_rows.iter().take(3).enumerate() {
        transform[i] = *row;
    }

    // Default layout: axis 0 varies fastest
    let layout = match layout {
        Some(l) => {
            if l.len() != ndim {
                return Err(invalid("layout length does not match dim"));
            }
            l
        }
        None => (0..ndim).map(|a| (a, false)).collect(),
    };

    // File strides per image axis, derived from the layout ranks
    let mut axes_by_rank: Vec<usize> = (0..ndim).collect();
    {
        let mut seen = vec![false; ndim];
        for &(rank, _) in &layout {
            if rank >= ndim || seen[rank] {
                return Err(invalid("layout is not a permutation of the image axes"));
            }
            seen[rank] = true;
        }
        axes_by_rank.sort_by_key(|&axis| layout[axis].0);
    }
    let mut file_stride = vec![0usize; ndim];
    let mut stride = 1usize;
    for &axis in &axes_by_rank {
        file_stride[axis] = stride;
        stride *= dim[axis];
    }

    let value_bytes = datatype.bytes_per_value();
    let needed = data_offset + count * value_bytes;
    if bytes.len() < needed {
        return Err(invalid(format!(
            "image file truncated: need {} bytes, have {}",
            needed,
            bytes.len()
        )));
    }
    let raw = &bytes[data_offset..];

    // Canonical strides: axis 0 fastest
    let mut data = vec![0.0f64; count];
    let mut index = vec![0usize; ndim];
    for value in data.iter_mut() {
        let mut file_index = 0usize;
        for axis in 0..ndim {
            let pos = if layout[axis].1 {
                dim[axis] - 1 - index[axis]
            } else {
                index[axis]
            };
            file_index += pos * file_stride[axis];
        }
        *value = datatype.read_value(&raw[file_index * value_bytes..]);
        // Advance canonical index (axis 0 fastest)
        for axis in 0..ndim {
            index[axis] += 1;
            if index[axis] < dim[axis] {
                break;
            }
            index[axis] = 0;
        }
    }

    Ok(MifImage {
        dim,
        vox,
        transform,
        datatype,
        keyval,
        data,
    })
}

/// The identity 3x4 scanner transform
pub fn identity_transform() -> [[f64; 4]; 3] {
    [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ]
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Save an MRtrix image as uncompressed .mif bytes
pub fn save_mif(image: &MifImage) -> FixelResult<Vec<u8>> {
    let count: usize = image.dim.iter().product();
    if image.data.len() != count {
        return Err(invalid(format!(
            "data length {} does not match image dimensions {:?}",
            image.data.len(),
            image.dim
        )));
    }

    let mut header = String::from("mrtrix image\n");
    header.push_str(&format!(
        "dim: {}\n",
        image
            .dim
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    ));
    header.push_str(&format!(
        "vox: {}\n",
        image
            .vox
            .iter()
            .map(|&v| format_float(v))
            .collect::<Vec<_>>()
            .join(",")
    ));
    header.push_str(&format!(
        "layout: {}\n",
        (0..image.dim.len())
            .map(|a| format!("+{}", a))
            .collect::<Vec<_>>()
            .join(",")
    ));
    header.push_str(&format!("datatype: {}\n", image.datatype.as_str()));
    for row in &image.transform {
        header.push_str(&format!(
            "transform: {},{},{},{}\n",
            format_float(row[0]),
            format_float(row[1]),
            format_float(row[2]),
            format_float(row[3])
        ));
    }
    for (key, value) in &image.keyval {
        header.push_str(&format!("{}: {}\n", key, value));
    }

    // The file offset depends on the header length, which depends on the
    // number of digits in the offset; iterate until stable.
    let mut offset = header.len() + "file: . \nEND\n".len() + 1;
    loop {
        let candidate = header.len() + format!("file: . {}\nEND\n", offset).len();
        if candidate == offset {
            break;
        }
        offset = candidate;
    }
    header.push_str(&format!("file: . {}\nEND\n", offset));

    let mut buffer = Vec::with_capacity(offset + count * image.datatype.bytes_per_value());
    buffer.extend_from_slice(header.as_bytes());
    debug_assert_eq!(buffer.len(), offset);
    for &value in &image.data {
        image.datatype.write_value(value, &mut buffer);
    }
    Ok(buffer)
}

impl MifImage {
    /// Read an image from disk (.mif or .mif.gz, auto-detected by content)
    pub fn load(path: &Path) -> FixelResult<Self> {
        let bytes = fs::read(path).map_err(|e| FixelError::io(path, e))?;
        load_mif(&bytes).map_err(|e| match e {
            FixelError::InputInvalid(msg) => {
                FixelError::InputInvalid(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Write the image to disk; gzip-compresses when the path ends in .gz
    pub fn save(&self, path: &Path) -> FixelResult<()> {
        let bytes = save_mif(self)?;
        let gzip = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);
        let out = if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&bytes)
                .and_then(|_| encoder.finish())
                .map_err(|e| FixelError::io(path, e))?
        } else {
            bytes
        };
        fs::write(path, out).map_err(|e| FixelError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_image() -> MifImage {
        MifImage {
            dim: vec![2, 2, 1],
            vox: vec![1.0, 1.0, 1.0],
            transform: identity_transform(),
            datatype: Datatype::Float32LE,
            keyval: vec![("comment".to_string(), "unit test".to_string())],
            data: vec![0.5, 1.5, -2.0, 4.0],
        }
    }

    #[test]
    fn test_round_trip() {
        let image = small_image();
        let bytes = save_mif(&image).unwrap();
        let read = load_mif(&bytes).unwrap();
        assert_eq!(read.dim, vec![2, 2, 1]);
        assert_eq!(read.keyval, image.keyval);
        for (a, b) in read.data.iter().zip(image.data.iter()) {
            assert!((a - b).abs() < 1e-6, "expected {}, got {}", b, a);
        }
    }

    #[test]
    fn test_round_trip_uint32() {
        let mut image = small_image();
        image.datatype = Datatype::UInt32LE;
        image.data = vec![3.0, 0.0, 7.0, 4294967295.0];
        let read = load_mif(&save_mif(&image).unwrap()).unwrap();
        assert_eq!(read.data, image.data);
    }

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x00]));
        assert!(!is_gzip(&[0x00, 0x00, 0x00]));
        assert!(!is_gzip(&[0x1f])); // Too short
    }

    #[test]
    fn test_reordered_layout() {
        // 2x3 image stored with axis 1 varying fastest
        let header = "mrtrix image\n\
                      dim: 2,3\n\
                      vox: 1,1\n\
                      layout: +1,+0\n\
                      datatype: Float32LE\n\
                      file: . 100\nEND\n";
        let mut bytes = header.as_bytes().to_vec();
        bytes.resize(100, 0);
        // File order: (0,0),(0,1),(0,2),(1,0),(1,1),(1,2)
        for v in [0.0f32, 1.0, 2.0, 10.0, 11.0, 12.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let image = load_mif(&bytes).unwrap();
        // Canonical order: axis 0 fastest -> (0,0),(1,0),(0,1),(1,1),(0,2),(1,2)
        assert_eq!(image.data, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let bytes = b"not an image\nEND\n".to_vec();
        assert!(load_mif(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated_data() {
        let image = small_image();
        let mut bytes = save_mif(&image).unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(load_mif(&bytes).is_err());
    }
}
