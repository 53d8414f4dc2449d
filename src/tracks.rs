//! MRtrix track file (.tck) reading
//!
//! Track files carry a text header (same key:value layout as .mif) followed by
//! packed float triplets in scanner coordinates. A (NaN,NaN,NaN) triplet
//! terminates a streamline; (Inf,Inf,Inf) terminates the file.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek, SeekFrom};
use std::path::Path;

use crate::error::{FixelError, FixelResult};

/// One streamline: ordered scanner-space vertices (mm)
pub type Streamline = Vec<[f64; 3]>;

/// Streaming reader over the streamlines of a track file
pub struct TrackReader<R> {
    reader: R,
    /// Header key-values (lower-cased keys), e.g. "count", "step_size"
    properties: Vec<(String, String)>,
    finished: bool,
}

impl TrackReader<BufReader<File>> {
    /// Open a track file on disk
    pub fn open(path: &Path) -> FixelResult<Self> {
        let file = File::open(path).map_err(|e| FixelError::io(path, e))?;
        Self::new(BufReader::new(file))
    }
}

impl TrackReader<Cursor<Vec<u8>>> {
    /// Read tracks from an in-memory buffer
    pub fn from_bytes(bytes: Vec<u8>) -> FixelResult<Self> {
        Self::new(Cursor::new(bytes))
    }
}

impl<R: BufRead + Seek> TrackReader<R> {
    fn new(mut reader: R) -> FixelResult<Self> {
        let mut properties = Vec::new();
        let mut data_offset: Option<u64> = None;
        let mut line = Vec::new();
        let mut first = true;
        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| FixelError::io("<tracks>", e))?;
            if n == 0 {
                return Err(FixelError::InputInvalid(
                    "track file header not terminated by END".to_string(),
                ));
            }
            let text = std::str::from_utf8(&line)
                .map_err(|_| FixelError::InputInvalid("track file header is not UTF-8".into()))?
                .trim_end();
            if first {
                if text != "mrtrix tracks" {
                    return Err(FixelError::InputInvalid(format!(
                        "not an MRtrix track file (first line \"{}\")",
                        text
                    )));
                }
                first = false;
                continue;
            }
            if text == "END" {
                break;
            }
            if let Some((key, value)) = text.split_once(':') {
                let key = key.trim().to_ascii_lowercase();
                let value = value.trim().to_string();
                if key == "datatype" {
                    if value != "Float32LE" {
                        return Err(FixelError::InputInvalid(format!(
                            "unsupported track datatype \"{}\"",
                            value
                        )));
                    }
                } else if key == "file" {
                    let offset = value
                        .split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .ok_or_else(|| {
                            FixelError::InputInvalid("malformed track file offset".into())
                        })?;
                    data_offset = Some(offset);
                } else {
                    properties.push((key, value));
                }
            }
        }
        let offset = data_offset
            .ok_or_else(|| FixelError::InputInvalid("track file header missing file field".into()))?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| FixelError::io("<tracks>", e))?;
        Ok(TrackReader {
            reader,
            properties,
            finished: false,
        })
    }

    /// The value of the "count" header field, when present
    pub fn header_count(&self) -> Option<usize> {
        self.property("count").and_then(|v| v.parse().ok())
    }

    /// Look up a header property by (lower-case) key
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn read_triplet(&mut self) -> FixelResult<Option<[f32; 3]>> {
        let mut buf = [0u8; 12];
        let mut filled = 0;
        while filled < 12 {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .map_err(|e| FixelError::io("<tracks>", e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FixelError::InputInvalid(
                    "track file data truncated mid-triplet".to_string(),
                ));
            }
            filled += n;
        }
        Ok(Some([
            f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            f32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            f32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        ]))
    }
}

impl<R: BufRead + Seek> Iterator for TrackReader<R> {
    type Item = FixelResult<Streamline>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut streamline = Streamline::new();
        loop {
            match self.read_triplet() {
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Ok(None) => {
                    // EOF without the Inf sentinel: accept a trailing track
                    self.finished = true;
                    if streamline.is_empty() {
                        return None;
                    }
                    return Some(Ok(streamline));
                }
                Ok(Some(p)) => {
                    if p.iter().all(|v| v.is_infinite()) {
                        self.finished = true;
                        if streamline.is_empty() {
                            return None;
                        }
                        return Some(Ok(streamline));
                    }
                    if p.iter().all(|v| v.is_nan()) {
                        if streamline.is_empty() {
                            continue;
                        }
                        return Some(Ok(streamline));
                    }
                    streamline.push([p[0] as f64, p[1] as f64, p[2] as f64]);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_tracks(streamlines: &[Streamline], count: Option<usize>) -> Vec<u8> {
    let mut header = String::from("mrtrix tracks\ndatatype: Float32LE\n");
    if let Some(c) = count {
        header.push_str(&format!("count: {}\n", c));
    }
    let mut offset = header.len() + "file: . \nEND\n".len() + 1;
    loop {
        let candidate = header.len() + format!("file: . {}\nEND\n", offset).len();
        if candidate == offset {
            break;
        }
        offset = candidate;
    }
    header.push_str(&format!("file: . {}\nEND\n", offset));
    let mut bytes = header.into_bytes();
    let mut push = |p: [f32; 3], bytes: &mut Vec<u8>| {
        for v in p {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    };
    for streamline in streamlines {
        for &p in streamline {
            push([p[0] as f32, p[1] as f32, p[2] as f32], &mut bytes);
        }
        push([f32::NAN; 3], &mut bytes);
    }
    push([f32::INFINITY; 3], &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_two_tracks() {
        let tracks = vec![
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]],
            vec![[5.0, 5.0, 5.0], [5.0, 6.0, 5.0]],
        ];
        let reader = TrackReader::from_bytes(encode_tracks(&tracks, Some(2))).unwrap();
        assert_eq!(reader.header_count(), Some(2));
        let read: Vec<Streamline> = reader.map(|t| t.unwrap()).collect();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].len(), 3);
        assert_eq!(read[1][1], [5.0, 6.0, 5.0]);
    }

    #[test]
    fn test_missing_count() {
        let reader = TrackReader::from_bytes(encode_tracks(&[vec![[0.0; 3]]], None)).unwrap();
        assert_eq!(reader.header_count(), None);
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let bytes = b"mrtrix image\nEND\n".to_vec();
        assert!(TrackReader::from_bytes(bytes).is_err());
    }
}
