//! Entry framing for SSTable data files.
//!
//! A data file is a plain concatenation of entries, each a length-prefixed
//! key followed by a length-prefixed value:
//!
//! ```text
//! varint(len(key)) || key_bytes || varint(len(value)) || value_bytes
//! ```
//!
//! Lengths are signed zig-zag varints of 64-bit integers; a decoded negative
//! length is corruption. Keys are strictly ascending within a file, and a
//! zero-length value marks a tombstone.
//!
//! Readers come in two shapes: [`EntrySlice`] walks a byte range handed out
//! by the sparse index (the point-lookup path, which must cover only whole
//! entries), and [`EntryReader`] streams a whole file front to back (the
//! compaction input path).

use std::fs::File;
use std::io::{BufReader, Read, Write};

use crate::error::{Error, Result};

/// Longest legal encoding of a varint length prefix.
const MAX_VARINT_LEN: usize = 10;

/// Hard ceiling on a single key or value, used to reject absurd decoded
/// lengths before allocating.
const MAX_ELEMENT_LEN: i64 = 1 << 32;

/// Appends one entry to `w`, returning the number of bytes written.
pub fn write_entry<W: Write>(w: &mut W, key: &[u8], value: &[u8]) -> Result<usize> {
    Ok(write_element(w, key)? + write_element(w, value)?)
}

fn write_element<W: Write>(w: &mut W, bytes: &[u8]) -> Result<usize> {
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let n = encode_varint(bytes.len() as i64, &mut prefix);
    w.write_all(&prefix[..n])?;
    w.write_all(bytes)?;
    Ok(n + bytes.len())
}

/// Zig-zag LEB128 encoding of a signed 64-bit integer. Returns the encoded
/// length.
fn encode_varint(v: i64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut u = ((v << 1) ^ (v >> 63)) as u64;
    let mut n = 0;
    loop {
        let byte = (u & 0x7F) as u8;
        u >>= 7;
        if u == 0 {
            buf[n] = byte;
            return n + 1;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
}

/// Decodes a zig-zag varint from the front of `buf`, returning the value and
/// the number of bytes consumed.
fn decode_varint(buf: &[u8]) -> Result<(i64, usize)> {
    let mut u = 0u64;
    let mut shift = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        u |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            let v = ((u >> 1) as i64) ^ -((u & 1) as i64);
            return Ok((v, i + 1));
        }
        shift += 7;
    }
    if buf.len() < MAX_VARINT_LEN {
        Err(crate::corrupt!("truncated length prefix"))
    } else {
        Err(crate::corrupt!("length prefix overruns 10 bytes"))
    }
}

/// Iterator over a contiguous byte range of complete entries.
///
/// The range comes from the sparse index, which only hands out checkpoint
/// boundaries, so a partial trailing entry is corruption rather than a
/// normal end condition.
pub struct EntrySlice<'a> {
    buf: &'a [u8],
}

impl<'a> EntrySlice<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_element(&mut self) -> Result<&'a [u8]> {
        let (len, n) = decode_varint(self.buf)?;
        if len < 0 {
            return Err(crate::corrupt!("negative element length {len}"));
        }
        if len > MAX_ELEMENT_LEN {
            return Err(crate::corrupt!("absurd element length {len}"));
        }
        let len = len as usize;
        if self.buf.len() < n + len {
            return Err(crate::corrupt!(
                "entry truncated: need {} bytes, have {}",
                n + len,
                self.buf.len()
            ));
        }
        let element = &self.buf[n..n + len];
        self.buf = &self.buf[n + len..];
        Ok(element)
    }
}

impl<'a> Iterator for EntrySlice<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let key = match self.read_element() {
            Ok(key) => key,
            Err(err) => return Some(Err(err)),
        };
        let value = match self.read_element() {
            Ok(value) => value,
            Err(err) => return Some(Err(err)),
        };
        Some(Ok((key, value)))
    }
}

/// Streaming reader over a whole data file, used as compaction input.
pub struct EntryReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl EntryReader {
    /// Opens a reader over `file`, which must span exactly `file_size` bytes
    /// of complete entries.
    pub fn new(file: File, file_size: u64) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, file),
            remaining: file_size,
        }
    }

    fn read_element(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; MAX_VARINT_LEN];
        let take = (self.remaining as usize).min(MAX_VARINT_LEN);
        let mut filled = 0;
        let mut len_and_n = None;
        while filled < take {
            self.reader.read_exact(&mut prefix[filled..filled + 1])?;
            filled += 1;
            if prefix[filled - 1] & 0x80 == 0 {
                len_and_n = Some(decode_varint(&prefix[..filled])?);
                break;
            }
        }
        let (len, n) = len_and_n.ok_or_else(|| crate::corrupt!("truncated length prefix"))?;
        if len < 0 {
            return Err(crate::corrupt!("negative element length {len}"));
        }
        if len > MAX_ELEMENT_LEN {
            return Err(crate::corrupt!("absurd element length {len}"));
        }
        if self.remaining < (n as u64) + (len as u64) {
            return Err(crate::corrupt!("entry truncated at end of file"));
        }

        let mut bytes = vec![0u8; len as usize];
        self.reader.read_exact(&mut bytes)?;
        self.remaining -= n as u64 + len as u64;
        Ok(bytes)
    }
}

impl Iterator for EntryReader {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let key = match self.read_element() {
            Ok(key) => key,
            Err(err) => return Some(Err(err)),
        };
        let value = match self.read_element() {
            Ok(value) => value,
            Err(err) => return Some(Err(err)),
        };
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_varint_roundtrip() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for v in [0i64, 1, 2, 127, 128, 300, 65_536, i64::MAX, -1, i64::MIN] {
            let n = encode_varint(v, &mut buf);
            let (decoded, consumed) = decode_varint(&buf[..n]).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn test_small_lengths_encode_compactly() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(encode_varint(0, &mut buf), 1);
        assert_eq!(encode_varint(63, &mut buf), 1);
        assert_eq!(encode_varint(64, &mut buf), 2);
    }

    #[test]
    fn test_write_then_iterate_slice() {
        let mut buf = Vec::new();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key_{i:03}").into_bytes(),
                    format!("val_{i}").into_bytes(),
                )
            })
            .collect();

        let mut written = 0;
        for (k, v) in &entries {
            written += write_entry(&mut buf, k, v).unwrap();
        }
        assert_eq!(written, buf.len());

        let decoded: Vec<_> = EntrySlice::new(&buf)
            .map(|e| {
                let (k, v) = e.unwrap();
                (k.to_vec(), v.to_vec())
            })
            .collect();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_tombstone_entry_roundtrips() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"gone", b"").unwrap();

        let mut iter = EntrySlice::new(&buf);
        let (k, v) = iter.next().unwrap().unwrap();
        assert_eq!(k, b"gone");
        assert!(v.is_empty());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_truncated_entry_is_corruption() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"key", b"value").unwrap();
        buf.truncate(buf.len() - 2);

        let result: Result<Vec<_>> = EntrySlice::new(&buf).collect();
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_negative_length_is_corruption() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let n = encode_varint(-5, &mut buf);
        let result: Result<Vec<_>> = EntrySlice::new(&buf[..n]).collect();
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_file_reader_streams_all_entries() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("stream.data");

        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..1000)
            .map(|i| {
                (
                    format!("key_{i:04}").into_bytes(),
                    format!("val_{i:04}").into_bytes(),
                )
            })
            .collect();

        let mut buf = Vec::new();
        for (k, v) in &entries {
            write_entry(&mut buf, k, v).unwrap();
        }
        std::fs::write(&path, &buf).unwrap();

        let reader = EntryReader::new(std::fs::File::open(&path).unwrap(), buf.len() as u64);
        let decoded: Vec<_> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_file_reader_rejects_truncation() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("trunc.data");

        let mut buf = Vec::new();
        write_entry(&mut buf, b"key", b"a_longer_value").unwrap();
        std::fs::write(&path, &buf).unwrap();

        // Claim more bytes than the file holds.
        let reader = EntryReader::new(std::fs::File::open(&path).unwrap(), buf.len() as u64 + 4);
        let result: Result<Vec<_>> = reader.collect();
        assert!(result.is_err());
    }
}
