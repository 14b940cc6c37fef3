//! Per-SSTable membership filter.
//!
//! A bloom filter answers "might this key be in the table?" with a one-sided
//! error: `contains` can return true for an absent key (a false positive at
//! the configured rate) but never false for a present key. The read path
//! consults it before touching the data file, so a negative answer skips the
//! table without any I/O.
//!
//! Sizing: for `n` expected items and a target false-positive rate `p`, the
//! bit count `m` is found by binary search over `(0, 100n]` for the smallest
//! `m` whose predicted rate `(1 - e^(-kn/m))^k`, with `k = (m/n)·ln 2` hash
//! functions, lands within `p/10` of the target.
//!
//! Hashing: one 64-bit seahash per key, split into two 32-bit halves and
//! combined as `h1 + i·h2` for the i-th probe.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Space-efficient probabilistic set over byte strings.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    /// Bit array, packed least-significant-bit first.
    bits: Vec<u8>,
    /// Bit count.
    m: u64,
    /// Number of probes per key.
    k: u32,
}

impl BloomFilter {
    /// Constructs a filter sized for `expected_items` insertions at the
    /// given target false-positive rate.
    pub fn new(expected_items: usize, target_fpr: f64) -> Result<Self> {
        let (k, m) = optimal_km(expected_items as f64, target_fpr).ok_or_else(|| {
            Error::Config(format!(
                "unable to size filter for {expected_items} items at fpr {target_fpr}"
            ))
        })?;

        Ok(Self {
            bits: vec![0u8; (m as usize + 7) / 8],
            m,
            k,
        })
    }

    /// Records a key in the filter.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = halves(key);
        for i in 0..self.k {
            let pos = (h1 + u64::from(i) * h2) % self.m;
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    /// Returns false if the key is definitely absent, true if it may be
    /// present.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = halves(key);
        for i in 0..self.k {
            let pos = (h1 + u64::from(i) * h2) % self.m;
            if self.bits[(pos / 8) as usize] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Writes the filter to `path`: probe count, bit count, then the packed
    /// bit array.
    pub fn encode(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_i32::<LittleEndian>(self.k as i32)?;
        w.write_i64::<LittleEndian>(self.m as i64)?;
        w.write_all(&self.bits)?;
        w.flush()?;
        Ok(())
    }

    /// Reads a filter previously written by [`encode`](Self::encode).
    pub fn decode(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);

        let k = r.read_i32::<LittleEndian>()?;
        let m = r.read_i64::<LittleEndian>()?;
        if k <= 0 || m <= 0 {
            return Err(crate::corrupt!(
                "filter file {} has non-positive dimensions k={k} m={m}",
                path.display()
            ));
        }

        let mut bits = vec![0u8; (m as usize + 7) / 8];
        r.read_exact(&mut bits).map_err(|err| {
            crate::corrupt!("filter file {} truncated: {err}", path.display())
        })?;

        Ok(Self {
            bits,
            m: m as u64,
            k: k as u32,
        })
    }
}

fn halves(key: &[u8]) -> (u64, u64) {
    let h = seahash::hash(key);
    (h & 0xFFFF_FFFF, h >> 32)
}

/// Searches for the smallest bit count `m` (and derived probe count `k`)
/// whose predicted false-positive rate is within a tenth of the target.
/// Returns None when the search fails to converge, which only happens for
/// degenerate inputs (zero items).
fn optimal_km(n: f64, target_fpr: f64) -> Option<(u32, u64)> {
    let (mut lo, mut hi) = (0.0f64, 100.0 * n);

    while lo < hi {
        let m = lo + (hi - lo) / 2.0;
        let k = (m / n) * std::f64::consts::LN_2;
        let fpr = (1.0 - (-k * n / m).exp()).powf(k);

        if (target_fpr - fpr).abs() < target_fpr / 10.0 {
            return Some((k.round() as u32, m.round() as u64));
        }
        if fpr < target_fpr {
            hi = m;
        } else {
            lo = m + 1.0;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01).unwrap();
        for i in 0..1000 {
            filter.add(format!("key_{i}").as_bytes());
        }
        for i in 0..1000 {
            assert!(filter.contains(format!("key_{i}").as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::new(10_000, 0.01).unwrap();
        for i in 0..10_000 {
            filter.add(format!("key_{i}").as_bytes());
        }

        let mut false_positives = 0;
        for i in 10_000..20_000 {
            if filter.contains(format!("key_{i}").as_bytes()) {
                false_positives += 1;
            }
        }
        // Target is 1%; allow generous slack over 10k probes.
        assert!(
            false_positives < 300,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn test_sizing_scales_with_items() {
        let small = BloomFilter::new(100, 0.01).unwrap();
        let large = BloomFilter::new(100_000, 0.01).unwrap();
        assert!(large.m > small.m);
        assert!(small.k >= 1);
    }

    #[test]
    fn test_zero_items_rejected() {
        assert!(BloomFilter::new(0, 0.01).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("test.bloom");

        let mut filter = BloomFilter::new(500, 0.05).unwrap();
        for i in 0..500 {
            filter.add(format!("key_{i}").as_bytes());
        }
        filter.encode(&path).expect("encode");

        let decoded = BloomFilter::decode(&path).expect("decode");
        assert_eq!(decoded, filter);
        for i in 0..500 {
            assert!(decoded.contains(format!("key_{i}").as_bytes()));
        }
    }

    #[test]
    fn test_decode_rejects_truncated_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("short.bloom");

        let mut filter = BloomFilter::new(500, 0.01).unwrap();
        filter.add(b"key");
        filter.encode(&path).expect("encode");

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();
        assert!(BloomFilter::decode(&path).is_err());
    }
}
