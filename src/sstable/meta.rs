//! SSTable meta record: the level and item count of a run.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// Fixed facts about one SSTable, stored in its `.meta` sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    /// LSM level the table belongs to. Flushes land at 0; each compaction
    /// output is one level deeper than its inputs.
    pub level: u32,
    /// Number of entries in the data file.
    pub items: u64,
}

impl Meta {
    /// Writes the record to `path`.
    pub fn encode(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_i32::<BigEndian>(self.level as i32)?;
        w.write_i64::<BigEndian>(self.items as i64)?;
        w.flush()?;
        Ok(())
    }

    /// Reads a record previously written by [`encode`](Self::encode).
    /// Trailing bytes beyond the known fields are ignored.
    pub fn decode(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        let level = r.read_i32::<BigEndian>()?;
        let items = r.read_i64::<BigEndian>()?;
        if level < 0 || items < 0 {
            return Err(crate::corrupt!(
                "meta file {} has negative fields: level={level} items={items}",
                path.display()
            ));
        }
        Ok(Self {
            level: level as u32,
            items: items as u64,
        })
    }
}
