use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Backing bytes for a column or id array: owned while a build or pipeline is
/// producing it, memory-mapped once it lives on disk.
pub enum Store {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        // Zero-length files (an empty shard's column) cannot be mapped.
        if file.metadata()?.len() == 0 {
            return Ok(Store::Owned(Vec::new()));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Store::Mapped(mmap))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Store::Owned(v) => v,
            Store::Mapped(m) => m,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

pub fn read_u32(data: &[u8], index: usize) -> u32 {
    let off = index * 4;
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

pub fn read_u64(data: &[u8], index: usize) -> u64 {
    let off = index * 8;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(raw)
}

pub fn read_f32(data: &[u8], index: usize) -> f32 {
    f32::from_le_bytes([
        data[index * 4],
        data[index * 4 + 1],
        data[index * 4 + 2],
        data[index * 4 + 3],
    ])
}

pub fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}
