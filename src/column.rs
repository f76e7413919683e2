//! Shard data columns addressed by trie node position.
//!
//! A column stores positions `[offset, offset + len)`. Shard 0 stores from
//! position 1; every other shard starts at its first bigram position, because
//! unigram data is global and served from shard 0 only. Addressing below the
//! offset is refused here; the model layer performs the shard-0 redirect.

use crate::stats::Stat;
use crate::storage::{push_f32, read_f32, read_u64, Store};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Reserved bit pattern meaning "absent"; never appears in a returned score.
pub const LOGPROB_MIN: f32 = f32::MIN;

pub const CODEBOOK_SIZE: usize = 256;

pub struct FloatColumn {
    offset: usize,
    floats: Option<Store>,
    codes: Option<Store>,
    /// One 256-entry codebook per order (slot 0 unused). Entry 0 of every
    /// book decodes to `LOGPROB_MIN`.
    pub books: Vec<[f32; CODEBOOK_SIZE]>,
}

impl FloatColumn {
    pub fn raw(offset: usize, store: Store) -> FloatColumn {
        FloatColumn {
            offset,
            floats: Some(store),
            codes: None,
            books: Vec::new(),
        }
    }

    pub fn quantized(
        offset: usize,
        codes: Store,
        books: Vec<[f32; CODEBOOK_SIZE]>,
    ) -> FloatColumn {
        FloatColumn {
            offset,
            floats: None,
            codes: Some(codes),
            books,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        match (&self.floats, &self.codes) {
            (Some(f), _) => f.len() / 4,
            (_, Some(c)) => c.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_quantized(&self) -> bool {
        self.codes.is_some()
    }

    pub fn value(&self, pos: usize, order: usize) -> f32 {
        assert!(
            pos >= self.offset,
            "position {pos} below column offset {}; unigram reads go to shard 0",
            self.offset
        );
        let i = pos - self.offset;
        if let Some(codes) = &self.codes {
            self.books[order][codes.bytes()[i] as usize]
        } else {
            read_f32(self.floats.as_ref().unwrap().bytes(), i)
        }
    }

    pub fn open_raw(path: &Path, offset: usize, expected: usize) -> Result<FloatColumn> {
        let store = Store::open(path)?;
        if store.len() != expected * 4 {
            bail!(
                "column {}: {} bytes, expected {} floats",
                path.display(),
                store.len(),
                expected
            );
        }
        Ok(FloatColumn::raw(offset, store))
    }

    pub fn open_quantized(
        path: &Path,
        offset: usize,
        expected: usize,
        order: usize,
    ) -> Result<FloatColumn> {
        let codes = Store::open(path)?;
        if codes.len() != expected {
            bail!(
                "column {}: {} bytes, expected {} codes",
                path.display(),
                codes.len(),
                expected
            );
        }
        let book_path = codebook_path(path);
        let books = read_codebooks(&book_path, order)?;
        Ok(FloatColumn::quantized(offset, codes, books))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        );
        match (&self.floats, &self.codes) {
            (Some(f), _) => out.write_all(f.bytes())?,
            (_, Some(c)) => out.write_all(c.bytes())?,
            _ => {}
        }
        out.flush()?;
        if self.is_quantized() {
            write_codebooks(&codebook_path(path), &self.books)?;
        }
        Ok(())
    }

    pub fn stat(&self) -> Stat {
        let stored = match (&self.floats, &self.codes) {
            (Some(f), _) => f.len() as u64,
            (_, Some(c)) => c.len() as u64 + self.books.len() as u64 * CODEBOOK_SIZE as u64 * 4,
            _ => 0,
        };
        Stat::new(self.len() as u64 * 4, stored, 0)
    }

    pub fn stored_bytes(&self) -> &[u8] {
        match (&self.floats, &self.codes) {
            (Some(f), _) => f.bytes(),
            (_, Some(c)) => c.bytes(),
            _ => &[],
        }
    }
}

impl PartialEq for FloatColumn {
    fn eq(&self, other: &FloatColumn) -> bool {
        self.offset == other.offset
            && self.is_quantized() == other.is_quantized()
            && self.stored_bytes() == other.stored_bytes()
            && self.books == other.books
    }
}

pub struct CountColumn {
    offset: usize,
    data: Store,
}

impl CountColumn {
    pub fn new(offset: usize, data: Store) -> CountColumn {
        CountColumn { offset, data }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len() / 8
    }

    pub fn value(&self, pos: usize) -> u64 {
        assert!(
            pos >= self.offset,
            "position {pos} below column offset {}; unigram reads go to shard 0",
            self.offset
        );
        read_u64(self.data.bytes(), pos - self.offset)
    }

    pub fn open(path: &Path, offset: usize, expected: usize) -> Result<CountColumn> {
        let data = Store::open(path)?;
        if data.len() != expected * 8 {
            bail!(
                "column {}: {} bytes, expected {} counts",
                path.display(),
                data.len(),
                expected
            );
        }
        Ok(CountColumn { offset, data })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(self.data.bytes())?;
        out.flush()?;
        Ok(())
    }

    pub fn stat(&self) -> Stat {
        Stat::new(self.data.len() as u64, self.data.len() as u64, 0)
    }

    pub fn stored_bytes(&self) -> &[u8] {
        self.data.bytes()
    }
}

impl PartialEq for CountColumn {
    fn eq(&self, other: &CountColumn) -> bool {
        self.offset == other.offset && self.data.bytes() == other.data.bytes()
    }
}

/// Reducer finalization: write the values to a temporary file, fsync, and
/// reopen memory-mapped, so the in-memory handle can be swapped atomically.
pub fn finalize_floats(offset: usize, values: &[f32], tag: &str) -> Result<FloatColumn> {
    if values.is_empty() {
        return Ok(FloatColumn::raw(offset, Store::Owned(Vec::new())));
    }
    let path = crate::tempdir::file_name(tag);
    let mut raw = Vec::with_capacity(values.len() * 4);
    for v in values {
        push_f32(&mut raw, *v);
    }
    {
        let mut file = File::create(&path)?;
        file.write_all(&raw)?;
        file.sync_all()?;
    }
    Ok(FloatColumn::raw(offset, Store::open(&path)?))
}

pub fn finalize_counts(offset: usize, values: &[u64], tag: &str) -> Result<CountColumn> {
    if values.is_empty() {
        return Ok(CountColumn::new(offset, Store::Owned(Vec::new())));
    }
    let path = crate::tempdir::file_name(tag);
    let mut raw = Vec::with_capacity(values.len() * 8);
    for v in values {
        raw.extend_from_slice(&v.to_le_bytes());
    }
    {
        let mut file = File::create(&path)?;
        file.write_all(&raw)?;
        file.sync_all()?;
    }
    Ok(CountColumn::new(offset, Store::open(&path)?))
}

pub fn codebook_path(column: &Path) -> std::path::PathBuf {
    let mut name = column.file_name().unwrap_or_default().to_os_string();
    name.push(".codebook");
    column.with_file_name(name)
}

pub fn write_codebooks(path: &Path, books: &[[f32; CODEBOOK_SIZE]]) -> Result<()> {
    let mut raw = Vec::with_capacity(books.len() * CODEBOOK_SIZE * 4);
    for book in books {
        for v in book {
            push_f32(&mut raw, *v);
        }
    }
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&raw)?;
    out.flush()?;
    Ok(())
}

pub fn read_codebooks(path: &Path, order: usize) -> Result<Vec<[f32; CODEBOOK_SIZE]>> {
    let store = Store::open(path)?;
    let expected = (order + 1) * CODEBOOK_SIZE * 4;
    if store.len() != expected {
        bail!(
            "codebook {}: {} bytes, expected {}",
            path.display(),
            store.len(),
            expected
        );
    }
    let data = store.bytes();
    let mut books = Vec::with_capacity(order + 1);
    for k in 0..=order {
        let mut book = [0.0f32; CODEBOOK_SIZE];
        for (i, slot) in book.iter_mut().enumerate() {
            *slot = read_f32(data, k * CODEBOOK_SIZE + i);
        }
        books.push(book);
    }
    Ok(books)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::push_u64;

    #[test]
    fn raw_column_reads_with_offset() {
        let mut raw = Vec::new();
        push_f32(&mut raw, -1.5);
        push_f32(&mut raw, -0.25);
        let col = FloatColumn::raw(5, Store::Owned(raw));
        assert_eq!(col.len(), 2);
        assert_eq!(col.value(5, 2), -1.5);
        assert_eq!(col.value(6, 2), -0.25);
    }

    #[test]
    #[should_panic(expected = "below column offset")]
    fn refuses_reads_below_offset() {
        let mut raw = Vec::new();
        push_f32(&mut raw, -1.5);
        let col = FloatColumn::raw(5, Store::Owned(raw));
        col.value(4, 2);
    }

    #[test]
    fn quantized_column_decodes_through_codebook() {
        let mut book = [0.0f32; CODEBOOK_SIZE];
        book[0] = LOGPROB_MIN;
        book[1] = -2.0;
        book[2] = -1.0;
        let books = vec![[0.0; CODEBOOK_SIZE], [0.0; CODEBOOK_SIZE], book];
        let col = FloatColumn::quantized(1, Store::Owned(vec![1, 2, 0]), books);
        assert_eq!(col.value(1, 2), -2.0);
        assert_eq!(col.value(2, 2), -1.0);
        assert_eq!(col.value(3, 2), LOGPROB_MIN);
    }

    #[test]
    fn count_column_reads_u64() {
        let mut raw = Vec::new();
        push_u64(&mut raw, 42);
        push_u64(&mut raw, 7);
        let col = CountColumn::new(1, Store::Owned(raw));
        assert_eq!(col.value(1), 42);
        assert_eq!(col.value(2), 7);
    }
}
