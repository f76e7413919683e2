//! Rank/select bitvector backing the level-ordered trie layout.
//!
//! The vector is stored as little-endian u64 words with a small rank
//! directory (one cumulative count per 512-bit block) rebuilt at open time.
//! `select` answers are found by binary search over the directory followed by
//! a word scan, which is plenty for the access pattern here: one select per
//! trie step.

use anyhow::{bail, Result};
use std::io::Write;

const BLOCK_WORDS: usize = 8;

const MAGIC: u32 = 0x5347_4256; // "SGBV"
const VERSION: u32 = 1;

#[derive(Debug)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
    // blocks[i] = number of set bits in words[..i * BLOCK_WORDS]
    blocks: Vec<u64>,
    total_ones: usize,
}

impl BitVec {
    pub fn new() -> Self {
        BitVec {
            words: Vec::new(),
            len: 0,
            blocks: Vec::new(),
            total_ones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_ones(&self) -> usize {
        self.total_ones
    }

    pub fn count_zeros(&self) -> usize {
        self.len - self.total_ones
    }

    pub fn push(&mut self, bit: bool) {
        let word = self.len / 64;
        if word == self.words.len() {
            self.words.push(0);
        }
        if bit {
            self.words[word] |= 1u64 << (self.len % 64);
            self.total_ones += 1;
        }
        self.len += 1;
        // The directory is rebuilt lazily; pushing invalidates it.
        self.blocks.clear();
    }

    /// Rebuild the rank directory. Must be called after the last `push`
    /// before any rank or select query.
    pub fn freeze(&mut self) {
        let nblocks = self.words.len() / BLOCK_WORDS + 1;
        self.blocks = Vec::with_capacity(nblocks + 1);
        self.blocks.push(0);
        let mut acc = 0u64;
        for (i, w) in self.words.iter().enumerate() {
            acc += w.count_ones() as u64;
            if (i + 1) % BLOCK_WORDS == 0 {
                self.blocks.push(acc);
            }
        }
        if self.words.len() % BLOCK_WORDS != 0 {
            self.blocks.push(acc);
        }
    }

    pub fn get(&self, i: usize) -> bool {
        self.words[i / 64] >> (i % 64) & 1 == 1
    }

    /// Number of set bits in `[0, i)`.
    pub fn rank1(&self, i: usize) -> usize {
        debug_assert!(!self.blocks.is_empty(), "freeze() before rank queries");
        debug_assert!(i <= self.len);
        let word = i / 64;
        let block = word / BLOCK_WORDS;
        let mut acc = self.blocks[block.min(self.blocks.len() - 1)] as usize;
        for w in &self.words[block * BLOCK_WORDS..word] {
            acc += w.count_ones() as usize;
        }
        let rem = i % 64;
        if rem > 0 && word < self.words.len() {
            acc += (self.words[word] & ((1u64 << rem) - 1)).count_ones() as usize;
        }
        acc
    }

    /// Number of clear bits in `[0, i)`.
    pub fn rank0(&self, i: usize) -> usize {
        i - self.rank1(i)
    }

    /// Bit index of the k-th set bit (k >= 1), or None.
    pub fn select1(&self, k: usize) -> Option<usize> {
        if k == 0 || k > self.total_ones {
            return None;
        }
        // Last block whose cumulative count is still below k.
        let mut lo = 0usize;
        let mut hi = self.blocks.len() - 1;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if (self.blocks[mid] as usize) < k {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let mut rem = k - self.blocks[lo] as usize;
        for (i, w) in self.words[lo * BLOCK_WORDS..].iter().enumerate() {
            let ones = w.count_ones() as usize;
            if rem <= ones {
                return Some((lo * BLOCK_WORDS + i) * 64 + select_in_word(*w, rem));
            }
            rem -= ones;
        }
        None
    }

    /// Bit index of the k-th clear bit (k >= 1), or None.
    pub fn select0(&self, k: usize) -> Option<usize> {
        if k == 0 || k > self.count_zeros() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.blocks.len() - 1;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let zeros = mid * BLOCK_WORDS * 64 - self.blocks[mid] as usize;
            if zeros < k {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let mut rem = k - (lo * BLOCK_WORDS * 64 - self.blocks[lo] as usize);
        for (i, w) in self.words[lo * BLOCK_WORDS..].iter().enumerate() {
            let zeros = w.count_zeros() as usize;
            if rem <= zeros {
                let pos = (lo * BLOCK_WORDS + i) * 64 + select_in_word(!*w, rem);
                // Zeros past the logical end are padding, not content.
                return if pos < self.len { Some(pos) } else { None };
            }
            rem -= zeros;
        }
        None
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&(self.len as u64).to_le_bytes())?;
        for w in &self.words {
            out.write_all(&w.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn from_bytes(data: &[u8]) -> Result<BitVec> {
        if data.len() < 16 {
            bail!("bitvector file truncated");
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if magic != MAGIC {
            bail!("bad bitvector magic: {magic:#x}");
        }
        if version != VERSION {
            bail!("unsupported bitvector version: {version}");
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[8..16]);
        let len = u64::from_le_bytes(raw) as usize;
        let nwords = (len + 63) / 64;
        if data.len() < 16 + nwords * 8 {
            bail!("bitvector file truncated: {} bits", len);
        }
        let mut words = Vec::with_capacity(nwords);
        let mut total_ones = 0usize;
        for i in 0..nwords {
            raw.copy_from_slice(&data[16 + i * 8..24 + i * 8]);
            let w = u64::from_le_bytes(raw);
            total_ones += w.count_ones() as usize;
            words.push(w);
        }
        let mut v = BitVec {
            words,
            len,
            blocks: Vec::new(),
            total_ones,
        };
        v.freeze();
        Ok(v)
    }

    pub fn byte_size(&self) -> u64 {
        16 + self.words.len() as u64 * 8 + self.blocks.len() as u64 * 8
    }
}

impl Default for BitVec {
    fn default() -> Self {
        BitVec::new()
    }
}

impl PartialEq for BitVec {
    fn eq(&self, other: &BitVec) -> bool {
        self.len == other.len && self.words == other.words
    }
}

/// Index of the k-th set bit inside one word (k >= 1, guaranteed present).
fn select_in_word(mut w: u64, k: usize) -> usize {
    for _ in 1..k {
        w &= w - 1;
    }
    w.trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
    use super::BitVec;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn from_bits(bits: &[bool]) -> BitVec {
        let mut v = BitVec::new();
        for &b in bits {
            v.push(b);
        }
        v.freeze();
        v
    }

    #[test]
    fn rank_select_small() {
        // 0 1 1 0 1 0 0 0: root with two children, one grandchild.
        let v = from_bits(&[false, true, true, false, true, false, false, false]);
        assert_eq!(v.count_ones(), 3);
        assert_eq!(v.count_zeros(), 5);
        assert_eq!(v.rank1(0), 0);
        assert_eq!(v.rank1(3), 2);
        assert_eq!(v.rank1(8), 3);
        assert_eq!(v.rank0(4), 2);
        assert_eq!(v.select1(1), Some(1));
        assert_eq!(v.select1(3), Some(4));
        assert_eq!(v.select1(4), None);
        assert_eq!(v.select0(1), Some(0));
        assert_eq!(v.select0(2), Some(3));
        assert_eq!(v.select0(5), Some(7));
        assert_eq!(v.select0(6), None);
    }

    #[test]
    fn rank_select_matches_naive() {
        let mut rng = StdRng::seed_from_u64(7);
        let bits: Vec<bool> = (0..2500).map(|_| rng.gen_bool(0.7)).collect();
        let v = from_bits(&bits);

        let mut ones = 0usize;
        for (i, &b) in bits.iter().enumerate() {
            assert_eq!(v.rank1(i), ones, "rank1({i})");
            assert_eq!(v.rank0(i), i - ones, "rank0({i})");
            if b {
                ones += 1;
                assert_eq!(v.select1(ones), Some(i), "select1({ones})");
            } else {
                assert_eq!(v.select0(i - ones + 1), Some(i), "select0");
            }
        }
        assert_eq!(v.rank1(bits.len()), ones);
    }

    #[test]
    fn roundtrip_serialization() {
        let mut rng = StdRng::seed_from_u64(13);
        let bits: Vec<bool> = (0..777).map(|_| rng.gen_bool(0.4)).collect();
        let v = from_bits(&bits);
        let mut raw = Vec::new();
        v.write_to(&mut raw).unwrap();
        let w = BitVec::from_bytes(&raw).unwrap();
        assert_eq!(v, w);
        assert_eq!(w.select1(1), v.select1(1));
    }

    #[test]
    fn empty_vector() {
        let mut v = BitVec::new();
        v.freeze();
        assert_eq!(v.select0(1), None);
        assert_eq!(v.select1(1), None);
        assert_eq!(v.rank1(0), 0);
    }
}
