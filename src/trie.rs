//! Per-shard succinct trie: a level-ordered children bitvector plus a packed
//! id column.
//!
//! The `positions` bitvector starts with a single 0, then one run `1^k 0` per
//! node in level order, where k is the node's child count. Node positions are
//! the 1-bit ordinals, so the root is 0 and `ids[pos]` is the label on the
//! edge into `pos`. Depth-1 always holds the whole vocabulary in id order on
//! every shard (unigram positions are `1 + id` everywhere, their data lives
//! on shard 0 only); deeper levels hold exactly the paths of the n-grams the
//! shard owns, with structural nodes filling in prefixes owned elsewhere.

use crate::storage::{push_u32, read_u32, Store};
use crate::succinct::BitVec;
use crate::vocab::WordId;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Returned by `next` and `parent` when there is no such node.
pub const NO_NODE: usize = usize::MAX;

pub struct TrieShard {
    pub positions: BitVec,
    ids: Store,
    pub offsets: Vec<u64>,
    pub order: usize,
    pub backward: bool,
}

#[derive(Serialize, Deserialize)]
struct TrieMeta {
    order: usize,
    backward: bool,
    offsets: Vec<u64>,
}

impl TrieShard {
    pub fn node_count(&self) -> usize {
        self.offsets[self.order] as usize
    }

    /// Number of depth-1 nodes, i.e. the vocabulary size at build time.
    pub fn unigram_count(&self) -> usize {
        self.offsets[1] as usize - 1
    }

    pub fn word_id(&self, pos: usize) -> WordId {
        debug_assert!(pos >= 1 && pos < self.node_count());
        read_u32(self.ids.bytes(), pos)
    }

    /// The half-open position interval holding the children of `n`.
    pub fn children_range(&self, n: usize) -> (usize, usize) {
        let count = self.node_count();
        match (self.positions.select0(n + 1), self.positions.select0(n + 2)) {
            (Some(s1), Some(s2)) => (s1 - n + 1, s2 - n),
            // Deepest-level nodes have no recorded run.
            _ => (count, count),
        }
    }

    pub fn parent(&self, n: usize) -> usize {
        if n == 0 {
            return NO_NODE;
        }
        match self.positions.select1(n) {
            Some(p) => self.positions.rank0(p) - 1,
            None => NO_NODE,
        }
    }

    /// Child of `n` along edge `id`, or `NO_NODE`. Sibling ids are strictly
    /// sorted, so this is a binary search; from the root it is a direct index
    /// because depth-1 holds every word in id order.
    pub fn next(&self, n: usize, id: WordId) -> usize {
        if n == 0 {
            let pos = 1 + id as usize;
            if pos < self.offsets[1] as usize {
                return pos;
            }
            return NO_NODE;
        }
        let (mut lo, mut hi) = self.children_range(n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.word_id(mid).cmp(&id) {
                std::cmp::Ordering::Equal => return mid,
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        NO_NODE
    }

    /// Successive `next` calls from the root. Returns the last node reached
    /// and how many ids were consumed.
    pub fn traverse(&self, ids: &[WordId]) -> (usize, usize) {
        let mut node = 0usize;
        for (i, &id) in ids.iter().enumerate() {
            let child = self.next(node, id);
            if child == NO_NODE {
                return (node, i);
            }
            node = child;
        }
        (node, ids.len())
    }

    /// Node for the full context, or None if any step is missing.
    pub fn find(&self, ids: &[WordId]) -> Option<usize> {
        let (node, consumed) = self.traverse(ids);
        if consumed == ids.len() {
            Some(node)
        } else {
            None
        }
    }

    /// Depth of `n`: 0 for the root, k for an order-k context.
    pub fn order_of(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        for k in 1..=self.order {
            if (n as u64) < self.offsets[k] {
                return k;
            }
        }
        self.order
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut pos_out = BufWriter::new(File::create(dir.join("positions.bits"))?);
        self.positions.write_to(&mut pos_out)?;
        pos_out.flush()?;

        let mut ids_out = BufWriter::new(File::create(dir.join("ids.bin"))?);
        ids_out.write_all(self.ids.bytes())?;
        ids_out.flush()?;

        let meta = TrieMeta {
            order: self.order,
            backward: self.backward,
            offsets: self.offsets.clone(),
        };
        let mut meta_out = BufWriter::new(File::create(dir.join("meta.json"))?);
        serde_json::to_writer(&mut meta_out, &meta)?;
        meta_out.flush()?;
        Ok(())
    }

    pub fn open(dir: &Path) -> Result<TrieShard> {
        let meta_file = File::open(dir.join("meta.json"))
            .with_context(|| format!("failed to open {}", dir.join("meta.json").display()))?;
        let meta: TrieMeta = serde_json::from_reader(meta_file)?;
        if meta.offsets.len() != meta.order + 1 {
            bail!(
                "index {}: {} offsets for order {}",
                dir.display(),
                meta.offsets.len(),
                meta.order
            );
        }
        if meta.offsets[0] != 1 || meta.offsets.windows(2).any(|w| w[0] > w[1]) {
            bail!("index {}: offsets are not monotone from 1", dir.display());
        }

        let pos_store = Store::open(&dir.join("positions.bits"))?;
        let positions = BitVec::from_bytes(pos_store.bytes())?;
        let ids = Store::open(&dir.join("ids.bin"))?;
        let node_count = *meta.offsets.last().unwrap() as usize;
        if positions.count_ones() + 1 != node_count {
            bail!(
                "index {}: bitvector describes {} nodes, offsets describe {}",
                dir.display(),
                positions.count_ones() + 1,
                node_count
            );
        }
        if ids.len() != node_count * 4 {
            bail!(
                "index {}: id column holds {} bytes for {} nodes",
                dir.display(),
                ids.len(),
                node_count
            );
        }
        Ok(TrieShard {
            positions,
            ids,
            offsets: meta.offsets,
            order: meta.order,
            backward: meta.backward,
        })
    }

    pub fn ids_bytes(&self) -> &[u8] {
        self.ids.bytes()
    }

    /// Edge labels from `pos` up to the root, deepest first.
    pub fn path_up(&self, mut pos: usize) -> Vec<WordId> {
        let mut out = Vec::new();
        while pos != 0 {
            out.push(self.word_id(pos));
            pos = self.parent(pos);
        }
        out
    }

    /// Edge labels from the root down to `pos`, i.e. the stored context.
    pub fn path_to(&self, pos: usize) -> Vec<WordId> {
        let mut out = self.path_up(pos);
        out.reverse();
        out
    }
}

impl PartialEq for TrieShard {
    fn eq(&self, other: &TrieShard) -> bool {
        self.order == other.order
            && self.backward == other.backward
            && self.offsets == other.offsets
            && self.positions == other.positions
            && self.ids.bytes() == other.ids.bytes()
    }
}

/// FNV-1a over the id's little-endian bytes; stable across runs and builds.
pub fn hash_id(id: WordId) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for b in id.to_le_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Owning shard of a context: the hash of its newest word modulo the shard
/// count. Forward contexts end with their newest word, backward contexts
/// start with it. Unigrams always live on shard 0.
pub fn shard_index(ids: &[WordId], backward: bool, shard_count: usize) -> usize {
    if ids.len() <= 1 {
        return 0;
    }
    let key = if backward { ids[0] } else { ids[ids.len() - 1] };
    (hash_id(key) % shard_count as u64) as usize
}

/// Level-by-level trie assembly, used by the backward reducer and the model
/// builder. Children must arrive grouped per parent, parents in increasing
/// position order, sibling ids strictly sorted.
pub struct TrieBuilder {
    ids: Vec<WordId>,
    positions: BitVec,
    offsets: Vec<u64>,
    // children_range per completed node, so prefixes can be located while
    // later levels are still arriving
    ranges: Vec<(usize, usize)>,
    level_first: Vec<usize>,
    level_last: Vec<usize>,
    last_parent: Option<usize>,
}

impl TrieBuilder {
    pub fn new(unigrams: usize) -> TrieBuilder {
        let mut ids = Vec::with_capacity(unigrams + 1);
        ids.push(0);
        for w in 0..unigrams {
            ids.push(w as WordId);
        }
        let mut positions = BitVec::new();
        positions.push(false);
        for _ in 0..unigrams {
            positions.push(true);
        }
        positions.push(false);
        let mut ranges = vec![(0usize, 0usize); unigrams + 1];
        ranges[0] = (1, unigrams + 1);
        TrieBuilder {
            ids,
            positions,
            offsets: vec![1, 1 + unigrams as u64],
            ranges,
            level_first: Vec::new(),
            level_last: Vec::new(),
            last_parent: None,
        }
    }

    /// Node for a stored path over the levels built so far.
    pub fn locate(&self, path: &[WordId]) -> Option<usize> {
        let mut node = 0usize;
        for &id in path {
            let (mut lo, mut hi) = self.ranges[node];
            let mut found = NO_NODE;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match self.ids[mid].cmp(&id) {
                    std::cmp::Ordering::Equal => {
                        found = mid;
                        break;
                    }
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Greater => hi = mid,
                }
            }
            if found == NO_NODE {
                return None;
            }
            node = found;
        }
        Some(node)
    }

    fn parent_level_base(&self) -> usize {
        self.offsets[self.offsets.len() - 2] as usize
    }

    pub fn begin_level(&mut self) {
        let parents =
            (self.offsets[self.offsets.len() - 1] - self.offsets[self.offsets.len() - 2]) as usize;
        self.level_first = vec![0; parents];
        self.level_last = vec![0; parents];
        self.last_parent = None;
    }

    pub fn add_children(&mut self, parent: usize, children: &[WordId]) -> Result<()> {
        let base = self.parent_level_base();
        let end = self.offsets[self.offsets.len() - 1] as usize;
        if parent < base || parent >= end {
            bail!("parent {parent} outside level [{base}, {end})");
        }
        let index = parent - base;
        if let Some(prev) = self.last_parent {
            if index <= prev {
                bail!("children for parent {parent} arrived out of order");
            }
        }
        if children.windows(2).any(|w| w[0] >= w[1]) {
            bail!("sibling ids under parent {parent} are not strictly sorted");
        }
        self.last_parent = Some(index);
        self.level_first[index] = self.ids.len();
        self.ranges[parent] = (self.ids.len(), self.ids.len() + children.len());
        self.ids.extend_from_slice(children);
        for _ in children {
            self.ranges.push((0, 0));
        }
        self.level_last[index] = self.ids.len();
        Ok(())
    }

    pub fn end_level(&mut self) {
        for i in 0..self.level_first.len() {
            for _ in self.level_first[i]..self.level_last[i] {
                self.positions.push(true);
            }
            self.positions.push(false);
        }
        self.offsets.push(self.ids.len() as u64);
        self.level_first.clear();
        self.level_last.clear();
    }

    pub fn finish(mut self, order: usize, backward: bool) -> Result<TrieShard> {
        if self.offsets.len() != order + 1 {
            bail!(
                "built {} levels for order {}",
                self.offsets.len() - 1,
                order
            );
        }
        self.positions.freeze();
        let mut raw = Vec::with_capacity(self.ids.len() * 4);
        for id in &self.ids {
            push_u32(&mut raw, *id);
        }
        Ok(TrieShard {
            positions: self.positions,
            ids: Store::Owned(raw),
            offsets: self.offsets,
            order,
            backward,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Vocabulary of 4 words; bigrams (0,2), (1,0), (1,3); trigram (1,0,2).
    fn sample() -> TrieShard {
        let mut b = TrieBuilder::new(4);
        b.begin_level();
        b.add_children(1, &[2]).unwrap();
        b.add_children(2, &[0, 3]).unwrap();
        b.end_level();
        b.begin_level();
        b.add_children(6, &[2]).unwrap();
        b.end_level();
        b.finish(3, false).unwrap()
    }

    #[test]
    fn traverse_reaches_every_path() {
        let t = sample();
        assert_eq!(t.node_count(), 9);
        assert_eq!(t.offsets, vec![1, 5, 8, 9]);

        assert_eq!(t.find(&[0]), Some(1));
        assert_eq!(t.find(&[3]), Some(4));
        assert_eq!(t.find(&[0, 2]), Some(5));
        assert_eq!(t.find(&[1, 0]), Some(6));
        assert_eq!(t.find(&[1, 3]), Some(7));
        assert_eq!(t.find(&[1, 0, 2]), Some(8));
        assert_eq!(t.find(&[2, 0]), None);
        assert_eq!(t.find(&[1, 0, 3]), None);

        let (node, consumed) = t.traverse(&[1, 0, 3]);
        assert_eq!((node, consumed), (6, 2));
    }

    #[test]
    fn parent_inverts_next() {
        let t = sample();
        for n in 1..t.node_count() {
            let p = t.parent(n);
            assert_ne!(p, NO_NODE);
            let (first, last) = t.children_range(p);
            assert!(first <= n && n < last, "node {n} not in parent {p} range");
            assert_eq!(t.next(p, t.word_id(n)), n);
        }
        assert_eq!(t.parent(0), NO_NODE);
    }

    #[test]
    fn children_ranges_partition_each_level() {
        let t = sample();
        for k in 1..t.order {
            let (lo, hi) = (t.offsets[k] as usize, t.offsets[k + 1] as usize);
            let mut covered = Vec::new();
            for n in t.offsets[k - 1] as usize..t.offsets[k] as usize {
                let (first, last) = t.children_range(n);
                covered.extend(first..last);
            }
            assert_eq!(covered, (lo..hi).collect::<Vec<_>>(), "order {k}");
        }
        // Deepest level has no children.
        for n in t.offsets[t.order - 1] as usize..t.offsets[t.order] as usize {
            let (first, last) = t.children_range(n);
            assert_eq!(first, last);
        }
    }

    #[test]
    fn order_of_matches_offsets() {
        let t = sample();
        assert_eq!(t.order_of(0), 0);
        assert_eq!(t.order_of(1), 1);
        assert_eq!(t.order_of(4), 1);
        assert_eq!(t.order_of(5), 2);
        assert_eq!(t.order_of(8), 3);
    }

    #[test]
    fn routing_is_stable_and_unigrams_pin_to_zero() {
        assert_eq!(shard_index(&[7], false, 4), 0);
        assert_eq!(shard_index(&[7], true, 4), 0);
        let fwd = shard_index(&[1, 2, 9], false, 4);
        assert_eq!(fwd, shard_index(&[5, 5, 9], false, 4));
        // Reversing the context keeps the newest word, and so the shard.
        assert_eq!(fwd, shard_index(&[9, 2, 1], true, 4));
        assert_eq!(shard_index(&[1, 2, 9], false, 4), (hash_id(9) % 4) as usize);
    }

    #[test]
    fn locate_tracks_the_partial_build() {
        let mut b = TrieBuilder::new(4);
        b.begin_level();
        b.add_children(2, &[0, 3]).unwrap();
        b.end_level();
        assert_eq!(b.locate(&[1]), Some(2));
        assert_eq!(b.locate(&[1, 0]), Some(5));
        assert_eq!(b.locate(&[1, 3]), Some(6));
        assert_eq!(b.locate(&[0, 1]), None);
        b.begin_level();
        b.add_children(6, &[2]).unwrap();
        b.end_level();
        assert_eq!(b.locate(&[1, 3, 2]), Some(7));
    }

    #[test]
    fn paths_reconstruct_contexts() {
        let t = sample();
        assert_eq!(t.path_to(8), vec![1, 0, 2]);
        assert_eq!(t.path_up(8), vec![2, 0, 1]);
        assert_eq!(t.path_to(3), vec![2]);
    }

    #[test]
    fn builder_rejects_disorder() {
        let mut b = TrieBuilder::new(3);
        b.begin_level();
        b.add_children(2, &[1]).unwrap();
        assert!(b.add_children(1, &[0]).is_err());
        assert!(b.add_children(3, &[2, 2]).is_err());
    }
}
