//! Bijection between byte strings and 32-bit word ids.
//!
//! On disk the vocabulary is a sorted succinct string table (`words.fst`,
//! word to id) plus a line-per-word text file (`words.txt`, id to word). A
//! loaded vocabulary may grow through an in-memory overlay whose ids continue
//! where the disk table ends, so ids stay dense. Ids are assigned in
//! insertion order within one namespace and are not portable across models.

use crate::spin::Spinlock;
use crate::stats::Stat;
use anyhow::{Context, Result};
use fst::Map as FstMap;
use memmap2::Mmap;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

pub type WordId = u32;

pub const EMPTY_ID: WordId = 0;
pub const NONE_ID: WordId = 1;
pub const UNK_ID: WordId = 2;
pub const BOS_ID: WordId = 3;
pub const EOS_ID: WordId = 4;

pub const EMPTY: &str = "";
pub const NONE: &str = "<none>";
pub const UNK: &str = "<unk>";
pub const BOS: &str = "<s>";
pub const EOS: &str = "</s>";

const RESERVED: [&str; 5] = [EMPTY, NONE, UNK, BOS, EOS];

const CACHE_SLOTS: usize = 1024 * 16;

struct DiskTable {
    map: FstMap<Mmap>,
    words: Vec<String>,
}

#[derive(Default)]
struct MemTable {
    ids: HashMap<String, WordId>,
    words: Vec<String>,
}

pub struct Vocab {
    disk: Option<DiskTable>,
    mem: Spinlock<MemTable>,
    prefix_caches: Spinlock<HashMap<usize, Arc<WordCache>>>,
    suffix_caches: Spinlock<HashMap<usize, Arc<WordCache>>>,
    digit_cache: WordCache,
}

impl Vocab {
    /// A fresh vocabulary holding only the reserved tokens.
    pub fn new() -> Vocab {
        let vocab = Vocab {
            disk: None,
            mem: Spinlock::new(MemTable::default()),
            prefix_caches: Spinlock::new(HashMap::new()),
            suffix_caches: Spinlock::new(HashMap::new()),
            digit_cache: WordCache::new(),
        };
        for token in RESERVED {
            vocab.insert(token);
        }
        vocab
    }

    pub fn open(dir: &Path) -> Result<Vocab> {
        let fst_path = dir.join("words.fst");
        let file = File::open(&fst_path)
            .with_context(|| format!("failed to open {}", fst_path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        let map = FstMap::new(mmap).context("failed to load vocabulary table")?;

        let txt_path = dir.join("words.txt");
        let reader = BufReader::new(
            File::open(&txt_path)
                .with_context(|| format!("failed to open {}", txt_path.display()))?,
        );
        let words: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
        if words.len() != map.len() {
            anyhow::bail!(
                "vocabulary table holds {} words but text file holds {}",
                map.len(),
                words.len()
            );
        }
        Ok(Vocab {
            disk: Some(DiskTable { map, words }),
            mem: Spinlock::new(MemTable::default()),
            prefix_caches: Spinlock::new(HashMap::new()),
            suffix_caches: Spinlock::new(HashMap::new()),
            digit_cache: WordCache::new(),
        })
    }

    fn disk_len(&self) -> usize {
        self.disk.as_ref().map_or(0, |d| d.words.len())
    }

    pub fn len(&self) -> usize {
        self.disk_len() + self.mem.lock().words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent insert. The on-disk table is searched first; misses fall
    /// through to the overlay, offset by the table size so ids stay dense.
    /// The lock protects only the map probe and append, never I/O.
    pub fn insert(&self, word: &str) -> WordId {
        if let Some(disk) = &self.disk {
            if let Some(v) = disk.map.get(word) {
                return v as WordId;
            }
        }
        let offset = self.disk_len() as WordId;
        let mut mem = self.mem.lock();
        if let Some(&id) = mem.ids.get(word) {
            return id;
        }
        let id = offset + mem.words.len() as WordId;
        mem.ids.insert(word.to_string(), id);
        mem.words.push(word.to_string());
        id
    }

    /// Constant-expected-time lookup; unseen words map to `UNK_ID`.
    pub fn lookup(&self, word: &str) -> WordId {
        if let Some(disk) = &self.disk {
            if let Some(v) = disk.map.get(word) {
                return v as WordId;
            }
        }
        self.mem.lock().ids.get(word).copied().unwrap_or(UNK_ID)
    }

    pub fn exists(&self, word: &str) -> bool {
        if let Some(disk) = &self.disk {
            if disk.map.get(word).is_some() {
                return true;
            }
        }
        self.mem.lock().ids.contains_key(word)
    }

    pub fn word(&self, id: WordId) -> Option<String> {
        let id = id as usize;
        let disk_len = self.disk_len();
        if id < disk_len {
            return Some(self.disk.as_ref().unwrap().words[id].clone());
        }
        self.mem.lock().words.get(id - disk_len).cloned()
    }

    /// Merge the overlay into the on-disk table and atomically replace it.
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let mut by_id: Vec<String> = Vec::with_capacity(self.len());
        if let Some(disk) = &self.disk {
            by_id.extend(disk.words.iter().cloned());
        }
        by_id.extend(self.mem.lock().words.iter().cloned());

        // fst insertion must be sorted by key.
        let mut sorted: BTreeMap<&str, u64> = BTreeMap::new();
        for (id, word) in by_id.iter().enumerate() {
            sorted.insert(word, id as u64);
        }

        let fst_tmp = dir.join("words.fst.tmp");
        {
            let mut out = BufWriter::new(File::create(&fst_tmp)?);
            let mut builder =
                fst::MapBuilder::new(&mut out).context("failed to start vocabulary table")?;
            for (word, id) in &sorted {
                builder
                    .insert(word, *id)
                    .with_context(|| format!("failed to insert {word}"))?;
            }
            builder.finish().context("failed to finish vocabulary table")?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&fst_tmp, dir.join("words.fst"))?;

        let txt_tmp = dir.join("words.txt.tmp");
        {
            let mut out = BufWriter::new(File::create(&txt_tmp)?);
            for word in &by_id {
                writeln!(out, "{word}")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&txt_tmp, dir.join("words.txt"))?;
        Ok(())
    }

    /// First `k` codepoints, `+`-marked when the word was truncated. Cached
    /// per caller `k`; tags pass through unchanged.
    pub fn prefix(&self, id: WordId, k: usize) -> WordId {
        let cache = {
            let mut caches = self.prefix_caches.lock();
            Arc::clone(caches.entry(k).or_insert_with(|| Arc::new(WordCache::new())))
        };
        self.transform_cached(&cache, id, |w| prefix_str(w, k))
    }

    /// Last `k` codepoints, `+`-marked when the word was truncated.
    pub fn suffix(&self, id: WordId, k: usize) -> WordId {
        let cache = {
            let mut caches = self.suffix_caches.lock();
            Arc::clone(caches.entry(k).or_insert_with(|| Arc::new(WordCache::new())))
        };
        self.transform_cached(&cache, id, |w| suffix_str(w, k))
    }

    /// Digit-normalized form, e.g. `x86` becomes `<digit-x@@>`.
    pub fn digits(&self, id: WordId) -> WordId {
        self.transform_cached(&self.digit_cache, id, digits_str)
    }

    fn transform_cached<F: Fn(&str) -> String>(
        &self,
        cache: &WordCache,
        id: WordId,
        transform: F,
    ) -> WordId {
        let slot = cache.load(id);
        if let Some(result) = slot.hit(id) {
            return result;
        }
        let word = match self.word(id) {
            Some(w) => w,
            None => return id,
        };
        if is_tag(&word) {
            return id;
        }
        let result = self.insert(&transform(&word));
        cache.store(slot, id, result);
        result
    }

    pub fn stat(&self) -> Stat {
        let disk_bytes = self
            .disk
            .as_ref()
            .map_or(0, |d| d.map.as_fst().as_bytes().len() as u64);
        let mem = self.mem.lock();
        let heap: u64 = mem.words.iter().map(|w| w.len() as u64).sum();
        let cache_bytes = {
            let n = self.prefix_caches.lock().len() + self.suffix_caches.lock().len() + 1;
            (n * CACHE_SLOTS * 8) as u64
        };
        Stat::new(disk_bytes + heap, disk_bytes, cache_bytes)
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Vocab::new()
    }
}

/// Fixed-size cache of `(source id, result id)` pairs packed into one atomic
/// word per slot, updated by compare-and-swap. Collisions just overwrite.
struct WordCache {
    slots: Vec<AtomicU64>,
}

#[derive(Clone, Copy)]
struct CacheSlot {
    index: usize,
    value: u64,
}

impl CacheSlot {
    fn hit(&self, id: WordId) -> Option<WordId> {
        if self.value != u64::MAX && (self.value & 0xffff_ffff) as WordId == id {
            Some((self.value >> 32) as WordId)
        } else {
            None
        }
    }
}

impl WordCache {
    fn new() -> WordCache {
        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            slots.push(AtomicU64::new(u64::MAX));
        }
        WordCache { slots }
    }

    fn load(&self, id: WordId) -> CacheSlot {
        let index = id as usize & (CACHE_SLOTS - 1);
        CacheSlot {
            index,
            value: self.slots[index].load(Ordering::Acquire),
        }
    }

    fn store(&self, prev: CacheSlot, id: WordId, result: WordId) {
        let packed = (result as u64) << 32 | id as u64;
        let _ = self.slots[prev.index].compare_exchange(
            prev.value,
            packed,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

/// Reserved tokens and anything shaped like `<...>` pass through transforms.
pub fn is_tag(word: &str) -> bool {
    word.is_empty() || (word.starts_with('<') && word.ends_with('>'))
}

pub fn prefix_str(word: &str, k: usize) -> String {
    if is_tag(word) {
        return word.to_string();
    }
    let normalized: String = word.nfc().collect();
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() <= k {
        return normalized;
    }
    let mut out: String = chars[..k].iter().collect();
    out.push('+');
    out
}

pub fn suffix_str(word: &str, k: usize) -> String {
    if is_tag(word) {
        return word.to_string();
    }
    let normalized: String = word.nfc().collect();
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() <= k {
        return normalized;
    }
    let mut out = String::from("+");
    out.extend(&chars[chars.len() - k..]);
    out
}

pub fn digits_str(word: &str) -> String {
    if is_tag(word) {
        return word.to_string();
    }
    let normalized: String = word.nfc().collect();
    let chars: Vec<char> = normalized.chars().collect();
    // At least one end must be numeric for the word to count as digit-like.
    let first_numeric = chars.first().map_or(false, |c| c.to_digit(10).is_some());
    let last_numeric = chars.last().map_or(false, |c| c.to_digit(10).is_some());
    if !first_numeric && !last_numeric {
        return normalized;
    }
    let mut found = false;
    let mut out = String::from("<digit-");
    for c in &chars {
        if c.to_digit(10).is_some() {
            found = true;
            out.push('@');
        } else {
            out.push(*c);
        }
    }
    if !found {
        return normalized;
    }
    out.push('>');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tokens_have_fixed_ids() {
        let v = Vocab::new();
        assert_eq!(v.lookup(EMPTY), EMPTY_ID);
        assert_eq!(v.lookup(NONE), NONE_ID);
        assert_eq!(v.lookup(UNK), UNK_ID);
        assert_eq!(v.lookup(BOS), BOS_ID);
        assert_eq!(v.lookup(EOS), EOS_ID);
        assert_eq!(v.len(), 5);
    }

    #[test]
    fn insert_is_idempotent_and_dense() {
        let v = Vocab::new();
        let a = v.insert("alpha");
        let b = v.insert("beta");
        assert_eq!(a, 5);
        assert_eq!(b, 6);
        assert_eq!(v.insert("alpha"), a);
        assert_eq!(v.lookup("alpha"), a);
        assert_eq!(v.lookup("missing"), UNK_ID);
        assert_eq!(v.word(b).as_deref(), Some("beta"));
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("shardgram-vocab-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let v = Vocab::new();
        v.insert("zebra");
        v.insert("aardvark");
        v.write(&dir).unwrap();

        let w = Vocab::open(&dir).unwrap();
        assert_eq!(w.lookup("zebra"), v.lookup("zebra"));
        assert_eq!(w.lookup("aardvark"), v.lookup("aardvark"));
        assert_eq!(w.lookup(BOS), BOS_ID);
        // Overlay continues past the disk table.
        let n = w.insert("new-word");
        assert_eq!(n as usize, w.len() - 1);
        assert_eq!(w.lookup("new-word"), n);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn transforms_match_documented_forms() {
        assert_eq!(prefix_str("hello", 3), "hel+");
        assert_eq!(prefix_str("hi", 3), "hi");
        assert_eq!(suffix_str("hello", 3), "+llo");
        assert_eq!(suffix_str("héllo", 4), "+éllo");
        assert_eq!(digits_str("x86"), "<digit-x@@>");
        assert_eq!(digits_str("2nd"), "<digit-@nd>");
        assert_eq!(digits_str("hello"), "hello");
        assert_eq!(prefix_str("<s>", 1), "<s>");
        assert_eq!(digits_str("<none>"), "<none>");
    }

    #[test]
    fn cached_transforms_intern_results() {
        let v = Vocab::new();
        let id = v.insert("running");
        let p = v.prefix(id, 3);
        assert_eq!(v.word(p).as_deref(), Some("run+"));
        // A second call hits the cache and returns the same id.
        assert_eq!(v.prefix(id, 3), p);
        let d = v.digits(v.insert("mp3"));
        assert_eq!(v.word(d).as_deref(), Some("<digit-mp@>"));
        // Tags are never transformed.
        assert_eq!(v.prefix(BOS_ID, 1), BOS_ID);
    }
}
