//! The loaded model: vocabulary, per-shard tries, data columns, and the
//! back-off scoring walk.
//!
//! Decoder states are suffix states: the newest-first ids of the longest
//! stored context of the history, the back-off weight of each of its
//! newest-prefix contexts, and the context's trie node. Scoring charges
//! back-offs for every history length it abandons, then the matched node's
//! log-probability, so totals are canonically additive.

use crate::column::{CountColumn, FloatColumn, LOGPROB_MIN};
use crate::error::ModelError;
use crate::stats::Stat;
use crate::storage::Store;
use crate::trie::TrieShard;
use crate::vocab::{Vocab, WordId, NONE_ID, UNK_ID};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log floor substituted when even the unigram is absent.
pub const DEFAULT_SMOOTH: f32 = -23.025851; // ln 1e-10

#[derive(Serialize, Deserialize, Clone)]
pub struct Manifest {
    pub order: usize,
    pub shard_count: usize,
    pub backward: bool,
    pub quantized_logprob: bool,
    pub quantized_backoff: bool,
    pub quantized_logbound: bool,
    pub smooth: f32,
}

pub struct Shard {
    pub index: TrieShard,
    pub logprob: FloatColumn,
    pub backoff: FloatColumn,
    pub logbound: Option<FloatColumn>,
    pub count: Option<CountColumn>,
    pub modified: Option<CountColumn>,
}

pub struct NGram {
    pub vocab: Vocab,
    pub shards: Vec<Shard>,
    pub order: usize,
    pub backward: bool,
    pub smooth: f32,
}

/// A trie position on one shard.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeRef {
    pub shard: u32,
    pub pos: u32,
}

/// The longest stored context of a scoring history, newest word first.
/// `backoffs[i]` is the back-off weight of the context made of the newest
/// `i + 1` words, charged when an extension of that length fails.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct SuffixState {
    ids: Vec<WordId>,
    backoffs: Vec<f32>,
    node: Option<NodeRef>,
}

impl SuffixState {
    pub fn empty() -> SuffixState {
        SuffixState::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[WordId] {
        &self.ids
    }

    pub fn backoffs(&self) -> &[f32] {
        &self.backoffs
    }

    pub fn node(&self) -> Option<NodeRef> {
        self.node
    }

    /// Keep only the newest `limit` words of the context.
    pub fn truncated(&self, limit: usize) -> SuffixState {
        if self.ids.len() <= limit {
            return self.clone();
        }
        SuffixState {
            ids: self.ids[..limit].to_vec(),
            backoffs: self.backoffs[..limit].to_vec(),
            node: None,
        }
    }
}

pub struct ScoreResult {
    /// Data node of the matched n-gram, if any.
    pub node: Option<NodeRef>,
    /// Length of the matched n-gram.
    pub length: usize,
    /// Back-offs charged plus the matched log-probability.
    pub exact: f32,
    /// Admissible upper estimate while the left context may still grow.
    pub bound: f32,
    /// True once no further left context can change this word's score.
    pub complete: bool,
}

impl NGram {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Owning shard of a context given newest-first ids. Forward storage
    /// ends with the newest word and backward storage starts with it, so the
    /// routing word is `newest_first[0]` in both orientations.
    pub fn shard_of(&self, newest_first: &[WordId]) -> usize {
        if newest_first.len() <= 1 {
            return 0;
        }
        (crate::trie::hash_id(newest_first[0]) % self.shards.len() as u64) as usize
    }

    /// Trie path (storage order) for a newest-first context.
    fn path_of(&self, newest_first: &[WordId]) -> Vec<WordId> {
        if self.backward {
            newest_first.to_vec()
        } else {
            let mut path = newest_first.to_vec();
            path.reverse();
            path
        }
    }

    /// Data node of a context, on the shard that owns it.
    pub fn context_node(&self, newest_first: &[WordId]) -> Option<NodeRef> {
        if newest_first.is_empty() {
            return None;
        }
        let shard = self.shard_of(newest_first);
        let path = self.path_of(newest_first);
        self.shards[shard].index.find(&path).map(|pos| NodeRef {
            shard: shard as u32,
            pos: pos as u32,
        })
    }

    /// Column reads serve positions below the first bigram from shard 0:
    /// unigram data is global.
    pub fn logprob_value(&self, node: NodeRef, order: usize) -> f32 {
        let shard = &self.shards[node.shard as usize];
        if (node.pos as u64) < shard.index.offsets[1] {
            self.shards[0].logprob.value(node.pos as usize, 1)
        } else {
            shard.logprob.value(node.pos as usize, order)
        }
    }

    pub fn backoff_value(&self, node: NodeRef, order: usize) -> f32 {
        let shard = &self.shards[node.shard as usize];
        let v = if (node.pos as u64) < shard.index.offsets[1] {
            self.shards[0].backoff.value(node.pos as usize, 1)
        } else {
            shard.backoff.value(node.pos as usize, order)
        };
        // An absent back-off weighs nothing.
        if v == LOGPROB_MIN {
            0.0
        } else {
            v
        }
    }

    pub fn logbound_value(&self, node: NodeRef, order: usize) -> Option<f32> {
        let shard = &self.shards[node.shard as usize];
        if (node.pos as u64) < shard.index.offsets[1] {
            let col = self.shards[0].logbound.as_ref()?;
            Some(col.value(node.pos as usize, 1))
        } else {
            let col = shard.logbound.as_ref()?;
            Some(col.value(node.pos as usize, order))
        }
    }

    /// Build the suffix state for an explicit context (newest-first),
    /// keeping its longest stored suffix.
    pub fn lookup_context(&self, newest_first: &[WordId]) -> SuffixState {
        let cap = newest_first.len().min(self.order.saturating_sub(1));
        let mut kept = 0;
        for l in (1..=cap).rev() {
            if self.context_node(&newest_first[..l]).is_some() {
                kept = l;
                break;
            }
        }
        if kept == 0 {
            return SuffixState::empty();
        }
        let mut state = SuffixState {
            ids: newest_first[..kept].to_vec(),
            backoffs: Vec::with_capacity(kept),
            node: None,
        };
        for l in 1..=kept {
            match self.context_node(&state.ids[..l]) {
                Some(node) => {
                    state.backoffs.push(self.backoff_value(node, l));
                    state.node = Some(node);
                }
                None => state.backoffs.push(0.0),
            }
        }
        state
    }

    /// Score the next word given the current state: walk, back off, and
    /// report both the exact score and the admissible bound.
    ///
    /// Back-offs are charged first (oldest abandoned history first), then the
    /// matched extension's log-probability. `complete` is true exactly when
    /// the walk backed off, or the word was unknown: by suffix closure no
    /// additional left context can produce a longer match afterwards.
    pub fn ngram_score(&self, state: &SuffixState, word: WordId) -> (SuffixState, ScoreResult) {
        let hist = state.ids();
        let is_oov = word == UNK_ID || word == NONE_ID || (word as usize) >= self.vocab.len();

        let mut charged = 0.0f32;
        let mut matched: Option<(NodeRef, usize)> = None;
        let mut ctx: Vec<WordId> = Vec::with_capacity(hist.len() + 1);

        if is_oov {
            for b in state.backoffs() {
                charged += b;
            }
            ctx.push(word);
            if let Some(node) = self.context_node(&ctx) {
                if self.logprob_value(node, 1) != LOGPROB_MIN {
                    matched = Some((node, 1));
                }
            }
        } else {
            for l in (0..=hist.len()).rev() {
                ctx.clear();
                ctx.push(word);
                ctx.extend_from_slice(&hist[..l]);
                if let Some(node) = self.context_node(&ctx) {
                    if self.logprob_value(node, l + 1) != LOGPROB_MIN {
                        matched = Some((node, l + 1));
                        break;
                    }
                }
                if l > 0 {
                    charged += state.backoffs()[l - 1];
                }
            }
        }

        let (exact, node, length) = match matched {
            Some((node, length)) => (
                charged + self.logprob_value(node, length),
                Some(node),
                length,
            ),
            None => (charged + self.smooth, None, 0),
        };

        let backed_off = length < hist.len() + 1;
        let complete = backed_off || is_oov;

        let bound = if complete || length >= self.order {
            exact
        } else {
            match node.and_then(|n| self.logbound_value(n, length)) {
                Some(b) if b != LOGPROB_MIN && b > exact => b,
                _ => exact,
            }
        };

        let next = self.advance_state(hist, word, length);
        (
            next,
            ScoreResult {
                node,
                length,
                exact,
                bound,
                complete,
            },
        )
    }

    /// Suffix state after appending `word`, given the matched length.
    fn advance_state(&self, hist: &[WordId], word: WordId, matched_len: usize) -> SuffixState {
        let keep = matched_len.min(self.order.saturating_sub(1));
        if keep == 0 {
            return SuffixState::empty();
        }
        let mut ids = Vec::with_capacity(keep);
        ids.push(word);
        ids.extend_from_slice(&hist[..keep - 1]);

        let mut backoffs = Vec::with_capacity(keep);
        let mut last = None;
        for l in 1..=keep {
            match self.context_node(&ids[..l]) {
                Some(node) => {
                    backoffs.push(self.backoff_value(node, l));
                    last = Some(node);
                }
                None => backoffs.push(0.0),
            }
        }
        SuffixState {
            ids,
            backoffs,
            node: last,
        }
    }

    /// Convenience full-context walk: sum of per-word exact scores, history
    /// capped at `limit` words. A leading `<s>` seeds the state instead of
    /// being scored.
    pub fn score(&self, ids: &[WordId], limit: usize) -> f32 {
        let limit = if limit == 0 { self.order } else { limit.min(self.order) };
        let mut state = SuffixState::empty();
        let mut start = 0;
        if ids.first() == Some(&crate::vocab::BOS_ID) {
            state = self.lookup_context(&[crate::vocab::BOS_ID]);
            start = 1;
        }
        let mut total = 0.0f64;
        for &w in &ids[start..] {
            let scratch = state.truncated(limit - 1);
            let (next, result) = self.ngram_score(&scratch, w);
            total += result.exact as f64;
            state = next;
        }
        total as f32
    }

    pub fn traverse(&self, shard: usize, path: &[WordId]) -> Option<usize> {
        self.shards[shard].index.find(path)
    }

    // ---- persistence ----

    pub fn open(path: &Path) -> Result<NGram> {
        let manifest_path = path.join("manifest");
        let manifest: Manifest = serde_json::from_reader(
            std::fs::File::open(&manifest_path)
                .with_context(|| format!("failed to open {}", manifest_path.display()))
                .map_err(|e| integrity(path, e))?,
        )
        .map_err(|e| integrity(path, e.into()))?;

        if manifest.order == 0 || manifest.order > 16 {
            return Err(ModelError::ModelIntegrity(format!(
                "{}: implausible order {}",
                path.display(),
                manifest.order
            ))
            .into());
        }
        if manifest.shard_count == 0 {
            return Err(ModelError::ModelIntegrity(format!(
                "{}: zero shards",
                path.display()
            ))
            .into());
        }

        let vocab = Vocab::open(&path.join("vocab")).map_err(|e| integrity(path, e))?;

        let mut shards = Vec::with_capacity(manifest.shard_count);
        for s in 0..manifest.shard_count {
            let index = TrieShard::open(&path.join(format!("index.{s}")))
                .map_err(|e| integrity(path, e))?;
            if index.order != manifest.order || index.backward != manifest.backward {
                return Err(ModelError::ModelIntegrity(format!(
                    "{}: shard {s} disagrees with the manifest",
                    path.display()
                ))
                .into());
            }
            if index.unigram_count() != vocab.len() {
                return Err(ModelError::ModelIntegrity(format!(
                    "{}: shard {s} indexes {} unigrams for {} words",
                    path.display(),
                    index.unigram_count(),
                    vocab.len()
                ))
                .into());
            }

            let offset = column_offset(s, &index);
            let node_count = index.node_count();
            let low_end = index.offsets[manifest.order - 1] as usize;

            let logprob = open_float(
                &path.join(format!("logprob.{s}")),
                manifest.quantized_logprob,
                offset,
                node_count - offset,
                manifest.order,
            )
            .map_err(|e| integrity(path, e))?;
            let backoff = open_float(
                &path.join(format!("backoff.{s}")),
                manifest.quantized_backoff,
                offset,
                low_end.saturating_sub(offset),
                manifest.order,
            )
            .map_err(|e| integrity(path, e))?;

            let logbound_path = path.join(format!("logbound.{s}"));
            let logbound = if logbound_path.exists() {
                Some(
                    open_float(
                        &logbound_path,
                        manifest.quantized_logbound,
                        offset,
                        low_end.saturating_sub(offset),
                        manifest.order,
                    )
                    .map_err(|e| integrity(path, e))?,
                )
            } else {
                None
            };

            let count_path = path.join(format!("count.{s}"));
            let count = if count_path.exists() {
                Some(
                    CountColumn::open(&count_path, offset, node_count - offset)
                        .map_err(|e| integrity(path, e))?,
                )
            } else {
                None
            };
            let modified_path = path.join(format!("modified.{s}"));
            let modified = if modified_path.exists() {
                Some(
                    CountColumn::open(&modified_path, offset, low_end.saturating_sub(offset))
                        .map_err(|e| integrity(path, e))?,
                )
            } else {
                None
            };

            shards.push(Shard {
                index,
                logprob,
                backoff,
                logbound,
                count,
                modified,
            });
        }

        Ok(NGram {
            vocab,
            shards,
            order: manifest.order,
            backward: manifest.backward,
            smooth: manifest.smooth,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        self.vocab.write(&path.join("vocab"))?;

        for (s, shard) in self.shards.iter().enumerate() {
            shard.index.write(&path.join(format!("index.{s}")))?;
            shard.logprob.write(&path.join(format!("logprob.{s}")))?;
            shard.backoff.write(&path.join(format!("backoff.{s}")))?;
            if let Some(b) = &shard.logbound {
                b.write(&path.join(format!("logbound.{s}")))?;
            }
            if let Some(c) = &shard.count {
                c.write(&path.join(format!("count.{s}")))?;
            }
            if let Some(m) = &shard.modified {
                m.write(&path.join(format!("modified.{s}")))?;
            }
        }

        let manifest = Manifest {
            order: self.order,
            shard_count: self.shards.len(),
            backward: self.backward,
            quantized_logprob: self.shards[0].logprob.is_quantized(),
            quantized_backoff: self.shards[0].backoff.is_quantized(),
            quantized_logbound: self
                .shards
                .iter()
                .any(|s| s.logbound.as_ref().map_or(false, |c| c.is_quantized())),
            smooth: self.smooth,
        };
        crate::tempdir::write_atomic(
            &path.join("manifest"),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;
        Ok(())
    }

    pub fn stat(&self) -> Vec<(String, Stat)> {
        let mut out = vec![("vocab".to_string(), self.vocab.stat())];
        for (s, shard) in self.shards.iter().enumerate() {
            let index_bytes =
                shard.index.positions.byte_size() + shard.index.ids_bytes().len() as u64;
            out.push((
                format!("index.{s}"),
                Stat::new(index_bytes, index_bytes, 0),
            ));
            out.push((format!("logprob.{s}"), shard.logprob.stat()));
            out.push((format!("backoff.{s}"), shard.backoff.stat()));
            if let Some(b) = &shard.logbound {
                out.push((format!("logbound.{s}"), b.stat()));
            }
            if let Some(c) = &shard.count {
                out.push((format!("count.{s}"), c.stat()));
            }
            if let Some(m) = &shard.modified {
                out.push((format!("modified.{s}"), m.stat()));
            }
        }
        out
    }
}

impl PartialEq for NGram {
    /// Structural equality: identical layout and stored bytes. Used by the
    /// diff tool.
    fn eq(&self, other: &NGram) -> bool {
        if self.order != other.order
            || self.backward != other.backward
            || self.shards.len() != other.shards.len()
            || self.vocab.len() != other.vocab.len()
        {
            return false;
        }
        for (a, b) in self.shards.iter().zip(&other.shards) {
            if a.index != b.index
                || a.logprob != b.logprob
                || a.backoff != b.backoff
                || a.logbound != b.logbound
                || a.count != b.count
                || a.modified != b.modified
            {
                return false;
            }
        }
        (0..self.vocab.len() as WordId).all(|id| self.vocab.word(id) == other.vocab.word(id))
    }
}

/// First position a shard stores locally: shard 0 stores from position 1,
/// everyone else starts past the globally shared unigrams.
pub fn column_offset(shard: usize, index: &TrieShard) -> usize {
    if shard == 0 {
        1
    } else {
        index.offsets[1] as usize
    }
}

fn open_float(
    path: &Path,
    quantized: bool,
    offset: usize,
    expected: usize,
    order: usize,
) -> Result<FloatColumn> {
    if quantized {
        FloatColumn::open_quantized(path, offset, expected, order)
    } else {
        FloatColumn::open_raw(path, offset, expected)
    }
}

fn integrity(path: &Path, err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(ModelError::ModelIntegrity(format!(
        "{}: {err:#}",
        path.display()
    )))
}

/// In-memory column assembly helpers shared by the builder and reducers.
pub struct FloatWriter {
    offset: usize,
    raw: Vec<u8>,
}

impl FloatWriter {
    pub fn new(offset: usize) -> FloatWriter {
        FloatWriter {
            offset,
            raw: Vec::new(),
        }
    }

    pub fn push(&mut self, v: f32) {
        crate::storage::push_f32(&mut self.raw, v);
    }

    pub fn len(&self) -> usize {
        self.raw.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn finish(self) -> FloatColumn {
        FloatColumn::raw(self.offset, Store::Owned(self.raw))
    }
}

pub struct CountWriter {
    offset: usize,
    raw: Vec<u8>,
}

impl CountWriter {
    pub fn new(offset: usize) -> CountWriter {
        CountWriter {
            offset,
            raw: Vec::new(),
        }
    }

    pub fn push(&mut self, v: u64) {
        crate::storage::push_u64(&mut self.raw, v);
    }

    pub fn finish(self) -> CountColumn {
        CountColumn::new(self.offset, Store::Owned(self.raw))
    }
}

