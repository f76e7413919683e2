//! In-memory model assembly from explicit n-gram records.
//!
//! This is the same level-by-level indexing the backward reducer performs,
//! exposed directly: records are routed to their owning shard, sorted
//! lexicographically per order, prefix-closed with structural nodes, and fed
//! through `TrieBuilder` with the columns written in lockstep.

use crate::column::LOGPROB_MIN;
use crate::model::{CountWriter, FloatWriter, NGram, Shard, DEFAULT_SMOOTH};
use crate::trie::{shard_index, TrieBuilder};
use crate::vocab::{Vocab, WordId};
use anyhow::{bail, Result};
use std::collections::BTreeMap;

#[derive(Clone, Copy)]
struct Values {
    logprob: f32,
    backoff: f32,
    count: u64,
}

const GHOST: Values = Values {
    logprob: LOGPROB_MIN,
    backoff: LOGPROB_MIN,
    count: 0,
};

fn merge(slot: &mut Values, new: Values) {
    // A sentinel field never overwrites a real value.
    if slot.logprob == LOGPROB_MIN {
        slot.logprob = new.logprob;
    }
    if slot.backoff == LOGPROB_MIN {
        slot.backoff = new.backoff;
    }
    slot.count += new.count;
}

pub struct ModelBuilder {
    order: usize,
    shards: usize,
    smooth: f32,
    with_counts: bool,
    vocab: Vocab,
    entries: Vec<(Vec<WordId>, Values)>,
}

impl ModelBuilder {
    pub fn new(order: usize, shards: usize) -> ModelBuilder {
        ModelBuilder {
            order,
            shards: shards.max(1),
            smooth: DEFAULT_SMOOTH,
            with_counts: false,
            vocab: Vocab::new(),
            entries: Vec::new(),
        }
    }

    pub fn set_smooth(&mut self, smooth: f32) {
        self.smooth = smooth;
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Record a probability entry; `backoff` applies to this context when a
    /// longer match fails.
    pub fn ngram(&mut self, words: &[&str], logprob: f32, backoff: f32) {
        self.push(
            words,
            Values {
                logprob,
                backoff,
                count: 0,
            },
        );
    }

    /// Record a raw count entry (for count models).
    pub fn count(&mut self, words: &[&str], count: u64) {
        self.with_counts = true;
        self.push(
            words,
            Values {
                logprob: LOGPROB_MIN,
                backoff: LOGPROB_MIN,
                count,
            },
        );
    }

    fn push(&mut self, words: &[&str], values: Values) {
        assert!(
            !words.is_empty() && words.len() <= self.order,
            "n-gram length {} outside 1..={}",
            words.len(),
            self.order
        );
        let ids: Vec<WordId> = words.iter().map(|w| self.vocab.insert(w)).collect();
        self.entries.push((ids, values));
    }

    pub fn build(self) -> Result<NGram> {
        let v = self.vocab.len();
        let mut per_shard: Vec<Vec<BTreeMap<Vec<WordId>, Values>>> = (0..self.shards)
            .map(|_| (0..=self.order).map(|_| BTreeMap::new()).collect())
            .collect();

        for (ids, values) in self.entries {
            let shard = shard_index(&ids, false, self.shards);
            let slot = per_shard[shard][ids.len()]
                .entry(ids)
                .or_insert(GHOST);
            merge(slot, values);
        }

        // Prefix closure: every stored path needs its parents, even when the
        // parent context is owned by another shard.
        for shard in per_shard.iter_mut() {
            for k in (3..=self.order).rev() {
                let prefixes: Vec<Vec<WordId>> =
                    shard[k].keys().map(|key| key[..k - 1].to_vec()).collect();
                for prefix in prefixes {
                    shard[k - 1].entry(prefix).or_insert(GHOST);
                }
            }
        }

        let mut shards_out = Vec::with_capacity(self.shards);
        for (s, levels) in per_shard.into_iter().enumerate() {
            let offset = if s == 0 { 1 } else { v + 1 };
            let mut logprob = FloatWriter::new(offset);
            let mut backoff = FloatWriter::new(offset);
            let mut count = CountWriter::new(offset);

            if s == 0 {
                for w in 0..v as WordId {
                    let vals = levels[1].get(&[w][..]).copied().unwrap_or(GHOST);
                    logprob.push(vals.logprob);
                    if self.order > 1 {
                        backoff.push(if vals.backoff == LOGPROB_MIN {
                            0.0
                        } else {
                            vals.backoff
                        });
                    }
                    if self.with_counts {
                        count.push(vals.count);
                    }
                }
            } else if !levels[1].is_empty() {
                bail!("unigram entry routed to shard {s}");
            }

            let mut trie = TrieBuilder::new(v);
            for k in 2..=self.order {
                trie.begin_level();
                let mut group_prefix: Option<Vec<WordId>> = None;
                let mut group_words: Vec<WordId> = Vec::new();
                let mut group_values: Vec<Values> = Vec::new();
                let mut flush = |trie: &mut TrieBuilder,
                                 prefix: &Option<Vec<WordId>>,
                                 words: &mut Vec<WordId>,
                                 values: &mut Vec<Values>,
                                 logprob: &mut FloatWriter,
                                 backoff: &mut FloatWriter,
                                 count: &mut CountWriter|
                 -> Result<()> {
                    let Some(prefix) = prefix else { return Ok(()) };
                    let parent = match trie.locate(prefix) {
                        Some(p) => p,
                        None => bail!("missing prefix {prefix:?} while indexing order {k}"),
                    };
                    trie.add_children(parent, words)?;
                    for vals in values.iter() {
                        logprob.push(vals.logprob);
                        if k < self.order {
                            backoff.push(if vals.backoff == LOGPROB_MIN {
                                0.0
                            } else {
                                vals.backoff
                            });
                        }
                        if self.with_counts {
                            count.push(vals.count);
                        }
                    }
                    words.clear();
                    values.clear();
                    Ok(())
                };

                for (key, vals) in &levels[k] {
                    let prefix = &key[..k - 1];
                    if group_prefix.as_deref() != Some(prefix) {
                        flush(
                            &mut trie,
                            &group_prefix,
                            &mut group_words,
                            &mut group_values,
                            &mut logprob,
                            &mut backoff,
                            &mut count,
                        )?;
                        group_prefix = Some(prefix.to_vec());
                    }
                    group_words.push(key[k - 1]);
                    group_values.push(*vals);
                }
                flush(
                    &mut trie,
                    &group_prefix,
                    &mut group_words,
                    &mut group_values,
                    &mut logprob,
                    &mut backoff,
                    &mut count,
                )?;
                trie.end_level();
            }

            let index = trie.finish(self.order, false)?;
            shards_out.push(Shard {
                index,
                logprob: logprob.finish(),
                backoff: backoff.finish(),
                logbound: None,
                count: if self.with_counts {
                    Some(count.finish())
                } else {
                    None
                },
                modified: None,
            });
        }

        Ok(NGram {
            vocab: self.vocab,
            shards: shards_out,
            order: self.order,
            backward: false,
            smooth: self.smooth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::BOS_ID;

    #[test]
    fn builds_a_closed_trigram_model() {
        let mut b = ModelBuilder::new(3, 2);
        b.ngram(&["a"], -1.0, -0.5);
        b.ngram(&["b"], -1.2, -0.4);
        b.ngram(&["c"], -1.4, 0.0);
        b.ngram(&["a", "b"], -0.7, -0.3);
        b.ngram(&["b", "c"], -0.9, 0.0);
        b.ngram(&["a", "b", "c"], -0.2, 0.0);
        let model = b.build().unwrap();

        let a = model.vocab.lookup("a");
        let bw = model.vocab.lookup("b");
        let c = model.vocab.lookup("c");

        // Every stored ngram is found on its owning shard with its value.
        for (ids, lp) in [
            (vec![a], -1.0f32),
            (vec![bw], -1.2),
            (vec![a, bw], -0.7),
            (vec![bw, c], -0.9),
            (vec![a, bw, c], -0.2),
        ] {
            // newest-first for context_node
            let mut newest: Vec<u32> = ids.clone();
            newest.reverse();
            let node = model.context_node(&newest).expect("context stored");
            assert_eq!(model.logprob_value(node, ids.len()), lp, "{ids:?}");
        }

        // Sharding invariant: the data node lives on the owning shard.
        let node = model.context_node(&[c, bw, a]).unwrap();
        assert_eq!(
            node.shard as usize,
            crate::trie::shard_index(&[a, bw, c], false, 2)
        );

        // BOS is present through the reserved vocabulary even if unused.
        assert_eq!(model.vocab.lookup("<s>"), BOS_ID);
    }

    #[test]
    fn ghost_prefixes_keep_paths_connected() {
        let mut b = ModelBuilder::new(3, 4);
        b.ngram(&["x"], -1.0, 0.0);
        b.ngram(&["y"], -1.0, 0.0);
        b.ngram(&["z"], -1.0, 0.0);
        // Only the trigram; its (x, y) prefix is owned by shard(y) but must
        // exist as a structural path on shard(z).
        b.ngram(&["x", "y"], -0.5, -0.1);
        b.ngram(&["y", "z"], -0.6, 0.0);
        b.ngram(&["x", "y", "z"], -0.3, 0.0);
        let model = b.build().unwrap();

        let x = model.vocab.lookup("x");
        let y = model.vocab.lookup("y");
        let z = model.vocab.lookup("z");

        let node = model.context_node(&[z, y, x]).unwrap();
        assert_eq!(model.logprob_value(node, 3), -0.3);

        let owning = crate::trie::shard_index(&[x, y, z], false, 4);
        let ghost = model.shards[owning].index.find(&[x, y]).unwrap();
        // The structural prefix carries the sentinel unless (x, y) is also
        // owned here.
        if owning != crate::trie::shard_index(&[x, y], false, 4) {
            assert_eq!(
                model.shards[owning].logprob.value(ghost, 2),
                LOGPROB_MIN
            );
        }
    }
}
