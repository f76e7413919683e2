//! Backward trie construction: rebuild the model with every stored context
//! reversed, so a right-to-left decoder can walk it natively.
//!
//! Mappers stream each order's nodes; walking parents already yields the
//! reversed context, so a record is the child word, the parent walk, and the
//! node's three values. Reducers buffer records per order in temporary
//! files, sort them lexicographically, and re-materialize the trie level by
//! level, inserting structural prefixes for paths whose own record is owned
//! by another shard. A sentinel field is preserved as sentinel, never
//! coerced to zero (only back-off weights flatten to zero at write time,
//! where absent genuinely means "charge nothing").

use crate::column::{finalize_floats, FloatColumn, LOGPROB_MIN};
use crate::error::ModelError;
use crate::model::NGram;
use crate::pipeline;
use crate::storage::read_f32;
use crate::transport::{decode_f32, encode_f32, Collator, RecordStream};
use crate::trie::{shard_index, TrieBuilder, TrieShard};
use crate::vocab::WordId;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};

pub struct BackwardShard {
    pub index: TrieShard,
    pub logprob: FloatColumn,
    pub backoff: FloatColumn,
    pub logbound: Option<FloatColumn>,
}

pub fn run(model: &NGram, debug: bool) -> Result<Vec<BackwardShard>> {
    pipeline::run(
        model.shard_count(),
        |shard, streams: &mut [RecordStream]| map_shard(model, shard, streams, debug),
        |shard, collator| reduce_shard(model, shard, collator, debug),
    )
}

fn map_shard(
    model: &NGram,
    shard: usize,
    streams: &mut [RecordStream],
    debug: bool,
) -> Result<()> {
    let data = &model.shards[shard];
    let index = &data.index;
    let shard_count = model.shard_count();
    let target_backward = !model.backward;
    let mut line = String::new();

    for order_prev in 1..model.order {
        if debug {
            println!("backward mapper: shard: {shard} order: {}", order_prev + 1);
        }
        let k = order_prev + 1;
        let first = index.offsets[order_prev - 1] as usize;
        let last = index.offsets[order_prev] as usize;
        for pos_context in first..last {
            let (child_first, child_last) = index.children_range(pos_context);
            if child_first == child_last {
                continue;
            }
            // Walking up is already the reversal of the stored context.
            let up = index.path_up(pos_context);
            let mut reversed = Vec::with_capacity(k);
            reversed.push(0);
            reversed.extend_from_slice(&up);
            let mut stored = index.path_to(pos_context);
            stored.push(0);
            for pos in child_first..child_last {
                reversed[0] = index.word_id(pos);
                *stored.last_mut().unwrap() = reversed[0];
                // Only a node's owning shard emits it; structural copies of
                // the same context would duplicate the record.
                if shard_index(&stored, model.backward, shard_count) != shard {
                    continue;
                }

                let logprob = data.logprob.value(pos, k);
                let logbound = if k != model.order {
                    data.logbound
                        .as_ref()
                        .map_or(LOGPROB_MIN, |c| c.value(pos, k))
                } else {
                    LOGPROB_MIN
                };
                let backoff = if k != model.order {
                    data.backoff.value(pos, k)
                } else {
                    LOGPROB_MIN
                };

                let target = shard_index(&reversed, target_backward, shard_count);
                line.clear();
                for id in &reversed {
                    write!(line, "{id} ").unwrap();
                }
                line.push_str(&encode_f32(logprob));
                line.push(' ');
                line.push_str(&encode_f32(logbound));
                line.push(' ');
                line.push_str(&encode_f32(backoff));
                streams[target].write_line(&line)?;
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct Rec {
    prob: f32,
    bound: f32,
    backoff: f32,
}

const GHOST: Rec = Rec {
    prob: LOGPROB_MIN,
    bound: LOGPROB_MIN,
    backoff: LOGPROB_MIN,
};

fn merge(slot: &mut Rec, new: Rec) {
    if slot.prob == LOGPROB_MIN {
        slot.prob = new.prob;
    }
    if slot.bound == LOGPROB_MIN {
        slot.bound = new.bound;
    }
    if slot.backoff == LOGPROB_MIN {
        slot.backoff = new.backoff;
    }
}

fn reduce_shard(
    model: &NGram,
    shard: usize,
    mut collator: Collator,
    debug: bool,
) -> Result<BackwardShard> {
    let order = model.order;
    let vocab_size = model.vocab.len();
    let with_bounds = model.shards[0].logbound.is_some();

    // Buffer records per order in temporary files before indexing.
    let mut paths = Vec::with_capacity(order + 1);
    let mut writers: Vec<Option<BufWriter<File>>> = Vec::with_capacity(order + 1);
    for k in 0..=order {
        if k < 2 {
            paths.push(None);
            writers.push(None);
        } else {
            let path = crate::tempdir::file_name("backward.ngram");
            writers.push(Some(BufWriter::new(File::create(&path)?)));
            paths.push(Some(path));
        }
    }

    let mut received = 0u64;
    while let Some(line) = collator.next_line()? {
        let (ids, rec) = parse_record(&line)?;
        if ids.len() < 2 || ids.len() > order {
            return Err(ModelError::Routing(format!(
                "shard {shard}: record {line:?} has impossible order"
            ))
            .into());
        }
        let writer = writers[ids.len()].as_mut().unwrap();
        for id in &ids {
            writer.write_all(&id.to_le_bytes())?;
        }
        writer.write_all(&rec.prob.to_le_bytes())?;
        writer.write_all(&rec.bound.to_le_bytes())?;
        writer.write_all(&rec.backoff.to_le_bytes())?;
        received += 1;
    }
    for writer in writers.iter_mut().flatten() {
        writer.flush()?;
    }
    drop(writers);
    if debug {
        println!("backward reducer: shard: {shard} records: {received}");
    }

    // Load, sort, and merge each order; then close the levels over the
    // prefixes deeper orders require.
    let mut levels: Vec<BTreeMap<Vec<WordId>, Rec>> =
        (0..=order).map(|_| BTreeMap::new()).collect();
    for k in 2..=order {
        let path = paths[k].as_ref().unwrap();
        let raw = std::fs::read(path)?;
        let stride = (k + 3) * 4;
        if raw.len() % stride != 0 {
            return Err(ModelError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("shard {shard}: order {k} buffer is torn"),
            ))
            .into());
        }
        for chunk in raw.chunks_exact(stride) {
            let mut ids = Vec::with_capacity(k);
            for i in 0..k {
                ids.push(crate::storage::read_u32(chunk, i));
            }
            let rec = Rec {
                prob: read_f32(chunk, k),
                bound: read_f32(chunk, k + 1),
                backoff: read_f32(chunk, k + 2),
            };
            let slot = levels[k].entry(ids).or_insert(GHOST);
            merge(slot, rec);
        }
        let _ = std::fs::remove_file(path);
        crate::tempdir::unregister(path);
    }
    for k in (3..=order).rev() {
        let prefixes: Vec<Vec<WordId>> = levels[k].keys().map(|key| key[..k - 1].to_vec()).collect();
        for prefix in prefixes {
            levels[k - 1].entry(prefix).or_insert(GHOST);
        }
    }

    // Re-materialize the trie level by level, columns in lockstep.
    let offset = if shard == 0 { 1 } else { vocab_size + 1 };
    let mut logprob: Vec<f32> = Vec::new();
    let mut backoff: Vec<f32> = Vec::new();
    let mut logbound: Vec<f32> = Vec::new();
    if shard == 0 {
        for pos in 1..=vocab_size {
            logprob.push(model.shards[0].logprob.value(pos, 1));
            if order > 1 {
                backoff.push(model.shards[0].backoff.value(pos, 1));
                if with_bounds {
                    logbound.push(
                        model.shards[0]
                            .logbound
                            .as_ref()
                            .map_or(LOGPROB_MIN, |c| c.value(pos, 1)),
                    );
                }
            }
        }
    }

    let mut trie = TrieBuilder::new(vocab_size);
    for k in 2..=order {
        if debug {
            println!("backward indexing: shard: {shard} order: {k}");
        }
        trie.begin_level();
        let mut group_prefix: Option<Vec<WordId>> = None;
        let mut group_words: Vec<WordId> = Vec::new();
        let mut group_recs: Vec<Rec> = Vec::new();

        let mut flush = |trie: &mut TrieBuilder,
                         prefix: &Option<Vec<WordId>>,
                         words: &mut Vec<WordId>,
                         recs: &mut Vec<Rec>,
                         logprob: &mut Vec<f32>,
                         backoff: &mut Vec<f32>,
                         logbound: &mut Vec<f32>|
         -> Result<()> {
            let Some(prefix) = prefix else { return Ok(()) };
            let parent = trie.locate(prefix).ok_or_else(|| {
                ModelError::Routing(format!(
                    "shard {shard}: no prefix {prefix:?} while indexing order {k}"
                ))
            })?;
            trie.add_children(parent, words)?;
            for rec in recs.iter() {
                logprob.push(rec.prob);
                if k < order {
                    logbound.push(rec.bound);
                    backoff.push(if rec.backoff == LOGPROB_MIN {
                        0.0
                    } else {
                        rec.backoff
                    });
                }
            }
            words.clear();
            recs.clear();
            Ok(())
        };

        for (key, rec) in &levels[k] {
            let prefix = &key[..k - 1];
            if group_prefix.as_deref() != Some(prefix) {
                flush(
                    &mut trie,
                    &group_prefix,
                    &mut group_words,
                    &mut group_recs,
                    &mut logprob,
                    &mut backoff,
                    &mut logbound,
                )?;
                group_prefix = Some(prefix.to_vec());
            }
            group_words.push(key[k - 1]);
            group_recs.push(*rec);
        }
        flush(
            &mut trie,
            &group_prefix,
            &mut group_words,
            &mut group_recs,
            &mut logprob,
            &mut backoff,
            &mut logbound,
        )?;
        trie.end_level();
        levels[k].clear();
    }

    let index = trie.finish(order, !model.backward)?;
    Ok(BackwardShard {
        index,
        logprob: finalize_floats(offset, &logprob, "backward.logprob")?,
        backoff: finalize_floats(offset, &backoff, "backward.backoff")?,
        logbound: if with_bounds {
            Some(finalize_floats(offset, &logbound, "backward.logbound")?)
        } else {
            None
        },
    })
}

fn parse_record(line: &str) -> Result<(Vec<WordId>, Rec)> {
    let fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
    if fields.len() < 5 {
        anyhow::bail!("malformed backward record {line:?}");
    }
    let (id_fields, payload) = fields.split_at(fields.len() - 3);
    let mut ids = Vec::with_capacity(id_fields.len());
    for f in id_fields {
        ids.push(
            f.parse::<WordId>()
                .with_context(|| format!("malformed backward record {line:?}"))?,
        );
    }
    Ok((
        ids,
        Rec {
            prob: decode_f32(payload[0])?,
            bound: decode_f32(payload[1])?,
            backoff: decode_f32(payload[2])?,
        },
    ))
}
