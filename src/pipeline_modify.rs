//! Modified (Kneser-Ney ready) count computation.
//!
//! Every stored (context, word) contributes one "type seen" toward the
//! modified count of its shorter context. `<s>`-headed contexts are the
//! standard exception: nothing can precede them, so they re-emit their raw
//! count instead and keep it. Reducers sum contributions into a packed
//! 64-bit column covering orders below the top.

use crate::column::{finalize_counts, CountColumn};
use crate::error::ModelError;
use crate::model::{column_offset, NGram};
use crate::pipeline;
use crate::transport::{Collator, RecordStream};
use crate::trie::shard_index;
use crate::vocab::BOS_ID;
use anyhow::{Context, Result};
use std::fmt::Write as _;

pub fn run(model: &NGram, debug: bool) -> Result<Vec<CountColumn>> {
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
    let counts = data
        .count
        .as_ref()
        .ok_or_else(|| ModelError::ModelIntegrity("model carries no raw counts".into()))?;
    let shard_count = model.shard_count();
    let mut unigrams = vec![0u64; index.unigram_count()];
    let mut line = String::new();

    for order_prev in 1..model.order {
        if debug {
            println!("modify counts: shard: {shard} order: {}", order_prev + 1);
        }
        let first = index.offsets[order_prev - 1] as usize;
        let last = index.offsets[order_prev] as usize;
        for pos_context in first..last {
            // The <s> unigram keeps its raw count; shard 0 owns it.
            if shard == 0 && order_prev == 1 && index.word_id(pos_context) == BOS_ID {
                unigrams[BOS_ID as usize] += counts.value(pos_context);
            }
            let (child_first, child_last) = index.children_range(pos_context);
            if child_first == child_last {
                continue;
            }
            let mut path = index.path_to(pos_context);
            path.push(0);
            for pos in child_first..child_last {
                *path.last_mut().unwrap() = index.word_id(pos);
                // Structural children belong to another shard's n-gram;
                // counting them here would double-count.
                if shard_index(&path, model.backward, shard_count) != shard {
                    continue;
                }

                // Types-following contribution to the context one word
                // shorter (drop the oldest word).
                let tail: &[u32] = if model.backward {
                    &path[..path.len() - 1]
                } else {
                    &path[1..]
                };
                if tail.len() == 1 {
                    unigrams[tail[0] as usize] += 1;
                } else {
                    let target = shard_index(tail, model.backward, shard_count);
                    line.clear();
                    for id in tail {
                        write!(line, "{id} ").unwrap();
                    }
                    line.push('1');
                    streams[target].write_line(&line)?;
                }

                // <s>-headed contexts preserve their raw count.
                let oldest = if model.backward {
                    *path.last().unwrap()
                } else {
                    path[0]
                };
                if oldest == BOS_ID && order_prev + 1 != model.order {
                    let raw = counts.value(pos);
                    let target = shard_index(&path, model.backward, shard_count);
                    line.clear();
                    for id in &path {
                        write!(line, "{id} ").unwrap();
                    }
                    write!(line, "{raw}").unwrap();
                    streams[target].write_line(&line)?;
                }
            }
        }
    }

    for (id, &count) in unigrams.iter().enumerate() {
        if count > 0 {
            streams[0].write_line(&format!("{id} {count}"))?;
        }
    }
    Ok(())
}

fn reduce_shard(
    model: &NGram,
    shard: usize,
    mut collator: Collator,
    debug: bool,
) -> Result<CountColumn> {
    let index = &model.shards[shard].index;
    let offset = column_offset(shard, index);
    let low_end = index.offsets[model.order - 1] as usize;
    let mut modified = vec![0u64; low_end.saturating_sub(offset)];

    let mut received = 0u64;
    while let Some(line) = collator.next_line()? {
        let (ids, delta) = parse_record(&line)?;
        let node = index.find(&ids).ok_or_else(|| {
            ModelError::Routing(format!("shard {shard}: no context for record {line:?}"))
        })?;
        if node < offset || node >= low_end {
            return Err(ModelError::Routing(format!(
                "shard {shard}: record {line:?} lands outside the modified range"
            ))
            .into());
        }
        modified[node - offset] += delta;
        received += 1;
    }
    if debug {
        println!("modify reducer: shard: {shard} records: {received}");
    }

    finalize_counts(offset, &modified, "modified")
}

fn parse_record(line: &str) -> Result<(Vec<u32>, u64)> {
    let mut fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
    let payload = fields
        .pop()
        .with_context(|| format!("malformed count record {line:?}"))?;
    if fields.is_empty() {
        anyhow::bail!("malformed count record {line:?}");
    }
    let mut ids = Vec::with_capacity(fields.len());
    for f in fields {
        ids.push(
            f.parse::<u32>()
                .with_context(|| format!("malformed count record {line:?}"))?,
        );
    }
    let delta = payload
        .parse::<u64>()
        .with_context(|| format!("malformed count record {line:?}"))?;
    Ok((ids, delta))
}
