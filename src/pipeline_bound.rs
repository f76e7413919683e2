//! Upper-bound estimation.
//!
//! For every n-gram with a valid log-probability, the bound of each proper
//! suffix (in scoring orientation) is raised to at least that probability.
//! Bounds are seeded from the log-probability column itself, so a context's
//! bound also covers the context's own score. Unigram maxima accumulate in
//! the mapper and ship to shard 0 at the end of its walk; everything else is
//! routed to the shard owning the suffix. The top order keeps no bound
//! storage at all.

use crate::column::{finalize_floats, FloatColumn, LOGPROB_MIN};
use crate::error::ModelError;
use crate::model::{column_offset, NGram, NodeRef};
use crate::pipeline;
use crate::transport::{decode_f32, encode_f32, Collator, RecordStream};
use crate::trie::shard_index;
use anyhow::{Context, Result};
use std::fmt::Write as _;

pub fn run(model: &NGram, debug: bool) -> Result<Vec<FloatColumn>> {
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
    let index = &model.shards[shard].index;
    let shard_count = model.shard_count();
    let mut unigrams = vec![LOGPROB_MIN; index.unigram_count()];
    let mut line = String::new();

    for order_prev in 1..model.order {
        if debug {
            println!("bound mapper: shard: {shard} order: {}", order_prev + 1);
        }
        let first = index.offsets[order_prev - 1] as usize;
        let last = index.offsets[order_prev] as usize;
        for pos_context in first..last {
            let (child_first, child_last) = index.children_range(pos_context);
            if child_first == child_last {
                continue;
            }
            let mut path = index.path_to(pos_context);
            path.push(0);
            for pos in child_first..child_last {
                *path.last_mut().unwrap() = index.word_id(pos);
                let logprob = model.logprob_value(
                    NodeRef {
                        shard: shard as u32,
                        pos: pos as u32,
                    },
                    order_prev + 1,
                );
                if logprob == LOGPROB_MIN {
                    continue;
                }
                // Proper suffixes in scoring orientation: tails of a forward
                // path, heads of a backward one.
                for cut in 1..path.len() {
                    let suffix: &[u32] = if model.backward {
                        &path[..path.len() - cut]
                    } else {
                        &path[cut..]
                    };
                    if suffix.len() == 1 {
                        let slot = &mut unigrams[suffix[0] as usize];
                        if logprob > *slot {
                            *slot = logprob;
                        }
                    } else {
                        let target = shard_index(suffix, model.backward, shard_count);
                        line.clear();
                        for id in suffix {
                            write!(line, "{id} ").unwrap();
                        }
                        line.push_str(&encode_f32(logprob));
                        streams[target].write_line(&line)?;
                    }
                }
            }
        }
    }

    for (id, &bound) in unigrams.iter().enumerate() {
        if bound != LOGPROB_MIN {
            streams[0].write_line(&format!("{id} {}", encode_f32(bound)))?;
        }
    }
    Ok(())
}

fn reduce_shard(
    model: &NGram,
    shard: usize,
    mut collator: Collator,
    debug: bool,
) -> Result<FloatColumn> {
    let index = &model.shards[shard].index;
    let offset = column_offset(shard, index);
    let low_end = index.offsets[model.order - 1] as usize;

    // Seed from the log-probability column: a context bounds itself.
    let mut bounds = Vec::with_capacity(low_end.saturating_sub(offset));
    for pos in offset..low_end {
        bounds.push(model.logprob_value(
            NodeRef {
                shard: shard as u32,
                pos: pos as u32,
            },
            index.order_of(pos),
        ));
    }

    let mut received = 0u64;
    while let Some(line) = collator.next_line()? {
        let (ids, value) = parse_record(&line)?;
        let node = index.find(&ids).ok_or_else(|| {
            ModelError::Routing(format!("shard {shard}: no context for record {line:?}"))
        })?;
        if node < offset || node >= low_end {
            return Err(ModelError::Routing(format!(
                "shard {shard}: record {line:?} lands outside the bound range"
            ))
            .into());
        }
        let slot = &mut bounds[node - offset];
        if value > *slot {
            *slot = value;
        }
        received += 1;
    }
    if debug {
        println!("bound reducer: shard: {shard} records: {received}");
    }

    finalize_floats(offset, &bounds, "logbound")
}

fn parse_record(line: &str) -> Result<(Vec<u32>, f32)> {
    let mut fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
    let payload = fields
        .pop()
        .with_context(|| format!("malformed bound record {line:?}"))?;
    if fields.is_empty() {
        anyhow::bail!("malformed bound record {line:?}");
    }
    let mut ids = Vec::with_capacity(fields.len());
    for f in fields {
        ids.push(
            f.parse::<u32>()
                .with_context(|| format!("malformed bound record {line:?}"))?,
        );
    }
    Ok((ids, decode_f32(payload)?))
}
