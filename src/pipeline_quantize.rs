//! Column quantization: per order, histogram the floats, build a greedy
//! 256-entry codebook, and rewrite the column as bytes.
//!
//! Unigrams are quantized once, on shard 0; the other shards never read
//! their local unigram range, so their order-1 codebook stays zeroed, the
//! same arrangement the shard-0 redirect relies on everywhere else.
//! Already-quantized columns are left untouched.

use crate::column::{FloatColumn, CODEBOOK_SIZE};
use crate::model::NGram;
use crate::quantizer;
use crate::storage::Store;
use crate::trie::TrieShard;
use anyhow::{anyhow, Result};

pub fn run(model: &mut NGram, debug: bool) -> Result<()> {
    let order = model.order;
    let mut replacements: Vec<Result<ShardReplacement>> = Vec::new();

    std::thread::scope(|scope| {
        let handles: Vec<_> = model
            .shards
            .iter()
            .enumerate()
            .map(|(s, shard)| {
                scope.spawn(move || -> Result<ShardReplacement> {
                    let mut out = ShardReplacement::default();
                    // Empty columns still become (empty) quantized columns;
                    // the manifest flag covers every shard uniformly.
                    if !shard.logprob.is_quantized() {
                        if debug {
                            println!("shard: {s} quantize logprob");
                        }
                        out.logprob = Some(quantize_column(&shard.logprob, &shard.index, s, order)?);
                    }
                    if !shard.backoff.is_quantized() {
                        if debug {
                            println!("shard: {s} quantize backoff");
                        }
                        out.backoff = Some(quantize_column(&shard.backoff, &shard.index, s, order)?);
                    }
                    if let Some(bound) = &shard.logbound {
                        if !bound.is_quantized() {
                            if debug {
                                println!("shard: {s} quantize logbound");
                            }
                            out.logbound = Some(quantize_column(bound, &shard.index, s, order)?);
                        }
                    }
                    Ok(out)
                })
            })
            .collect();
        replacements = handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("quantize task panicked")))
            })
            .collect();
    });

    for (shard, replacement) in model.shards.iter_mut().zip(replacements) {
        let replacement = replacement?;
        if let Some(col) = replacement.logprob {
            shard.logprob = col;
        }
        if let Some(col) = replacement.backoff {
            shard.backoff = col;
        }
        if let Some(col) = replacement.logbound {
            shard.logbound = Some(col);
        }
    }
    Ok(())
}

#[derive(Default)]
struct ShardReplacement {
    logprob: Option<FloatColumn>,
    backoff: Option<FloatColumn>,
    logbound: Option<FloatColumn>,
}

fn quantize_column(
    column: &FloatColumn,
    index: &TrieShard,
    shard: usize,
    order: usize,
) -> Result<FloatColumn> {
    let offset = column.offset();
    let end = offset + column.len();
    let mut codes = vec![0u8; column.len()];
    let mut books = vec![[0.0f32; CODEBOOK_SIZE]; order + 1];

    for k in 1..=order {
        if k == 1 && shard != 0 {
            continue;
        }
        let first = (index.offsets[k - 1] as usize).max(offset);
        let last = (index.offsets[k] as usize).min(end);
        if first >= last {
            continue;
        }
        let book = quantizer::build((first..last).map(|pos| column.value(pos, k)));
        for pos in first..last {
            let value = column.value(pos, k);
            let code = book
                .code(value)
                .ok_or_else(|| anyhow!("no code for value {value} at order {k}"))?;
            codes[pos - offset] = code;
        }
        books[k] = book.centroids;
    }

    Ok(FloatColumn::quantized(offset, Store::Owned(codes), books))
}
