//! Score whitespace-tokenized sentences and report perplexity.
//!
//! Unknown tokens are counted separately; the log-probability total is
//! reported both with and without their contribution.

use anyhow::{Context, Result};
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::{tempdir, NGram, UNK_ID};
use std::io::{BufRead, BufReader, Write};

const USAGE: &str = "Usage: perplexity --ngram PATH [--input PATH|-] [--output PATH|-] \
[--order N] [--include-oov] [--shard N] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    let input = args.rest_value("--input").unwrap_or("-").to_string();
    let out_path = args.rest_value("--output").unwrap_or("-").to_string();
    let order_cap: usize = args
        .rest_value("--order")
        .map(|v| v.parse())
        .transpose()?
        .unwrap_or(0);
    let include_oov = args.rest_flag("--include-oov");

    let model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;
    let limit = if order_cap == 0 {
        model.order
    } else {
        order_cap.min(model.order)
    };

    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        Box::new(BufReader::new(
            std::fs::File::open(&input).with_context(|| format!("failed to open {input}"))?,
        ))
    };

    let bos_state = model.lookup_context(&[shardgram::BOS_ID]);
    let eos = shardgram::EOS_ID;

    let mut logprob_total = 0.0f64;
    let mut logprob_total_oov = 0.0f64;
    let mut num_word = 0u64;
    let mut num_oov = 0u64;
    let mut num_sentence = 0u64;

    for line in reader.lines() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let mut ids: Vec<u32> = tokens.iter().map(|t| model.vocab.lookup(t)).collect();
        ids.push(eos);

        let mut state = bos_state.clone();
        for &id in &ids {
            let scratch = state.truncated(limit - 1);
            let (next, result) = model.ngram_score(&scratch, id);
            let is_oov = id == UNK_ID;
            logprob_total_oov += result.exact as f64;
            if !is_oov {
                logprob_total += result.exact as f64;
            }
            num_oov += is_oov as u64;
            state = next;
        }
        num_word += tokens.len() as u64;
        num_sentence += 1;
    }

    let total = if include_oov {
        logprob_total_oov
    } else {
        logprob_total
    };
    let ppl = (-total / (num_word - num_oov + num_sentence) as f64).exp();
    let ppl1 = (-total / (num_word - num_oov) as f64).exp();

    let mut out: Box<dyn Write> = if out_path == "-" {
        Box::new(std::io::stdout())
    } else {
        Box::new(std::fs::File::create(&out_path)?)
    };
    writeln!(
        out,
        "# of sentences: {num_sentence} # of words: {num_word} # of OOV: {num_oov} order: {limit}"
    )?;
    writeln!(out, "logprob = {logprob_total} logprob(+oov) = {logprob_total_oov}")?;
    writeln!(out, "ppl  = {ppl}")?;
    writeln!(out, "ppl1 = {ppl1}")?;
    Ok(())
}
