//! Dump every stored n-gram with its column values as text.

use anyhow::Result;
use shardgram::model::NodeRef;
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::{tempdir, NGram, LOGPROB_MIN};
use std::io::{BufWriter, Write};

const USAGE: &str = "Usage: dump --ngram PATH [--output PATH|-] [--shard N] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    let out_path = args.rest_value("--output").unwrap_or("-").to_string();

    let model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;

    let mut out: Box<dyn Write> = if out_path == "-" {
        Box::new(BufWriter::new(std::io::stdout()))
    } else {
        Box::new(BufWriter::new(std::fs::File::create(&out_path)?))
    };

    for (s, shard) in model.shards.iter().enumerate() {
        writeln!(out, "# shard {s}")?;
        for k in 1..=model.order {
            // Unigram data is global; print it once.
            if k == 1 && s != 0 {
                continue;
            }
            let first = shard.index.offsets[k - 1] as usize;
            let last = shard.index.offsets[k] as usize;
            for pos in first..last {
                let path = shard.index.path_to(pos);
                let words: Vec<String> = path
                    .iter()
                    .map(|&id| model.vocab.word(id).unwrap_or_else(|| "<?>".into()))
                    .collect();
                let node = NodeRef {
                    shard: s as u32,
                    pos: pos as u32,
                };
                write!(out, "{k}\t{}\t{}", words.join(" "), fmt(model.logprob_value(node, k)))?;
                if k < model.order {
                    write!(out, " {}", fmt(model.backoff_value(node, k)))?;
                    if let Some(bound) = model.logbound_value(node, k) {
                        write!(out, " {}", fmt(bound))?;
                    }
                }
                if let Some(counts) = &shard.count {
                    if pos >= counts.offset() {
                        write!(out, "\tcount={}", counts.value(pos))?;
                    }
                }
                if let Some(modified) = &shard.modified {
                    if pos >= modified.offset() && pos < modified.offset() + modified.len() {
                        write!(out, "\tmodified={}", modified.value(pos))?;
                    }
                }
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

fn fmt(v: f32) -> String {
    if v == LOGPROB_MIN {
        "-inf".to_string()
    } else {
        format!("{v}")
    }
}
