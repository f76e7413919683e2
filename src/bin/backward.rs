//! Rebuild a model with every stored context reversed for right-to-left
//! scoring.

use anyhow::Result;
use shardgram::model::Shard;
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::{pipeline_backward, tempdir, NGram};

const USAGE: &str =
    "Usage: backward --ngram PATH --output PATH [--shard N] [--temporary PATH] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    let output = args.require_output()?;

    println!("=== Backward trie construction ===");
    println!("[1/3] Loading model {}...", args.ngram.display());
    let model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;
    println!(
        "  order: {}  shards: {}  backward: {} -> {}",
        model.order,
        model.shard_count(),
        model.backward,
        !model.backward
    );

    println!("[2/3] Reversing contexts...");
    let rebuilt = pipeline_backward::run(&model, args.debug)?;

    let NGram {
        vocab,
        order,
        backward,
        smooth,
        shards: _,
    } = model;
    let shards = rebuilt
        .into_iter()
        .map(|b| Shard {
            index: b.index,
            logprob: b.logprob,
            backoff: b.backoff,
            logbound: b.logbound,
            count: None,
            modified: None,
        })
        .collect();
    let out = NGram {
        vocab,
        shards,
        order,
        backward: !backward,
        smooth,
    };

    println!("[3/3] Writing {}...", output.display());
    out.write(&output)?;
    println!("✓ backward model written");
    Ok(())
}
