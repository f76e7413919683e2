//! Estimate upper-bound log-probabilities for admissible decoder heuristics.

use anyhow::Result;
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::{pipeline_bound, tempdir, NGram};

const USAGE: &str =
    "Usage: bound --ngram PATH --output PATH [--shard N] [--temporary PATH] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    let output = args.require_output()?;

    println!("=== Upper bound estimation ===");
    println!("[1/3] Loading model {}...", args.ngram.display());
    let mut model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;
    println!(
        "  order: {}  shards: {}  backward: {}",
        model.order,
        model.shard_count(),
        model.backward
    );

    println!("[2/3] Estimating bounds...");
    let bounds = pipeline_bound::run(&model, args.debug)?;
    for (shard, column) in model.shards.iter_mut().zip(bounds) {
        shard.logbound = Some(column);
    }

    println!("[3/3] Writing {}...", output.display());
    model.write(&output)?;
    println!("✓ upper bounds written");
    Ok(())
}
