//! Transform raw counts into modified (Kneser-Ney ready) counts.

use anyhow::{bail, Result};
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::{pipeline_modify, tempdir, NGram};

const USAGE: &str =
    "Usage: modify --ngram PATH --output PATH [--shard N] [--temporary PATH] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    let output = args.require_output()?;

    println!("=== Modified count computation ===");
    println!("[1/3] Loading model {}...", args.ngram.display());
    let mut model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;
    if model.shards.iter().any(|s| s.count.is_none()) {
        bail!("model carries no raw counts; nothing to modify");
    }

    println!("[2/3] Computing modified counts...");
    let columns = pipeline_modify::run(&model, args.debug)?;
    for (shard, column) in model.shards.iter_mut().zip(columns) {
        shard.modified = Some(column);
    }

    println!("[3/3] Writing {}...", output.display());
    model.write(&output)?;
    println!("✓ modified counts written");
    Ok(())
}
