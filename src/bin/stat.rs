//! Per-component byte, stored, and cache counters.

use anyhow::Result;
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::stats::Stat;
use shardgram::{tempdir, NGram};

const USAGE: &str = "Usage: stat --ngram PATH [--shard N] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;

    let model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;

    println!(
        "{:<16} {:>14} {:>14} {:>10}",
        "component", "bytes", "compressed", "cache"
    );
    let mut total = Stat::default();
    for (name, stat) in model.stat() {
        println!(
            "{:<16} {:>14} {:>14} {:>10}",
            name, stat.bytes, stat.compressed, stat.cache
        );
        total += stat;
    }
    println!(
        "{:<16} {:>14} {:>14} {:>10}",
        "total", total.bytes, total.compressed, total.cache
    );
    Ok(())
}
