//! Quantize float columns into 8-bit codes with per-order codebooks.

use anyhow::Result;
use shardgram::opts::{check_topology, CommonArgs};
use shardgram::{pipeline_quantize, tempdir, NGram};

const USAGE: &str =
    "Usage: quantize --ngram PATH --output PATH [--shard N] [--temporary PATH] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    let output = args.require_output()?;

    println!("=== Quantization ===");
    println!("[1/3] Loading model {}...", args.ngram.display());
    let mut model = NGram::open(&args.ngram)?;
    check_topology(args.shards, model.shard_count())?;

    println!("[2/3] Quantizing columns...");
    pipeline_quantize::run(&mut model, args.debug)?;

    println!("[3/3] Writing {}...", output.display());
    model.write(&output)?;
    println!("✓ quantized model written");
    Ok(())
}
