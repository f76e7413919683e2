//! Structural equality check across models.

use anyhow::Result;
use shardgram::opts::CommonArgs;
use shardgram::{tempdir, NGram};

const USAGE: &str = "Usage: diff --ngram PATH OTHER [OTHER...] [--debug]";

fn main() -> Result<()> {
    let _cleanup = tempdir::TempGuard;
    let args = CommonArgs::parse(USAGE)?;
    if args.rest.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    let first = NGram::open(&args.ngram)?;
    let mut differing = 0usize;
    for path in &args.rest {
        let other = NGram::open(std::path::Path::new(path))?;
        if first == other {
            println!("{path}: equal");
        } else {
            println!("{path}: differs from {}", args.ngram.display());
            differing += 1;
        }
    }
    if differing == 0 {
        println!("✓ all models structurally equal");
    }
    Ok(())
}
