//! Shared command-line surface of the tools.
//!
//! Every command accepts `--ngram PATH`, `--output PATH`, `--shard N`,
//! `--temporary PATH`, `--debug`. Flags that a command does not use are
//! simply ignored by it; unrecognized arguments are kept in `rest` for
//! command-specific options.

use anyhow::{bail, Result};
use std::path::PathBuf;

pub struct CommonArgs {
    pub ngram: PathBuf,
    pub output: Option<PathBuf>,
    pub shards: usize,
    pub debug: bool,
    pub rest: Vec<String>,
}

impl CommonArgs {
    pub fn parse(usage: &str) -> Result<CommonArgs> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut ngram: Option<PathBuf> = None;
        let mut output: Option<PathBuf> = None;
        let mut shards = 0usize;
        let mut temporary: Option<String> = None;
        let mut debug = false;
        let mut rest = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--ngram" => {
                    ngram = Some(PathBuf::from(take_value(&args, &mut i, "--ngram")?));
                }
                "--output" => {
                    output = Some(PathBuf::from(take_value(&args, &mut i, "--output")?));
                }
                "--shard" => {
                    shards = take_value(&args, &mut i, "--shard")?.parse()?;
                }
                "--temporary" => {
                    temporary = Some(take_value(&args, &mut i, "--temporary")?);
                }
                "--debug" => debug = true,
                "--help" | "-h" => {
                    println!("{usage}");
                    std::process::exit(0);
                }
                other => rest.push(other.to_string()),
            }
            i += 1;
        }

        if let Some(dir) = &temporary {
            std::env::set_var("TMPDIR_SPEC", dir);
        }

        let Some(ngram) = ngram else {
            eprintln!("{usage}");
            std::process::exit(1);
        };
        Ok(CommonArgs {
            ngram,
            output,
            shards,
            debug,
            rest,
        })
    }

    pub fn require_output(&self) -> Result<PathBuf> {
        match &self.output {
            Some(path) => {
                if *path == self.ngram {
                    bail!("refusing to write over the input model");
                }
                Ok(path.clone())
            }
            None => bail!("--output is required"),
        }
    }

    /// Value of a command-specific `--flag value` pair from `rest`.
    pub fn rest_value(&self, flag: &str) -> Option<&str> {
        self.rest
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.rest.get(i + 1))
            .map(|s| s.as_str())
    }

    pub fn rest_flag(&self, flag: &str) -> bool {
        self.rest.iter().any(|a| a == flag)
    }
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String> {
    *i += 1;
    match args.get(*i) {
        Some(v) => Ok(v.clone()),
        None => bail!("{flag} needs a value"),
    }
}

/// Shard-count sanity: a non-zero request must match the model.
pub fn check_topology(requested: usize, actual: usize) -> Result<()> {
    if requested != 0 && requested != actual {
        return Err(crate::error::ModelError::Topology(format!(
            "model has {actual} shards, {requested} requested"
        ))
        .into());
    }
    Ok(())
}
