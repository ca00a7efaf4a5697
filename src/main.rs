// ========================================================================================
//
//                         The tsqr command-line front end
//
// ========================================================================================
//
// Parses the historical single-dash flags (`-mat`, `-reduce_schedule`, ...), merges them
// over an optional TOML job file, and drives the stages on the local substrate.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{CommandFactory, Parser};
use std::error::Error;
use std::ffi::OsString;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use tsqr::config::JobConfig;
use tsqr::driver::{TsqrJob, run_job};
use tsqr::files::{read_matrix, write_text_matrix};
use tsqr::local::LocalRunner;
use tsqr::progress::ConsoleStageProgress;
use tsqr::types::{BlockFactor, KeyPolicy};

/// Exit status for a missing `-mat`.
const USAGE_EXIT_CODE: i32 = -1;

#[derive(Parser, Debug)]
#[command(
    name = "tsqr",
    version,
    about = "Compute the R factor of a tall-and-skinny matrix by tree-reduced QR",
    long_about = "Compute the R factor of a tall-and-skinny matrix by tree-reduced QR. \
                  Flags may be spelled with one dash (-mat) or two (--mat)."
)]
struct Cli {
    /// Input matrix: a typed-bytes record file, a .txt/.tsv/.gz text matrix, or a
    /// directory of such files
    #[arg(long = "mat", value_name = "PATH")]
    mat: Option<PathBuf>,

    /// Where the final R is written [default: <base>-qrr.<ext>]
    #[arg(long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Comma-separated reducer counts per stage; the last must be 1 [default: 1]
    #[arg(long = "reduce_schedule", value_name = "CSV")]
    reduce_schedule: Option<String>,

    /// Block factor k: rows buffered per compression are k times the column count
    /// [default: 3]
    #[arg(long = "block_size", value_name = "K", value_parser = parse_block_factor)]
    block_size: Option<BlockFactor>,

    /// Minimum partition size in bytes
    #[arg(long = "split_size", value_name = "BYTES")]
    split_size: Option<u64>,

    /// Per-task memory hint in bytes
    #[arg(long = "mem", value_name = "BYTES")]
    mem: Option<u64>,

    /// TOML job file; flags given here override its values
    #[arg(long = "conf", value_name = "PATH")]
    conf: Option<PathBuf>,

    /// How emitted rows are keyed for the shuffle: random or round_robin
    #[arg(long = "key_policy", value_name = "POLICY")]
    key_policy: Option<KeyPolicy>,

    /// Seed for the shuffle keys, for reproducible runs
    #[arg(long = "seed")]
    seed: Option<u64>,

    /// Worker threads [default: one per core]
    #[arg(long = "threads")]
    threads: Option<usize>,

    /// Print the final R to stdout
    #[arg(long = "print")]
    print: bool,
}

fn parse_block_factor(value: &str) -> Result<BlockFactor, String> {
    let k: usize = value
        .parse()
        .map_err(|e| format!("'{value}' is not a block factor: {e}"))?;
    BlockFactor::new(k).map_err(|e| e.to_string())
}

/// Rewrites `-name` to `--name` so the single-dash spellings parse as long flags.
/// Short flags (`-h`) and negative numbers pass through.
fn normalize_flag(arg: OsString) -> OsString {
    let Some(text) = arg.to_str() else {
        return arg;
    };
    let mut chars = text.chars();
    let single_dash_word = chars.next() == Some('-')
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.next().is_some();
    if single_dash_word {
        OsString::from(format!("-{text}"))
    } else {
        arg
    }
}

fn run(cli: Cli, mat: PathBuf) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let file_config = match &cli.conf {
        Some(path) => JobConfig::load(path)?,
        None => JobConfig::default(),
    };
    let flags = JobConfig {
        reduce_schedule: cli.reduce_schedule,
        block_size: cli.block_size,
        split_size: cli.split_size,
        mem: cli.mem,
        key_policy: cli.key_policy,
        seed: cli.seed,
        threads: cli.threads,
    };
    let config = file_config.overridden_by(flags);
    let job = TsqrJob::from_config(mat, cli.output, &config)?;

    let runner = match config.threads {
        Some(threads) => LocalRunner::with_threads(threads)?,
        None => LocalRunner::new(),
    };
    let progress = ConsoleStageProgress::new();
    let report = run_job(&job, &runner, &progress)?;

    eprintln!(
        "> {} stages, {} QR compressions, R in '{}' ({:.2?})",
        report.stages.len(),
        report.compressions(),
        report.output.display(),
        start_time.elapsed()
    );

    if cli.print {
        let r = read_matrix(&report.output)?;
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        write_text_matrix(&mut out, &r)?;
        out.flush()?;
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse_from(std::env::args_os().map(normalize_flag));
    let Some(mat) = cli.mat.clone() else {
        eprintln!("Error: -mat <PATH> is required\n");
        let mut command = Cli::command();
        eprintln!("{}", command.render_help());
        process::exit(USAGE_EXIT_CODE);
    };

    if let Err(e) = run(cli, mat) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(args: &[&str]) -> Vec<String> {
        args.iter()
            .map(|a| normalize_flag(OsString::from(a)).into_string().unwrap())
            .collect()
    }

    #[test]
    fn single_dash_flags_become_long_flags() {
        assert_eq!(
            normalized(&["tsqr", "-mat", "A", "-reduce_schedule", "4,1", "--seed", "1", "-h", "-3"]),
            vec!["tsqr", "--mat", "A", "--reduce_schedule", "4,1", "--seed", "1", "-h", "-3"]
        );
    }

    #[test]
    fn parses_every_flag() {
        let cli = Cli::try_parse_from(
            [
                "tsqr", "-mat", "A", "-output", "R", "-reduce_schedule", "40,1",
                "-block_size", "5", "-split_size", "1024", "-mem", "2048",
                "-key_policy", "round_robin", "-seed", "7", "-threads", "2", "-print",
            ]
            .into_iter()
            .map(|a| normalize_flag(OsString::from(a))),
        )
        .unwrap();
        assert_eq!(cli.mat, Some(PathBuf::from("A")));
        assert_eq!(cli.output, Some(PathBuf::from("R")));
        assert_eq!(cli.reduce_schedule.as_deref(), Some("40,1"));
        assert_eq!(cli.block_size.map(BlockFactor::get), Some(5));
        assert_eq!(cli.split_size, Some(1024));
        assert_eq!(cli.mem, Some(2048));
        assert_eq!(cli.key_policy, Some(KeyPolicy::RoundRobin));
        assert_eq!(cli.seed, Some(7));
        assert_eq!(cli.threads, Some(2));
        assert!(cli.print);
    }

    #[test]
    fn block_factor_below_two_is_rejected() {
        assert!(parse_block_factor("1").is_err());
        assert!(parse_block_factor("three").is_err());
        assert_eq!(parse_block_factor("2").unwrap().get(), 2);
        Cli::command().debug_assert();
    }
}
