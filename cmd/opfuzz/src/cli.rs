use std::{
    fs::{metadata, read_dir, read_to_string},
    path::{Path, PathBuf},
};

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use eyre::{WrapErr, bail};
use opfuzz::{Fuzzer, FuzzerConfig};
use tracing::{Level, error, info, warn};

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(name = "opfuzz", author, version = VERSION_STRING, about = "Mutation fuzzer for the bytecode compiler backend", long_about = None)]
pub struct CLI {
    #[clap(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser)]
pub struct Options {
    #[arg(long = "log.level", default_value_t = Level::INFO, value_name = "LOG_LEVEL", global = true)]
    pub log_level: Level,
    #[arg(long = "seed", value_name = "SEED", global = true)]
    pub seed: Option<u64>,
    #[arg(
        long = "substitution-percent",
        value_name = "PERCENT",
        value_parser = clap::value_parser!(u8).range(0..=100),
        global = true
    )]
    pub substitution_percent: Option<u8>,
    #[arg(long = "no-jit", action = ArgAction::SetTrue, global = true, help = "Stop after verification")]
    pub no_jit: bool,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[clap(name = "compile", about = "Fuzz a single program and print the mutated unit")]
    Compile {
        #[clap(
            long = "codestr",
            value_name = "SOURCE",
            conflicts_with = "file",
            required_unless_present = "file"
        )]
        codestr: Option<String>,
        #[clap(long = "file", value_name = "FILE_PATH")]
        file: Option<PathBuf>,
    },
    #[clap(name = "run", about = "Run a fuzzing campaign over a corpus")]
    Run {
        #[clap(
            required = true,
            value_name = "FILE_PATH/FOLDER",
            help = "Source files, or folders containing them"
        )]
        paths: Vec<PathBuf>,
        #[clap(long = "iterations", default_value_t = 1000, value_name = "N")]
        iterations: u64,
        #[clap(long = "output", value_name = "REPORT_PATH")]
        output: Option<PathBuf>,
    },
}

impl Subcommand {
    pub fn run(self, config: FuzzerConfig) -> eyre::Result<()> {
        match self {
            Subcommand::Compile { codestr, file } => {
                let source = match (codestr, file) {
                    (Some(source), _) => source,
                    (None, Some(path)) => read_to_string(&path)
                        .wrap_err_with(|| format!("Failed to read {}", path.display()))?,
                    (None, None) => bail!("either --codestr or --file is required"),
                };
                let result = Fuzzer::new(config)?
                    .fuzz(&source)
                    .inspect_err(|err| error!(%err, "Fuzzer invariant violated"))?;
                println!("{}", result.outcome);
                if let Some(detail) = &result.detail {
                    println!("{detail}");
                }
                if let Some(unit) = &result.unit {
                    println!("{unit}");
                }
            }
            Subcommand::Run {
                paths,
                iterations,
                output,
            } => {
                let corpus = read_corpus(&paths)?;
                info!(entries = corpus.len(), iterations, "Starting campaign");
                let report = Fuzzer::new(config)?
                    .run_campaign(&corpus, iterations)
                    .inspect_err(|err| error!(%err, "Fuzzer invariant violated"))?;
                let json = serde_json::to_string_pretty(&report)?;
                match output {
                    Some(path) => std::fs::write(&path, json)
                        .wrap_err_with(|| format!("Failed to write {}", path.display()))?,
                    None => println!("{json}"),
                }
                if !report.findings.is_empty() {
                    bail!("{} JIT errors found", report.findings.len());
                }
            }
        }
        Ok(())
    }
}

fn read_corpus(paths: &[PathBuf]) -> eyre::Result<Vec<String>> {
    let mut corpus = Vec::new();
    for path in paths {
        let path_metadata =
            metadata(path).wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        if path_metadata.is_dir() {
            let mut files = read_dir(path)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<Vec<_>, _>>()?;
            files.sort();
            for file in files.iter().filter(|f| f.is_file()) {
                corpus.push(read_source(file)?);
            }
        } else {
            corpus.push(read_source(path)?);
        }
    }
    if corpus.is_empty() {
        warn!("Corpus is empty");
    }
    Ok(corpus)
}

fn read_source(path: &Path) -> eyre::Result<String> {
    read_to_string(path).wrap_err_with(|| format!("Failed to read {}", path.display()))
}
