#![forbid(unsafe_code)]

mod commands;
mod script;

use anyhow::{Context, Result, bail};
use std::env;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vdfs::{EngineConfig, Vdfs};

use crate::script::Command;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Flags shared by `run` and `repl`.
struct Options {
    json: bool,
    config: Option<PathBuf>,
}

fn parse_options(args: impl Iterator<Item = String>) -> Result<Options> {
    let mut options = Options {
        json: false,
        config: None,
    };
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => options.json = true,
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config requires a file argument");
                };
                options.config = Some(PathBuf::from(path));
            }
            other => bail!("unknown option: {other}"),
        }
    }
    Ok(options)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
    EngineConfig::from_json(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn run() -> Result<()> {
    init_logging();
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "run" => {
            let Some(script) = args.next() else {
                bail!("run requires a script path");
            };
            let options = parse_options(args)?;
            let file = std::fs::File::open(&script).with_context(|| format!("failed to open script {script}"))?;
            run_lines(io::BufReader::new(file), &options, false)
        }
        "repl" => {
            let options = parse_options(args)?;
            run_lines(io::stdin().lock(), &options, true)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a disk path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("vdfs-cli\n");
    println!("USAGE:");
    println!("  vdfs-cli run <script> [--json] [--config <file>]");
    println!("  vdfs-cli repl [--json] [--config <file>]");
    println!("  vdfs-cli inspect <disk.mia> [--json]");
    println!();
    println!("Script lines look like `mkdisk -size=5 -unit=M -path=/tmp/d.mia`.");
}

/// Execute one command per line. Command failures are reported and the
/// next line runs; only reading the input can abort.
fn run_lines(input: impl BufRead, options: &Options, prompt: bool) -> Result<()> {
    let mut engine = Vdfs::new(load_config(options.config.as_deref())?).context("invalid engine config")?;
    let mut failures = 0_usize;
    if prompt {
        print_prompt()?;
    }
    for (number, line) in input.lines().enumerate() {
        let line = line.context("failed to read input")?;
        let outcome = Command::parse(&line).and_then(|parsed| match parsed {
            Some(cmd) => {
                tracing::debug!(line = number + 1, command = %cmd.name, "executing");
                commands::execute(&mut engine, &cmd, options.json)
            }
            None => Ok(()),
        });
        if let Err(error) = outcome {
            failures += 1;
            eprintln!("error: line {}: {error:#}", number + 1);
        }
        if prompt {
            print_prompt()?;
        }
    }
    if failures > 0 {
        tracing::info!(failures, "finished with failed commands");
    }
    Ok(())
}

fn print_prompt() -> Result<()> {
    print!("vdfs> ");
    io::stdout().flush().context("flush stdout")
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let engine = Vdfs::new(EngineConfig::default())?;
    let rows = engine
        .list_partitions(path)
        .with_context(|| format!("failed to read partition table of {}", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows).context("serialize output")?);
    } else {
        println!("VDFS Inspector");
        println!("disk: {}", path.display());
        println!("{}", commands::partition_table(&rows));
    }
    Ok(())
}
