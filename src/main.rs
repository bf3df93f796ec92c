//! kar - KAR archive tool

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use kar_core::{create, extract, list, CreateOptions, ErrorClass, ExtractOptions, KarError, ListOptions, ProgressFn};
use log::{debug, LevelFilter};
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

mod cli;
use cli::{Cli, Mode};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("kar: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let mode = cli.mode().ok_or_else(|| anyhow!("exactly one of --create, --extract or --test is required"))?;
    debug!("{:?}", mode);

    let bar = progress_bar(cli.quiet)?;
    let progress = bar.as_ref().map(|pb| {
        let pb = pb.clone();
        let f: ProgressFn = Arc::new(move |current: usize, total: usize, msg: &str| {
            pb.set_length(total as u64);
            pb.set_position(current as u64);
            pb.set_message(msg.to_string());
        });
        f
    });

    match mode {
        Mode::Create { archive, directory } => {
            let options = CreateOptions {
                force: cli.force,
                md5: cli.md5,
                keep: cli.filters.clone(),
                drop: cli.drop.clone(),
                progress,
                ..Default::default()
            };
            let summary = create(&directory, &archive, &options)
                .with_context(|| format!("creating '{}' from '{}'", archive.display(), directory.display()))?;

            if let Some(pb) = bar {
                pb.finish_and_clear();
            }
            if !cli.quiet {
                println!("Archive created: {}", archive.display());
                println!(
                    "  {} files, {} directories, {} links",
                    summary.files, summary.directories, summary.aliases
                );
                println!("  TOC: {} bytes, data at offset {}", summary.toc_size, summary.data_start);
                println!("  Archive size: {} bytes", summary.archive_size);
            }
        }

        Mode::Extract { archive, directory } => {
            let options = ExtractOptions {
                force: cli.force,
                progress,
                ..Default::default()
            };
            let summary = extract(&archive, &directory, &options)
                .with_context(|| format!("extracting '{}' into '{}'", archive.display(), directory.display()))?;

            if let Some(pb) = bar {
                pb.finish_and_clear();
            }
            if !cli.quiet {
                println!("Extracted {} into {}", archive.display(), directory.display());
                println!(
                    "  {} files ({} bytes), {} directories, {} links",
                    summary.files, summary.bytes, summary.directories, summary.aliases
                );
            }
        }

        Mode::Test { archive } => {
            let listing = list(&archive, &ListOptions { long: cli.long_list })
                .with_context(|| format!("testing '{}'", archive.display()))?;
            print!("{}", listing);
        }
    }

    Ok(())
}

/// A bar on stderr when it is a terminal and output is not silenced.
fn progress_bar(quiet: bool) -> Result<Option<ProgressBar>> {
    if quiet || !std::io::stderr().is_terminal() {
        return Ok(None);
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(Some(pb))
}

/// Process status for a failed run, by the kind of archive error behind it.
fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(kar) = err.chain().find_map(|e| e.downcast_ref::<KarError>()) else {
        return 1;
    };
    match kar {
        KarError::UnsupportedVersion(_) => 2,
        KarError::TocTruncated { .. } | KarError::TocCorrupt(_) => 3,
        other => match other.class() {
            ErrorClass::Format => 1,
            ErrorClass::Io => 4,
            ErrorClass::Encoding | ErrorClass::DuplicateName => 5,
            ErrorClass::Cancelled => 130,
        },
    }
}
