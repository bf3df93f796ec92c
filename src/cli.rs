//! Command-line interface for kar

use clap::{ArgAction, ArgGroup, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kar", version)]
#[command(about = "kar - pack, list and unpack KAR (NCBI.sra) archives", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["create", "extract", "test"])))]
pub struct Cli {
    /// Create an archive from the contents of --directory
    #[arg(short = 'c', long, value_name = "ARCHIVE")]
    pub create: Option<PathBuf>,

    /// Extract an archive into --directory
    #[arg(short = 'x', long, value_name = "ARCHIVE")]
    pub extract: Option<PathBuf>,

    /// Check an archive and list its contents
    #[arg(short = 't', long = "test", visible_alias = "list", value_name = "ARCHIVE")]
    pub test: Option<PathBuf>,

    /// Source directory for create, destination for extract
    #[arg(short = 'd', long, value_name = "DIR", required_unless_present = "test")]
    pub directory: Option<PathBuf>,

    /// Overwrite an existing archive, or extract into an existing directory
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Write <ARCHIVE>.md5 next to the created archive
    #[arg(long, requires = "create")]
    pub md5: bool,

    /// Show type, permissions, size, offset and time when listing
    #[arg(short = 'l', long = "long-list", requires = "test")]
    pub long_list: bool,

    /// Leave this archive-relative path out (can be given multiple times)
    #[arg(long, value_name = "PATH", requires = "create")]
    pub drop: Vec<String>,

    /// Archive-relative paths to keep; everything else is left out
    #[arg(value_name = "FILTER", requires = "create")]
    pub filters: Vec<String>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// No progress bar or summary
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// The validated operation selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Create { archive: PathBuf, directory: PathBuf },
    Extract { archive: PathBuf, directory: PathBuf },
    Test { archive: PathBuf },
}

impl Cli {
    pub fn mode(&self) -> Option<Mode> {
        match (&self.create, &self.extract, &self.test) {
            (Some(archive), None, None) => Some(Mode::Create {
                archive: archive.clone(),
                directory: self.directory.clone()?,
            }),
            (None, Some(archive), None) => Some(Mode::Extract {
                archive: archive.clone(),
                directory: self.directory.clone()?,
            }),
            (None, None, Some(archive)) => Some(Mode::Test {
                archive: archive.clone(),
            }),
            _ => None,
        }
    }
}
