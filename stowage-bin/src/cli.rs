use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stowage::{Codec, Format};

pub fn parse_format(s: &str) -> Result<Format, String> {
    s.parse().map_err(|_| {
        format!(
            "unknown format (expected one of: {})",
            Format::available_variants().join(", ")
        )
    })
}

pub fn parse_codec(s: &str) -> Result<Codec, String> {
    s.parse().map_err(|_| {
        format!(
            "unknown filter (expected one of: {})",
            Codec::available_variants().join(", ")
        )
    })
}

#[derive(Debug, Parser)]
#[command(
    name = "stow",
    about = "Create, list and extract tar and zip archives.",
    version
)]
pub struct Cli {
    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(visible_alias = "c", about = "Create a new archive")]
    Create(CreateArgs),

    #[command(visible_aliases = ["l", "ls"], about = "List members of an archive")]
    List(ListArgs),

    #[command(visible_alias = "x", about = "Extract members of an archive")]
    Extract(ExtractArgs),
}

#[derive(Debug, clap::Args)]
pub struct CreateArgs {
    /// Output archive path
    pub archive: PathBuf,

    /// Files and directories to add
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Container format
    #[arg(short, long, default_value = "pax", value_parser = parse_format)]
    pub format: Format,

    /// Compression filter; may repeat for a layered chain, outermost first
    #[arg(short = 'z', long = "filter", value_parser = parse_codec)]
    pub filters: Vec<Codec>,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    /// Archive to list
    pub archive: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct ExtractArgs {
    /// Archive to extract
    pub archive: PathBuf,

    /// Destination directory (defaults to the current directory)
    #[arg(short = 'C', long = "directory")]
    pub output: Option<PathBuf>,

    /// Permit `..` components in member paths
    #[arg(long)]
    pub allow_dotdot: bool,

    /// Permit absolute member paths
    #[arg(long)]
    pub allow_absolute: bool,

    /// Permit symlinks that point outside the destination
    #[arg(long)]
    pub allow_escaping_symlinks: bool,

    /// Restore file ownership (usually needs privileges)
    #[arg(long)]
    pub ownership: bool,
}
