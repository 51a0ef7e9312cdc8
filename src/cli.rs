use clap::{Parser, Subcommand};

use crate::layout::DEFAULT_NFREE;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a file namespace and write a fresh layout into it.
    Create(CreateArgs),
    /// Print the layout of an existing namespace.
    Info(OpenArgs),
    /// Run the offline consistency check.
    Check(OpenArgs),
    /// Hex-dump one external block.
    Read(BlockArgs),
    /// Write one external block.
    Write(WriteArgs),
    /// Mark a block so reads return zeros.
    SetZero(BlockArgs),
    /// Mark a block so reads fail until it is rewritten.
    SetError(BlockArgs),
}

#[derive(Parser, Debug)]
pub struct CreateArgs {
    pub path: String,
    /// Namespace size in bytes.
    #[arg(short, long, value_parser = num_parser)]
    pub size: usize,
    #[arg(short, long, default_value_t = 512)]
    pub lbasize: u32,
    /// Free blocks (and lanes) per arena.
    #[arg(short, long, default_value_t = DEFAULT_NFREE)]
    pub nfree: u32,
}

#[derive(Parser, Debug)]
pub struct OpenArgs {
    pub path: String,
    #[arg(short, long, default_value_t = 512)]
    pub lbasize: u32,
    /// Maximum concurrent lanes to configure.
    #[arg(long, default_value_t = num_cpus::get() as u32)]
    pub maxlane: u32,
}

#[derive(Parser, Debug)]
pub struct BlockArgs {
    #[command(flatten)]
    pub open: OpenArgs,
    pub lba: u64,
}

#[derive(Parser, Debug)]
pub struct WriteArgs {
    #[command(flatten)]
    pub open: OpenArgs,
    pub lba: u64,
    /// File providing exactly one block of data; - reads stdin.
    #[arg(short, long, conflicts_with = "fill")]
    pub input: Option<String>,
    /// Fill the block with one byte value instead.
    #[arg(short, long, value_parser = num_parser)]
    pub fill: Option<usize>,
}

static NUM_PARSER_ERR: &str = "Invalid number. Must be base-10, or start with 0x or 0b.";

pub fn num_parser(s: &str) -> Result<usize, &'static str> {
    match s.get(0..2) {
        Some("0x") => usize::from_str_radix(&s[2..], 16).map_err(|_| NUM_PARSER_ERR),
        Some("0b") => usize::from_str_radix(&s[2..], 2).map_err(|_| NUM_PARSER_ERR),
        _ => s.parse::<usize>().map_err(|_| NUM_PARSER_ERR),
    }
}
