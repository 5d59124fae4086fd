use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,
    /// If enabled, surpress all output.
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,
    /// Enable debug logging.
    ///
    /// - Level 1 enables ERROR, WARN and INFO.
    /// - Level 2 enables DEBUG.
    /// - Level 3 and up enables TRACE.
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Arguments {
    pub fn pretty_output(&self) -> bool {
        !self.quiet && self.verbose == 0
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new mallard project in the current directory.
    Init,
    /// Compile route sources into executable route records.
    Compile {
        /// Directory holding the route sources.
        #[arg(short, long)]
        source: Option<PathBuf>,
        /// Directory the compiled records are written to.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Compile (if needed) and start the mallard webserver. Configured in `mallard.toml`.
    Serve {
        /// Skip compilation and serve previously compiled routes as-is.
        #[arg(long)]
        precompiled: bool,
    },
    /// Inspect and manipulate the page cache.
    #[command(subcommand)]
    Cache(CacheSubcommand),
}

#[derive(Debug, Subcommand)]
pub enum CacheSubcommand {
    /// Displays cache usage statistics (pages and disk space per route).
    Stat,
    /// Wipes every cached page. The meta database is left untouched.
    Clear,
}
