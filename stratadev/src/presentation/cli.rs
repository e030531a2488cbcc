use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "stratadev CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an empty signed index in a local store
    Create {
        /// store root directory
        root: PathBuf,
        /// index object name, e.g. "db/table/index"
        name: String,
        #[arg(long, default_value = "zstd")]
        algo: String,
        /// 32-byte signing key, hex
        #[arg(long = "key")]
        key_hex: String,
    },
    /// Ingest inputs into the index (idempotent per (path, etag))
    Append {
        root: PathBuf,
        name: String,
        /// input object names inside the store (or directories to scan)
        inputs: Vec<String>,
        #[arg(long = "key")]
        key_hex: String,
        /// chunk alignment (power of two)
        #[arg(long, default_value_t = 1 << 20)]
        align: usize,
        #[arg(long, default_value_t = 1)]
        parallel: usize,
    },
    /// Print the trailer of a packfile
    Inspect {
        root: PathBuf,
        /// packfile object name
        path: String,
    },
    /// List packfiles that may hold rows in a time range
    Query {
        root: PathBuf,
        name: String,
        #[arg(long = "key")]
        key_hex: String,
        /// timestamp field path, e.g. "ts"
        #[arg(long, default_value = "ts")]
        field: String,
        /// RFC3339 lower bound
        #[arg(long)]
        after: Option<String>,
        /// RFC3339 upper bound
        #[arg(long)]
        before: Option<String>,
    },
}
