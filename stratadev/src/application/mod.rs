pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use strata_core::error::Result;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Create {
            root,
            name,
            algo,
            key_hex,
        } => handlers::handle_create(root, name, algo, key_hex),
        Commands::Append {
            root,
            name,
            inputs,
            key_hex,
            align,
            parallel,
        } => handlers::handle_append(root, name, inputs, key_hex, align, parallel),
        Commands::Inspect { root, path } => handlers::handle_inspect(root, path),
        Commands::Query {
            root,
            name,
            key_hex,
            field,
            after,
            before,
        } => handlers::handle_query(root, name, key_hex, field, after, before),
    }
}
