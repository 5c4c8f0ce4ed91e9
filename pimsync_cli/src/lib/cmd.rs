//! Commands for the pimsync CLI
//!

use std::path::PathBuf;

use clap::{self, Args, Parser, Subcommand};

use pimsync_core::logging::LevelFilter;

/// pimsync: declarative privileged access for Azure
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None, arg_required_else_help = true)]
pub(crate) struct PimsyncArgs {
    #[clap(subcommand)]
    pub(crate) command: PimsyncCommand,
    #[clap(global = true, short = 'v', long)]
    pub(crate) log_level: Option<LevelFilter>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum PimsyncCommand {
    /// Show the changes needed to make Azure match the configuration
    Plan {
        #[clap(flatten)]
        source: SourceArgs,
    },
    /// Make the planned changes
    Apply {
        #[clap(flatten)]
        source: SourceArgs,
        /// Skip the confirmation prompt
        #[clap(long, value_parser, default_value = "false")]
        auto_approve: bool,
    },
}

/// Where the configuration and credentials come from
#[derive(Args, Debug, Clone)]
pub(crate) struct SourceArgs {
    /// A config file, or a directory of them. Defaults to ./pimsync.yaml
    #[clap(short, long, value_parser)]
    pub(crate) config: Option<PathBuf>,
    /// The credentials file. Defaults to ~/.pimsync/credentials.yaml
    #[clap(long, value_parser)]
    pub(crate) credentials: Option<PathBuf>,
}
