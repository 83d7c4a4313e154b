//! Command-line interface definitions for the `sshprov` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `sshprov` binary.
#[derive(Debug, Parser)]
#[command(
    name = "sshprov",
    about = "Provision a controller host over SSH from a declarative resource graph",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Copy the installer assets, run the installer, and print the exports.
    #[command(
        name = "apply",
        about = "Copy the installer assets, run the installer, and print the exports"
    )]
    Apply(StateArgs),
    /// Show what apply would do without touching the remote host.
    #[command(
        name = "preview",
        about = "Show what apply would do without touching the remote host"
    )]
    Preview(StateArgs),
}

/// Arguments shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct StateArgs {
    /// Override the state file location from configuration.
    #[arg(long, value_name = "PATH")]
    pub(crate) state: Option<String>,
}
