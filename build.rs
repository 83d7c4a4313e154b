//! Build script for generating the `sshprov` man pages.
//!
//! One page is rendered for the binary and one per subcommand
//! (`sshprov-apply.1`, `sshprov-preview.1`) into the build output directory.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(command: Command, out_dir: &Path, title: &str) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{title}.1")), buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    for subcommand in command.get_subcommands() {
        let title = format!("sshprov-{}", subcommand.get_name());
        render(subcommand.clone(), &out_dir, &title)?;
    }
    render(command, &out_dir, "sshprov")?;

    Ok(())
}
