//! Build script rendering the `kvtestbed` man pages.
//!
//! One page is written for the binary and one per subcommand
//! (`kvtestbed-run.1`, `kvtestbed-fault.1`, ...) into the build output
//! directory, where packaging picks them up.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let command = Cli::command();
    render(&out_dir, "kvtestbed.1", command.clone())?;
    for sub in command.get_subcommands() {
        let page = format!("kvtestbed-{}.1", sub.get_name());
        render(&out_dir, &page, sub.clone())?;
    }

    Ok(())
}

fn render(out_dir: &Path, page: &str, command: clap::Command) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).render(&mut buffer)?;
    fs::write(out_dir.join(page), buffer)
}
