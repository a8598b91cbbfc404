//! Thin CLI surface: parses arguments into a [`Command`] and hands off to
//! `main.rs`. Configuration *file loading* lives in [`crate::config`]; this
//! module only decides which file/paths the user named, per spec.md §1's
//! explicit non-goal on argument-parsing logic.
//!
//! Grounded on the teacher's `clap`-derived `Args`/`Commands` shape
//! (`Create`/`Extract`/`List` subcommands, short aliases, `#[arg(long)]`
//! conventions) — this crate scans and generates rules instead of
//! archiving, so the two subcommands are `Scan` and `Rules`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Recursively unpack and identify one input file into a
    /// meta-directory store.
    #[command(alias = "s")]
    Scan {
        /// The file to scan.
        #[arg(required = true)]
        input: PathBuf,

        /// Configuration document (TOML). Defaults are used if omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides `store_directory` from the configuration document.
        #[arg(long)]
        store: Option<PathBuf>,

        /// Overrides `threads` from the configuration document.
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Walk a finished meta-directory store and emit YARA-style scan
    /// rules for every `elf`/`dex`-labeled entry.
    #[command(alias = "r")]
    Rules {
        /// The meta-directory store to walk (as produced by `scan`).
        #[arg(required = true)]
        store: PathBuf,

        /// Configuration document (TOML). Defaults are used if omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides `yara_directory` from the configuration document.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Optional low-quality identifier denylist (JSON).
        #[arg(short, long)]
        identifiers: Option<PathBuf>,
    },
}

/// Parses `std::env::args()` into a [`Command`].
pub fn run() -> Result<Command, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_subcommand_parses_required_input() {
        let args = Args::parse_from(["triagekit", "scan", "firmware.bin"]);
        match args.command {
            Command::Scan { input, .. } => assert_eq!(input, PathBuf::from("firmware.bin")),
            _ => panic!("expected Scan"),
        }
    }

    #[test]
    fn rules_subcommand_parses_required_store() {
        let args = Args::parse_from(["triagekit", "rules", "store-dir", "-o", "out"]);
        match args.command {
            Command::Rules { store, output, .. } => {
                assert_eq!(store, PathBuf::from("store-dir"));
                assert_eq!(output, Some(PathBuf::from("out")));
            }
            _ => panic!("expected Rules"),
        }
    }
}
