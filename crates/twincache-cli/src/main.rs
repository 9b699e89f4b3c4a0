//! # twinctl
//!
//! Inspection and self-test tool for the twincache coherency layer.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use twincache_config::logging::init_logging;
use twincache_config::{log_cli_debug, Config, PROJECT_CONFIG_PATH};

mod flags;
mod selftest;

/// twincache control tool
#[derive(Parser)]
#[command(name = "twinctl")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect and validate inode attribute flag words
    Flags {
        #[command(subcommand)]
        command: FlagsCommands,
    },

    /// Run the mmap coherency scenario against the in-memory engine
    Selftest,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default project config
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print config file locations
    Path,
}

#[derive(Subcommand)]
enum FlagsCommands {
    /// List the flag names set in a word
    Decode {
        /// Flag word, decimal or 0x-prefixed hex
        #[arg(value_name = "WORD", value_parser = flags::parse_word)]
        word: u32,
    },

    /// Check whether a set-flags request would be accepted
    Check {
        /// Requested flag word, decimal or 0x-prefixed hex
        #[arg(value_name = "WORD", value_parser = flags::parse_word)]
        word: u32,

        /// Make the request as an unprivileged non-owner
        #[arg(long)]
        non_owner: bool,
    },
}

fn main() -> Result<()> {
    let config = twincache_config::config().clone();
    init_logging(config.logging.log_level());

    let cli = Cli::parse();
    log_cli_debug!("Starting twinctl");

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd_config_show(&config),
            ConfigCommands::Init { force } => {
                cmd_config_init(Path::new(PROJECT_CONFIG_PATH), force)
            }
            ConfigCommands::Path => cmd_config_path(),
        },
        Commands::Flags { command } => match command {
            FlagsCommands::Decode { word } => flags::cmd_decode(word),
            FlagsCommands::Check { word, non_owner } => flags::cmd_check(word, non_owner),
        },
        Commands::Selftest => selftest::cmd_selftest(&config),
    }
}

fn cmd_config_show(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{}", rendered);
    Ok(())
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_config_path() -> Result<()> {
    match Config::global_config_path() {
        Some(path) => println!("Global:  {}", path.display()),
        None => println!("Global:  (no home directory)"),
    }
    println!("Project: {}", PROJECT_CONFIG_PATH);
    Ok(())
}
