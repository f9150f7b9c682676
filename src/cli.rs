use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// lian-winget - winget 命令行封装
#[derive(Parser)]
#[command(name = "lian-winget")]
#[command(about = "Run winget operations with live output and Ctrl-C cancellation")]
#[command(version)]
pub struct Cli {
    /// 使用指定的配置文件，而不是 ~/.config/lian-winget/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List installed packages as JSON
    List {
        /// Skip `--output json` and parse the text table directly
        #[arg(long)]
        text: bool,
    },
    /// Upgrade one package by id
    Upgrade {
        id: String,
        /// Display name attached to streamed events
        #[arg(long)]
        name: Option<String>,
        /// Token used to cancel this run (defaults to cli-<pid>)
        #[arg(long)]
        track_id: Option<String>,
    },
    /// Upgrade every package with an available update
    UpgradeAll {
        #[arg(long)]
        track_id: Option<String>,
    },
    /// Uninstall one package by id
    Uninstall {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        track_id: Option<String>,
    },
    /// Resolve an InstallLocation-style path to a directory
    ResolveDir {
        raw: String,
    },
    /// Derive an install directory from an uninstall or icon command line
    DeriveDir {
        command: String,
    },
}
