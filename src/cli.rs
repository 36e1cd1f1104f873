use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vbox-sync",
    version,
    about = "Sync VirtualBox images and launch them in per-user homes"
)]
pub struct Cli {
    /// Path to config file (default: user config dir, then /etc)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Image repository base URL (overrides config)
    #[arg(long, global = true)]
    pub baseurl: Option<String>,

    /// Local image directory (overrides config)
    #[arg(long, global = true)]
    pub target: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch an image and its config from the repository
    Sync {
        /// Image name
        name: String,
        /// Image version
        version: String,
    },

    /// Register a synced image with VirtualBox and start it
    Invoke {
        /// Image name
        name: String,
        /// Image version
        version: String,
    },

    /// Write the parameter section for an existing VM
    Makecfg {
        /// Name or UUID of the VM
        vm: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// VirtualBox home to query [default: ~/.VirtualBox]
        #[arg(long)]
        home: Option<PathBuf>,
    },
}
