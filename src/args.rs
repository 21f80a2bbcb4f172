use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "roomcall-core")]
#[command(version = "0.1.0")]
#[command(about = "Two-party WebRTC call session controller", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/roomcall-core.toml")]
    pub config: PathBuf,

    /// Room to join
    #[arg(short, long)]
    pub room: String,

    /// Local user id (random when omitted)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Signaling relay URL override
    #[arg(short, long)]
    pub server: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
