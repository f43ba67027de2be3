//! Command-line interface for Gangway
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gangway::manifest::DEFAULT_CONFIG_PATH;
use gangway::network::BRIDGE_DRIVER;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Gangway - container network provisioning for Linux
#[derive(Parser)]
#[command(name = "gangway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Network management
    Network {
        #[command(subcommand)]
        action: NetworkAction,
    },

    /// Address allocation
    Ipam {
        #[command(subcommand)]
        action: IpamAction,
    },

    /// Routing table queries
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Network management actions
#[derive(Subcommand)]
pub enum NetworkAction {
    /// Create a network (the bridge device takes the network's name)
    Create {
        /// Network name
        name: String,

        /// Subnet in CIDR notation (e.g., 192.168.0.0/24)
        #[arg(short, long)]
        subnet: Ipv4Net,

        /// Network driver
        #[arg(short, long, default_value = BRIDGE_DRIVER)]
        driver: String,
    },

    /// List all networks
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove a network and its bridge
    Remove {
        /// Network name
        name: String,
    },
}

/// Address allocation actions
#[derive(Subcommand)]
pub enum IpamAction {
    /// Allocate the lowest free address in a subnet
    Allocate {
        /// Subnet in CIDR notation
        subnet: Ipv4Net,
    },

    /// Release an allocated address
    Release {
        /// Subnet in CIDR notation
        subnet: Ipv4Net,

        /// Address to release
        ip: Ipv4Addr,
    },
}

/// Routing table actions
#[derive(Subcommand)]
pub enum RouteAction {
    /// Show the IPv4 main routing table
    List,

    /// Show the default route's interface and MTU
    Default,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "gangway", &mut std::io::stdout());
    }
}
