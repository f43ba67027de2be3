//! Gangway - container network provisioning for Linux
//!
//! A thin CLI over the gangway library: networks, address allocation and
//! route queries.

mod cli;

use cli::{Cli, Commands, IpamAction, NetworkAction, RouteAction};
use gangway::netlink::{NetlinkSocket, route};
use gangway::network::{Ipam, NetworkManager};
use gangway::{Result, manifest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "gangway=debug" } else { "gangway=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            return Ok(());
        }
        _ => manifest::load(&cli.config)?,
    };

    match cli.command {
        Commands::Network { action } => {
            let mut manager = NetworkManager::init(&config)?;
            match action {
                NetworkAction::Create {
                    name,
                    subnet,
                    driver,
                } => {
                    let network = manager.create_network(&driver, &subnet, &name)?;
                    println!(
                        "Created network '{}' ({}, gateway {})",
                        network.name,
                        network.subnet(),
                        network.gateway()
                    );
                }
                NetworkAction::List { json } => {
                    let networks: Vec<_> = manager.networks().collect();
                    if json {
                        let out = serde_json::to_string_pretty(&networks)
                            .map_err(std::io::Error::from)?;
                        println!("{}", out);
                    } else if networks.is_empty() {
                        println!("No networks configured");
                    } else {
                        println!("{:<16} {:<20} {:<16} DRIVER", "NAME", "SUBNET", "GATEWAY");
                        for network in networks {
                            println!(
                                "{:<16} {:<20} {:<16} {}",
                                network.name,
                                network.subnet().to_string(),
                                network.gateway().to_string(),
                                network.driver_name
                            );
                        }
                    }
                }
                NetworkAction::Remove { name } => {
                    manager.remove_network(&name)?;
                    println!("Removed network '{}'", name);
                }
            }
        }

        Commands::Ipam { action } => {
            let ipam = Ipam::new(config.paths.ipam_file.clone());
            match action {
                IpamAction::Allocate { subnet } => {
                    println!("{}", ipam.allocate(&subnet)?);
                }
                IpamAction::Release { subnet, ip } => {
                    ipam.release(&subnet, ip)?;
                    println!("Released {} from {}", ip, subnet.trunc());
                }
            }
        }

        Commands::Route { action } => {
            let sock = NetlinkSocket::open_with_timeout(config.netlink.timeout())?;
            match action {
                RouteAction::List => {
                    println!("{:<20} {:<16} DEFAULT", "DESTINATION", "INTERFACE");
                    for r in route::routes(&sock)? {
                        let destination = match (r.destination, r.is_default) {
                            (Some(net), _) => net.to_string(),
                            (None, true) => "default".to_string(),
                            (None, false) => "-".to_string(),
                        };
                        let interface = r.interface.map(|l| l.name).unwrap_or_else(|| "-".into());
                        println!(
                            "{:<20} {:<16} {}",
                            destination,
                            interface,
                            if r.is_default { "yes" } else { "" }
                        );
                    }
                }
                RouteAction::Default => {
                    let link = route::default_route_interface(&sock)?;
                    println!(
                        "{} (index {}, mtu {})",
                        link.name,
                        link.index,
                        link.mtu.unwrap_or(route::FALLBACK_MTU)
                    );
                }
            }
        }

        Commands::Completion { .. } => {}
    }

    Ok(())
}
