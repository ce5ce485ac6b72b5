//! CLI command definitions and handlers.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod discover;
pub mod fetch;
pub mod send;
pub mod serve;

/// Load configuration with graceful fallback to defaults.
pub fn load_config() -> zimsync_core::config::Config {
    zimsync_core::config::Config::load().unwrap_or_default()
}

/// Resolve a host string and port into a server endpoint.
pub fn endpoint_for(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = host
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid host '{host}': use an IP address"))?;
    Ok(SocketAddr::new(ip, port))
}

/// ZimSync - peer-to-peer LAN file synchronization
#[derive(Parser)]
#[command(name = "zimsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Browse the network for ZimSync peers
    Discover(DiscoverArgs),

    /// Share a directory until interrupted
    Serve(ServeArgs),

    /// Send a diagnostic text message to a peer
    Test(TestArgs),

    /// Probe a peer's catalog for a file
    Send(SendArgs),

    /// Pull a file from a peer, verifying its checksum
    Fetch(FetchArgs),
}

/// Arguments for the discover command
#[derive(Parser)]
pub struct DiscoverArgs {
    /// How many seconds to browse
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,

    /// Emit JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// UDP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory whose immediate files are shared
    #[arg(short, long)]
    pub directory: Option<PathBuf>,

    /// Device name to advertise
    #[arg(short, long)]
    pub name: Option<String>,

    /// Skip mDNS advertisement
    #[arg(long)]
    pub no_advertise: bool,
}

/// Arguments for the test command
#[derive(Parser)]
pub struct TestArgs {
    /// Server host (IP address)
    pub host: String,

    /// Server UDP port
    #[arg(short, long, default_value_t = zimsync_core::DEFAULT_PORT)]
    pub port: u16,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Local file the peer should be asked about
    pub file: PathBuf,

    /// Server host (IP address)
    pub host: String,

    /// Server UDP port
    #[arg(short, long, default_value_t = zimsync_core::DEFAULT_PORT)]
    pub port: u16,
}

/// Arguments for the fetch command
#[derive(Parser)]
pub struct FetchArgs {
    /// Server host (IP address)
    pub host: String,

    /// Name of the shared file to pull
    pub file_name: String,

    /// Server UDP port
    #[arg(short, long, default_value_t = zimsync_core::DEFAULT_PORT)]
    pub port: u16,

    /// Directory to write the file into
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Chunk compression: zlib, lz4, lzma, or none
    #[arg(long, default_value = "zlib")]
    pub compression: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_for() {
        let endpoint = endpoint_for("192.168.1.20", 8080).expect("parse");
        assert_eq!(endpoint.to_string(), "192.168.1.20:8080");

        let endpoint = endpoint_for(" ::1 ", 9000).expect("parse");
        assert_eq!(endpoint.port(), 9000);

        assert!(endpoint_for("studio.local", 8080).is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
