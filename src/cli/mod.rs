use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(about = "Move a messaging account between two devices on the local network", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML file with transfer settings
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Network interface to use instead of the first wireless one
    #[arg(long, short = 'i', global = true, conflicts_with = "address")]
    pub interface: Option<String>,

    /// Local address to bind (e.g. 127.0.0.1 for a same-host test)
    #[arg(long, global = true)]
    pub address: Option<IpAddr>,

    /// Warn when the peer has not taken a unit for this long (e.g. "30s")
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub slow_consumer_after: Option<Duration>,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Offer this device's account to another device
    Send {
        /// Account store directory
        #[arg(long, short = 's')]
        store: PathBuf,

        /// Signed-in account id
        #[arg(long, short = 'u')]
        user: String,

        /// Only send these conversations (repeatable)
        #[arg(long = "conversation", value_name = "ID")]
        conversations: Vec<String>,

        /// Only send messages created at or after this time (RFC 3339)
        #[arg(long, value_parser = humantime::parse_rfc3339_weak)]
        since: Option<SystemTime>,
    },

    /// Import an account offered by another device
    Receive {
        /// Account store directory to import into
        #[arg(long, short = 's')]
        store: PathBuf,

        /// Signed-in account id, must match the sender's
        #[arg(long, short = 'u')]
        user: String,

        /// Sender's address
        #[arg(long)]
        host: IpAddr,

        /// Sender's port
        #[arg(long, short = 'p')]
        port: u16,

        /// Pairing code shown by the sender
        #[arg(long)]
        code: u32,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_args() {
        let cli = Cli::try_parse_from([
            "handoff", "receive", "--store", "/tmp/acct", "--user", "u-1", "--host",
            "192.168.1.20", "--port", "40123", "--code", "004217", "--slow-consumer-after", "1m",
        ])
        .unwrap();
        assert_eq!(cli.slow_consumer_after, Some(Duration::from_secs(60)));
        match cli.command {
            Commands::Receive { port, code, .. } => {
                assert_eq!(port, 40123);
                assert_eq!(code, 4217);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_send_filter_args() {
        let cli = Cli::try_parse_from([
            "handoff", "send", "--store", "s", "--user", "u", "--conversation", "c-1",
            "--conversation", "c-2", "--since", "2024-01-01T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Send { conversations, since, .. } => {
                assert_eq!(conversations, vec!["c-1", "c-2"]);
                assert_eq!(since, Some(humantime::parse_rfc3339("2024-01-01T00:00:00Z").unwrap()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_interface_and_address_conflict() {
        let result = Cli::try_parse_from([
            "handoff", "send", "--store", "s", "--user", "u", "--interface", "wlan0",
            "--address", "127.0.0.1",
        ]);
        assert!(result.is_err());
    }
}
