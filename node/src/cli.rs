use clap::{Parser, ValueEnum};
use tracing::Level;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
	Mainnet,
	Testnet,
}

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Chain to join
	#[arg(long, value_enum)]
	pub network: Option<Network>,
	/// P2P listen port
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Connect to this peer directly instead of running the dialer
	#[arg(long)]
	pub connect: Option<String>,
	/// Seed address; may be given multiple times
	#[arg(long = "seed")]
	pub seeds: Vec<String>,
	/// Externally reachable address to announce to peers
	#[arg(long)]
	pub local_address: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}
