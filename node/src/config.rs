use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};
use tracing::Level;

use trefoil_core::params::Params;
use trefoil_core::peer_manager::PeerManagerConfig;
use trefoil_core::types::NetAddress;

use crate::cli::{CliOpts, Network};

mod tracing_level_format {
	use serde::{de::Error, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(D::Error::custom)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
	pub network: Network,
	/// Local interface the listener binds to.
	pub bind_address: String,
	/// Listen port; the chain's default port when unset.
	pub port: Option<u16>,
	/// Dial this peer directly and skip the seed-driven dialer.
	pub connect: Option<String>,
	/// Bootstrap seed addresses, `ip` or `ip:port`.
	pub seeds: Vec<String>,
	/// Log level, default is `INFO`.
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If true, logs are emitted as JSON for structured logging.
	pub log_format_json: bool,
	#[serde(flatten)]
	pub peer_manager: PeerManagerConfig,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			network: Network::Testnet,
			bind_address: "0.0.0.0".to_owned(),
			port: None,
			connect: None,
			seeds: vec![],
			log_level: Level::INFO,
			log_format_json: false,
			peer_manager: PeerManagerConfig::default(),
		}
	}
}

impl RuntimeConfig {
	pub fn params(&self) -> Params {
		match self.network {
			Network::Mainnet => Params::mainnet(),
			Network::Testnet => Params::testnet(),
		}
	}

	/// Applies CLI option overrides to the runtime configuration
	pub fn apply_opts(&mut self, opts: &CliOpts) -> Result<()> {
		self.log_format_json = opts.logs_json || self.log_format_json;
		self.log_level = opts.verbosity.unwrap_or(self.log_level);

		if let Some(network) = opts.network {
			self.network = network;
		}
		if let Some(port) = opts.port {
			self.port = Some(port);
		}
		if let Some(connect) = &opts.connect {
			self.connect = Some(connect.clone());
		}
		if !opts.seeds.is_empty() {
			self.seeds = opts.seeds.clone();
		}
		if let Some(local_address) = &opts.local_address {
			self.peer_manager.local_address = Some(
				local_address
					.parse()
					.wrap_err("Unable to parse local address")?,
			);
		}
		Ok(())
	}

	/// Seed list with the chain's default port filled in for bare IPs.
	pub fn seed_addresses(&self, params: &Params) -> Result<Vec<NetAddress>> {
		self.seeds
			.iter()
			.map(|seed| {
				if let Ok(address) = seed.parse::<NetAddress>() {
					return Ok(address);
				}
				let ip = seed
					.parse::<std::net::IpAddr>()
					.wrap_err_with(|| format!("Unable to parse seed address: {seed}"))?;
				Ok(NetAddress::new(ip, params.default_port))
			})
			.collect()
	}
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg: RuntimeConfig = if let Some(cfg_path) = &opts.config {
		confy::load_path(cfg_path)
			.wrap_err_with(|| format!("Failed to load configuration from: {cfg_path}"))?
	} else {
		RuntimeConfig::default()
	};
	cfg.apply_opts(opts)?;
	Ok(cfg)
}
