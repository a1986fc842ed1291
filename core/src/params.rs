//! Chain parameters, selected once at startup and threaded through
//! construction. There is deliberately no global singleton: everything that
//! needs a parameter takes a [`Params`] value.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
	/// Wire magic carried in the version handshake; a mismatch means the
	/// peer runs a different network and is disconnected.
	pub magic: u32,
	/// Port assumed for seed addresses that come without one.
	pub default_port: u16,
	pub protocol_version: u32,
	/// Max amount of money allowed in one output, and in a whole output side.
	pub max_money: u64,
	/// Capacity of transactions in a block.
	pub block_capacity: usize,
	/// Target seconds per milestone block.
	pub time_interval: u64,
	/// A node whose best milestone is younger than this many seconds is
	/// considered synced.
	pub sync_time_threshold: u64,
}

impl Params {
	pub fn mainnet() -> Self {
		Params {
			magic: 0x5452_464c,
			default_port: 7877,
			protocol_version: 1,
			max_money: 9_999_999_999,
			block_capacity: 128,
			time_interval: 10,
			sync_time_threshold: 300,
		}
	}

	pub fn testnet() -> Self {
		Params {
			magic: 0x5452_4654,
			default_port: 17877,
			protocol_version: 10,
			max_money: 9_999_999_999,
			block_capacity: 128,
			time_interval: 10,
			sync_time_threshold: 300,
		}
	}
}
