use bytes::Bytes;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::types::{wire_config, Block, NetAddress, Transaction};

/// Hard cap on the address list of a single ADDR message. Messages above
/// the cap are dropped whole.
pub const MAX_ADDRESS_SIZE: usize = 1000;

/// First message on every connection, in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionInfo {
	pub magic: u32,
	pub protocol_version: u32,
	/// Random identity of the sending node, used to catch self-connects.
	pub node_id: u64,
	pub best_milestone_height: u64,
	/// The remote endpoint as the sender sees it.
	pub address_you: NetAddress,
	/// The endpoint the sender believes it is reachable on. Self-reported,
	/// treat as advisory.
	pub address_me: NetAddress,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddressMessage {
	pub addresses: Vec<NetAddress>,
}

/// A batch of blocks rooted at a milestone, served during initial sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bundle {
	pub milestone_height: u64,
	pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NetMessage {
	Version(VersionInfo),
	VerAck,
	Ping { nonce: u64 },
	Pong { nonce: u64 },
	Block(Block),
	Tx(Transaction),
	Addr(AddressMessage),
	GetBundle { from_height: u64 },
	Bundle(Bundle),
}

impl NetMessage {
	pub fn encode(&self) -> Result<Bytes> {
		Ok(Bytes::from(bincode::serde::encode_to_vec(self, wire_config())?))
	}

	pub fn decode(bytes: &[u8]) -> Result<NetMessage> {
		let (message, _) = bincode::serde::decode_from_slice(bytes, wire_config())?;
		Ok(message)
	}

	/// Short tag for logs.
	pub fn kind(&self) -> &'static str {
		match self {
			NetMessage::Version(_) => "version",
			NetMessage::VerAck => "verack",
			NetMessage::Ping { .. } => "ping",
			NetMessage::Pong { .. } => "pong",
			NetMessage::Block(_) => "block",
			NetMessage::Tx(_) => "tx",
			NetMessage::Addr(_) => "addr",
			NetMessage::GetBundle { .. } => "getbundle",
			NetMessage::Bundle(_) => "bundle",
		}
	}
}
